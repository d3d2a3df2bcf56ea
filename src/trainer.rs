//! Reward model training loop
//!
//! `Trainer` owns the model, optimizer and data for one run and moves through
//! `Init -> Running -> (Checkpointed -> Running)* -> Done | Failed`.

use crate::checkpoint::{checkpoint_path, Checkpoint, CheckpointConfig};
use crate::collator::{PairwiseCollator, PreferenceDataLoader};
use crate::data::{PreferenceDataset, PreferenceSource, Split};
use crate::error::{Error, Result};
use crate::loss::{LossKind, PairwiseLoss, PreferenceMetrics, DEFAULT_MARGIN};
use crate::model::{Config, Pooling, RewardModel};
use crate::optim::{clip_grad_norm, AdamW};
use crate::tokenizer::TokenizerAdapter;
use candle_core::{DType, Device};
use candle_nn::{Optimizer, ParamsAdamW, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const LOG_EVERY: usize = 10;

/// Options of a training run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    pub steps: usize,
    pub batch_size: usize,
    pub block_size: usize,
    pub n_layer: usize,
    pub n_head: usize,
    pub n_embd: usize,
    pub drop_rate: f32,
    pub pooling: Pooling,
    pub loss: LossKind,
    pub margin: f32,
    pub lr: f64,
    pub weight_decay: f64,
    pub grad_clip: Option<f64>,
    /// Checkpoint interval in steps; `0` only writes the final checkpoint.
    pub checkpoint_every: usize,
    pub seed: u64,
    pub out_dir: PathBuf,
    pub split: String,
    pub limit: Option<usize>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        let model = Config::rm_demo();
        Self {
            steps: 300,
            batch_size: 8,
            block_size: model.block_size,
            n_layer: model.n_layer,
            n_head: model.n_head,
            n_embd: model.n_embd,
            drop_rate: model.drop_rate,
            pooling: model.pooling,
            loss: LossKind::BradleyTerry,
            margin: DEFAULT_MARGIN,
            lr: 0.0004,
            weight_decay: 0.1,
            grad_clip: Some(1.0),
            checkpoint_every: 100,
            seed: 42,
            out_dir: PathBuf::from("runs/rm-demo"),
            split: "train".to_string(),
            limit: None,
        }
    }
}

impl TrainConfig {
    /// Model configuration for a tokenizer with `vocab_size` entries
    pub fn model_config(&self, vocab_size: usize) -> Config {
        Config {
            vocab_size,
            block_size: self.block_size,
            n_layer: self.n_layer,
            n_head: self.n_head,
            n_embd: self.n_embd,
            drop_rate: self.drop_rate,
            qkv_bias: false,
            pooling: self.pooling,
        }
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        checkpoint_path(&self.out_dir)
    }

    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::invalid_config("batch_size must be positive"));
        }
        if !(self.lr.is_finite() && self.lr > 0.) {
            return Err(Error::invalid_config(format!(
                "lr must be positive, got {}",
                self.lr
            )));
        }
        if let Some(max_norm) = self.grad_clip {
            if !(max_norm > 0.) {
                return Err(Error::invalid_config("grad_clip must be positive"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerState {
    Init,
    Running,
    Checkpointed,
    Done,
    Failed,
}

impl Display for TrainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TrainerState::Init => "INIT",
            TrainerState::Running => "RUNNING",
            TrainerState::Checkpointed => "CHECKPOINTED",
            TrainerState::Done => "DONE",
            TrainerState::Failed => "FAILED",
        };
        write!(f, "{name}")
    }
}

/// Cooperative stop request, checked between training steps
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainSummary {
    pub steps_completed: usize,
    pub final_loss: Option<f32>,
    pub checkpoint: PathBuf,
    pub stopped_early: bool,
}

pub struct Trainer {
    config: TrainConfig,
    tokenizer: Box<dyn TokenizerAdapter>,
    varmap: VarMap,
    model: RewardModel,
    optimizer: AdamW,
    loss: PairwiseLoss,
    loader: PreferenceDataLoader,
    step: usize,
    state: TrainerState,
}

impl Trainer {
    /// Builds the model, optimizer and training split for a fresh run.
    pub fn new(
        config: TrainConfig,
        tokenizer: Box<dyn TokenizerAdapter>,
        source: &PreferenceSource,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        let model_cfg = config.model_config(tokenizer.vocab_size());
        model_cfg.validate()?;
        let loss = PairwiseLoss::new(config.loss, config.margin)?;

        let split: Split = config.split.parse()?;
        let dataset = PreferenceDataset::load(source, &split, config.limit)?;
        if dataset.is_empty() {
            return Err(Error::DataSource {
                source_name: source.name(),
                reason: format!("split `{split}` has no examples"),
            });
        }
        info!(
            source = %source.name(),
            %split,
            examples = dataset.len(),
            "Loaded training split"
        );

        let collator = PairwiseCollator::new()
            .block_size(config.block_size)
            .pad_token_id(tokenizer.pad_token_id())
            .device(device.clone());
        let loader = PreferenceDataLoader::new(dataset, collator, config.batch_size, config.seed);

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = RewardModel::new(model_cfg, vb)?;
        let optimizer = AdamW::from_varmap(
            &varmap,
            ParamsAdamW {
                lr: config.lr,
                weight_decay: config.weight_decay,
                ..Default::default()
            },
        )?;
        debug!(config = ?model_cfg, "Built reward model");

        Ok(Self {
            config,
            tokenizer,
            varmap,
            model,
            optimizer,
            loss,
            loader,
            step: 0,
            state: TrainerState::Init,
        })
    }

    /// Continues a run from the checkpoint at `path`: weights, optimizer
    /// moments and step counter are restored, and the batch order picks up
    /// where the checkpointed run left it.
    pub fn resume<P: AsRef<Path>>(
        path: P,
        config: TrainConfig,
        tokenizer: Box<dyn TokenizerAdapter>,
        source: &PreferenceSource,
        device: &Device,
    ) -> Result<Self> {
        let path = path.as_ref();
        let ckpt = Checkpoint::load(path, device)?;
        let mut trainer = Self::new(config, tokenizer, source, device)?;
        if !trainer.model.cfg().is_compatible_with(&ckpt.config.model) {
            return Err(Error::invalid_config(format!(
                "checkpoint {} was trained with an incompatible model configuration",
                path.display()
            )));
        }
        ckpt.restore_weights(&trainer.varmap, path)?;
        match &ckpt.optimizer {
            Some(state) => trainer
                .optimizer
                .import_state(state)
                .map_err(|e| Error::checkpoint_io(path, e))?,
            None => warn!(
                path = %path.display(),
                "Checkpoint has no optimizer state, moments start at zero"
            ),
        }
        trainer.step = ckpt.step;
        trainer.loader.skip_batches(ckpt.step);
        info!(path = %path.display(), step = trainer.step, "Resumed training");
        Ok(trainer)
    }

    pub fn state(&self) -> TrainerState {
        self.state
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    fn transition(&mut self, to: TrainerState) {
        debug!(from = %self.state, %to, "Trainer state transition");
        self.state = to;
    }

    /// Trains until `config.steps` is reached or `stop` is raised.
    ///
    /// A final checkpoint is always written on success. On failure the trainer
    /// ends in `Failed` and no new checkpoint is written.
    pub fn run(&mut self, stop: &StopSignal) -> Result<TrainSummary> {
        if matches!(self.state, TrainerState::Done | TrainerState::Failed) {
            return Err(Error::invalid_config(format!(
                "trainer already finished in state {}",
                self.state
            )));
        }
        self.transition(TrainerState::Running);
        match self.run_steps(stop) {
            Ok(summary) => {
                self.transition(TrainerState::Done);
                info!(
                    steps = summary.steps_completed,
                    loss = ?summary.final_loss,
                    stopped_early = summary.stopped_early,
                    "Training finished"
                );
                Ok(summary)
            }
            Err(e) => {
                self.transition(TrainerState::Failed);
                error!(step = self.step, kind = e.kind(), "Training failed: {e}");
                Err(e)
            }
        }
    }

    fn run_steps(&mut self, stop: &StopSignal) -> Result<TrainSummary> {
        let mut final_loss = None;
        let mut stopped_early = false;
        while self.step < self.config.steps {
            if stop.is_stopped() {
                warn!(step = self.step, "Stop requested, writing final checkpoint");
                stopped_early = true;
                break;
            }
            final_loss = Some(self.train_step()?);
            let every = self.config.checkpoint_every;
            if every > 0 && self.step % every == 0 && self.step < self.config.steps {
                self.checkpoint()?;
            }
        }
        let checkpoint = self.checkpoint()?;
        Ok(TrainSummary {
            steps_completed: self.step,
            final_loss,
            checkpoint,
            stopped_early,
        })
    }

    fn train_step(&mut self) -> Result<f32> {
        let step = self.step + 1;
        let batch = self.loader.train_batch(&*self.tokenizer)?;
        let (chosen, rejected) = self.model.score_pair(&batch, true)?;
        let loss = self.loss.compute(&chosen, &rejected)?;
        let loss_value = loss.to_scalar::<f32>()?;
        if !loss_value.is_finite() {
            return Err(Error::NumericalInstability {
                step,
                loss: loss_value,
            });
        }

        let mut grads = loss.backward()?;
        if let Some(max_norm) = self.config.grad_clip {
            let norm = clip_grad_norm(&mut grads, &self.optimizer.vars(), max_norm)?;
            debug!(step, grad_norm = norm, "Gradient norm");
        }
        self.optimizer.step(&grads)?;
        self.step = step;

        let metrics = PreferenceMetrics::from_scores(&chosen, &rejected)?;
        if step == 1 || step % LOG_EVERY == 0 || step == self.config.steps {
            info!(
                step,
                loss = loss_value,
                accuracy = metrics.accuracy,
                margin = metrics.mean_margin,
                "Train step"
            );
        } else {
            debug!(
                step,
                loss = loss_value,
                accuracy = metrics.accuracy,
                "Train step"
            );
        }
        Ok(loss_value)
    }

    fn checkpoint(&mut self) -> Result<PathBuf> {
        let path = self.config.checkpoint_path();
        let config = CheckpointConfig {
            model: *self.model.cfg(),
            loss: self.loss.kind(),
            margin: self.loss.margin(),
        };
        let ckpt = Checkpoint::from_varmap(
            &self.varmap,
            config,
            self.step,
            Some(self.optimizer.export_state()?),
        )?;
        ckpt.save(&path)?;
        self.transition(TrainerState::Checkpointed);
        self.transition(TrainerState::Running);
        Ok(path)
    }
}
