//! Pairwise accuracy of a trained reward model on a held-out split

use crate::checkpoint::Checkpoint;
use crate::collator::{PairwiseCollator, PreferenceDataLoader};
use crate::data::{PreferenceDataset, PreferenceSource, Split};
use crate::error::{Error, Result};
use crate::loss::PreferenceMetrics;
use crate::model::RewardModel;
use crate::tokenizer::TokenizerAdapter;
use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

pub const DEFAULT_EVAL_BATCH_SIZE: usize = 8;

/// Options of an evaluation run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalConfig {
    pub checkpoint: PathBuf,
    pub split: String,
    pub limit: Option<usize>,
    pub batch_size: usize,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            checkpoint: PathBuf::from("runs/rm-demo/model_last.safetensors"),
            split: "test".to_string(),
            limit: None,
            batch_size: DEFAULT_EVAL_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EvalReport {
    /// Fraction of pairs scored `chosen > rejected`
    pub accuracy: f32,
    pub n: usize,
    pub mean_margin: f32,
    pub mean_chosen: f32,
    pub mean_rejected: f32,
}

impl From<PreferenceMetrics> for EvalReport {
    fn from(metrics: PreferenceMetrics) -> Self {
        Self {
            accuracy: metrics.accuracy,
            n: metrics.n,
            mean_margin: metrics.mean_margin,
            mean_chosen: metrics.mean_chosen,
            mean_rejected: metrics.mean_rejected,
        }
    }
}

/// Scores preference pairs with a frozen model
pub struct Evaluator {
    model: RewardModel,
    tokenizer: Box<dyn TokenizerAdapter>,
    device: Device,
    batch_size: usize,
}

impl Evaluator {
    pub fn new(model: RewardModel, tokenizer: Box<dyn TokenizerAdapter>, device: &Device) -> Self {
        Self {
            model,
            tokenizer,
            device: device.clone(),
            batch_size: DEFAULT_EVAL_BATCH_SIZE,
        }
    }

    /// Rebuilds the model from the weights and configuration in a checkpoint.
    ///
    /// Optimizer moments are not read.
    pub fn from_checkpoint<P: AsRef<Path>>(
        path: P,
        tokenizer: Box<dyn TokenizerAdapter>,
        device: &Device,
    ) -> Result<Self> {
        let path = path.as_ref();
        let ckpt = Checkpoint::load_weights(path, device)?;
        let cfg = ckpt.config.model;
        if tokenizer.vocab_size() != cfg.vocab_size {
            return Err(Error::invalid_config(format!(
                "tokenizer has {} tokens but checkpoint expects {}",
                tokenizer.vocab_size(),
                cfg.vocab_size
            )));
        }
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = RewardModel::new(cfg, vb)?;
        ckpt.restore_weights(&varmap, path)?;
        info!(path = %path.display(), step = ckpt.step, "Loaded reward model for evaluation");
        Ok(Self::new(model, tokenizer, device))
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Pairwise accuracy over `split`; ties count as incorrect.
    pub fn evaluate(
        &self,
        source: &PreferenceSource,
        split: &Split,
        limit: Option<usize>,
    ) -> Result<EvalReport> {
        let dataset = PreferenceDataset::load(source, split, limit)?;
        if dataset.is_empty() {
            return Err(Error::Collation {
                reason: format!("split `{split}` has no examples to evaluate"),
            });
        }
        let collator = PairwiseCollator::new()
            .block_size(self.model.cfg().block_size)
            .pad_token_id(self.tokenizer.pad_token_id())
            .device(self.device.clone());
        let loader = PreferenceDataLoader::new(dataset, collator, self.batch_size, 0);

        let mut chosen_scores = vec![];
        let mut rejected_scores = vec![];
        for batch in loader.eval_batches(&*self.tokenizer) {
            let (chosen, rejected) = self.model.score_pair(&batch?, false)?;
            chosen_scores.extend(chosen.detach().to_vec1::<f32>()?);
            rejected_scores.extend(rejected.detach().to_vec1::<f32>()?);
        }

        let report = EvalReport::from(PreferenceMetrics::from_slices(
            &chosen_scores,
            &rejected_scores,
        ));
        info!(
            %split,
            n = report.n,
            accuracy = report.accuracy,
            margin = report.mean_margin,
            "Evaluation finished"
        );
        Ok(report)
    }
}

/// Loads the checkpoint at `checkpoint` and evaluates it on `split`.
pub fn evaluate<P: AsRef<Path>>(
    checkpoint: P,
    source: &PreferenceSource,
    split: &Split,
    limit: Option<usize>,
    tokenizer: Box<dyn TokenizerAdapter>,
    device: &Device,
) -> Result<EvalReport> {
    Evaluator::from_checkpoint(checkpoint, tokenizer, device)?.evaluate(source, split, limit)
}
