//! Checkpoint persistence
//!
//! A checkpoint is a single safetensors file holding the model weights
//! (`model.<var>`), the AdamW moments (`optim.m.<var>`, `optim.v.<var>`) and,
//! in the header metadata, the step counter and the run configuration.
//! Files are written to a temp file in the destination directory and renamed
//! into place, so readers only ever see complete checkpoints.

use crate::error::{poisoned_var_map, Error, Result};
use crate::loss::LossKind;
use crate::model::Config;
use crate::optim::OptimizerState;
use candle_core::safetensors::Load;
use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use safetensors::SafeTensors;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

pub const CHECKPOINT_FILENAME: &str = "model_last.safetensors";
pub const CHECKPOINT_FORMAT: &str = "reward-model-rs/1";

const MODEL_PREFIX: &str = "model.";
const FIRST_MOMENT_PREFIX: &str = "optim.m.";
const SECOND_MOMENT_PREFIX: &str = "optim.v.";
const META_FORMAT: &str = "format";
const META_STEP: &str = "step";
const META_OPTIM_STEP: &str = "optim_step";
const META_CONFIG: &str = "config";

/// Configuration stored alongside the weights
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(flatten)]
    pub model: Config,
    pub loss: LossKind,
    pub margin: f32,
}

pub struct Checkpoint {
    pub config: CheckpointConfig,
    pub step: usize,
    pub weights: HashMap<String, Tensor>,
    pub optimizer: Option<OptimizerState>,
}

/// Default checkpoint location inside a run directory
pub fn checkpoint_path<P: AsRef<Path>>(out_dir: P) -> PathBuf {
    out_dir.as_ref().join(CHECKPOINT_FILENAME)
}

impl Checkpoint {
    /// Snapshots every variable of `varmap`.
    pub fn from_varmap(
        varmap: &VarMap,
        config: CheckpointConfig,
        step: usize,
        optimizer: Option<OptimizerState>,
    ) -> Result<Self> {
        let data = varmap.data().lock().map_err(poisoned_var_map)?;
        let weights = data
            .iter()
            .map(|(name, var)| Ok((name.clone(), var.as_tensor().copy()?)))
            .collect::<Result<HashMap<_, _>>>()?;
        Ok(Self {
            config,
            step,
            weights,
            optimizer,
        })
    }

    /// Writes the checkpoint atomically, replacing any previous file at `path`.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let io_err = |e: &dyn std::fmt::Display| Error::checkpoint_io(path, e);

        let mut tensors: Vec<(String, &Tensor)> = self
            .weights
            .iter()
            .map(|(name, tensor)| (format!("{MODEL_PREFIX}{name}"), tensor))
            .collect();
        let mut metadata = HashMap::from([
            (META_FORMAT.to_string(), CHECKPOINT_FORMAT.to_string()),
            (META_STEP.to_string(), self.step.to_string()),
            (
                META_CONFIG.to_string(),
                serde_json::to_string(&self.config).map_err(|e| io_err(&e))?,
            ),
        ]);
        if let Some(state) = &self.optimizer {
            metadata.insert(META_OPTIM_STEP.to_string(), state.step_t.to_string());
            tensors.extend(
                state
                    .first_moments
                    .iter()
                    .map(|(name, m)| (format!("{FIRST_MOMENT_PREFIX}{name}"), m)),
            );
            tensors.extend(
                state
                    .second_moments
                    .iter()
                    .map(|(name, v)| (format!("{SECOND_MOMENT_PREFIX}{name}"), v)),
            );
        }
        let bytes = safetensors::serialize(tensors, Some(metadata)).map_err(|e| io_err(&e))?;

        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent).map_err(|e| io_err(&e))?;
        let mut tmp = NamedTempFile::new_in(parent).map_err(|e| io_err(&e))?;
        tmp.write_all(&bytes).map_err(|e| io_err(&e))?;
        tmp.as_file().sync_all().map_err(|e| io_err(&e))?;
        tmp.persist(path).map_err(|e| io_err(&e.error))?;

        info!(path = %path.display(), step = self.step, "Saved checkpoint");
        Ok(())
    }

    /// Reads a checkpoint written by `save`, placing tensors on `device`.
    pub fn load<P: AsRef<Path>>(path: P, device: &Device) -> Result<Self> {
        Self::read(path.as_ref(), device, true)
    }

    /// Like [`Checkpoint::load`] but leaves the optimizer moments on disk.
    pub fn load_weights<P: AsRef<Path>>(path: P, device: &Device) -> Result<Self> {
        Self::read(path.as_ref(), device, false)
    }

    fn read(path: &Path, device: &Device, with_optimizer: bool) -> Result<Self> {
        let io_err = |e: &dyn std::fmt::Display| Error::checkpoint_io(path, e);

        let bytes = fs::read(path).map_err(|e| io_err(&e))?;
        let (_, header) = SafeTensors::read_metadata(&bytes).map_err(|e| io_err(&e))?;
        let metadata = header
            .metadata()
            .clone()
            .ok_or_else(|| io_err(&"missing header metadata"))?;
        let meta = |key: &str| {
            metadata
                .get(key)
                .ok_or_else(|| io_err(&format!("missing `{key}` metadata")))
        };
        let format = meta(META_FORMAT)?;
        if format != CHECKPOINT_FORMAT {
            return Err(io_err(&format!("unsupported checkpoint format `{format}`")));
        }
        let step: usize = meta(META_STEP)?
            .parse()
            .map_err(|e| io_err(&format!("bad step: {e}")))?;
        let config: CheckpointConfig = serde_json::from_str(meta(META_CONFIG)?)
            .map_err(|e| io_err(&format!("bad config: {e}")))?;
        config
            .model
            .validate()
            .map_err(|e| io_err(&format!("bad config: {e}")))?;

        let tensors = SafeTensors::deserialize(&bytes).map_err(|e| io_err(&e))?;
        let mut weights = HashMap::new();
        let mut first_moments = HashMap::new();
        let mut second_moments = HashMap::new();
        for (name, view) in tensors.iter() {
            if !with_optimizer && !name.starts_with(MODEL_PREFIX) {
                continue;
            }
            let (target, var) = if let Some(var) = name.strip_prefix(MODEL_PREFIX) {
                (&mut weights, var)
            } else if let Some(var) = name.strip_prefix(FIRST_MOMENT_PREFIX) {
                (&mut first_moments, var)
            } else if let Some(var) = name.strip_prefix(SECOND_MOMENT_PREFIX) {
                (&mut second_moments, var)
            } else {
                debug!(tensor = %name, "Ignoring unknown checkpoint tensor");
                continue;
            };
            let tensor = view
                .load(device)
                .map_err(|e| io_err(&format!("tensor `{name}`: {e}")))?;
            target.insert(var.to_string(), tensor);
        }

        let optimizer = match metadata.get(META_OPTIM_STEP) {
            Some(step_t) if with_optimizer => Some(OptimizerState {
                step_t: step_t
                    .parse()
                    .map_err(|e| io_err(&format!("bad optim_step: {e}")))?,
                first_moments,
                second_moments,
            }),
            _ => None,
        };
        debug!(path = %path.display(), step, n_weights = weights.len(), "Loaded checkpoint");
        Ok(Self {
            config,
            step,
            weights,
            optimizer,
        })
    }

    /// Copies the stored weights into the matching variables of `varmap`.
    ///
    /// Every variable must be present with the same shape.
    pub fn restore_weights(&self, varmap: &VarMap, path: &Path) -> Result<()> {
        let data = varmap.data().lock().map_err(poisoned_var_map)?;
        for (name, var) in data.iter() {
            let tensor = self.weights.get(name).ok_or_else(|| {
                Error::checkpoint_io(path, format!("missing weight `{name}`"))
            })?;
            if tensor.dims() != var.dims() {
                return Err(Error::checkpoint_io(
                    path,
                    format!(
                        "weight `{name}` has shape {:?}, expected {:?}",
                        tensor.dims(),
                        var.dims()
                    ),
                ));
            }
            let tensor = tensor.to_device(var.device())?.to_dtype(var.dtype())?;
            var.set(&tensor)?;
        }
        Ok(())
    }
}
