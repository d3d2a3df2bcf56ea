//! Error taxonomy for the reward model pipeline

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("preference data source `{source_name}` unavailable: {reason}")]
    DataSource { source_name: String, reason: String },

    #[error("failed to load tokenizer from {path}: {reason}")]
    TokenizerLoad { path: PathBuf, reason: String },

    #[error("tokenization failed: {reason}")]
    Tokenization { reason: String },

    #[error("collation failed: {reason}")]
    Collation { reason: String },

    #[error("non-finite loss {loss} at step {step}")]
    NumericalInstability { step: usize, loss: f32 },

    #[error("checkpoint i/o failed for {path}: {reason}")]
    CheckpointIo { path: PathBuf, reason: String },

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

impl Error {
    /// Name of the error kind, used in user-facing diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::DataSource { .. } => "DataSourceError",
            Error::TokenizerLoad { .. } => "TokenizerLoadError",
            Error::Tokenization { .. } => "TokenizationError",
            Error::Collation { .. } => "CollationError",
            Error::NumericalInstability { .. } => "NumericalInstabilityError",
            Error::CheckpointIo { .. } => "CheckpointIOError",
            Error::InvalidConfig { .. } => "InvalidConfigError",
            Error::Candle(_) => "TensorError",
        }
    }

    pub(crate) fn invalid_config(reason: impl Into<String>) -> Self {
        Error::InvalidConfig {
            reason: reason.into(),
        }
    }

    pub(crate) fn checkpoint_io(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Error::CheckpointIo {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Error for a `VarMap` whose lock was poisoned by a panicking thread.
pub(crate) fn poisoned_var_map<E: std::fmt::Display>(err: E) -> candle_core::Error {
    candle_core::Error::Msg(format!("poisoned var map: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[rstest]
    #[case(Error::Collation { reason: "empty".into() }, "CollationError")]
    #[case(Error::NumericalInstability { step: 3, loss: f32::NAN }, "NumericalInstabilityError")]
    #[case(Error::checkpoint_io("a.safetensors", "boom"), "CheckpointIOError")]
    fn test_error_kind(#[case] err: Error, #[case] expected: &str) {
        assert_eq!(err.kind(), expected);
    }

    #[rstest]
    fn test_numerical_instability_message_names_step() {
        let err = Error::NumericalInstability {
            step: 7,
            loss: f32::INFINITY,
        };
        assert_eq!(err.to_string(), "non-finite loss inf at step 7");
    }
}
