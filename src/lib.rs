//! Pairwise preference reward model
//!
//! Trains a small transformer encoder to score `(chosen, rejected)` text pairs
//! so that the preferred completion receives the higher scalar reward.

pub mod attention;
pub mod checkpoint;
pub mod collator;
pub mod data;
pub mod device;
pub mod error;
pub mod evaluator;
pub mod loss;
pub mod model;
pub mod optim;
pub mod tokenizer;
pub mod trainer;

#[cfg(test)]
pub(crate) mod test_utils;

pub use error::{Error, Result};
