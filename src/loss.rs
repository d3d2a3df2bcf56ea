//! Pairwise objectives over chosen/rejected score vectors

use crate::error::{Error, Result};
use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;

pub const DEFAULT_MARGIN: f32 = 1.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LossKind {
    /// `-log sigmoid(chosen - rejected)`
    #[default]
    #[serde(rename = "bt")]
    BradleyTerry,
    /// `max(0, margin - (chosen - rejected))`
    #[serde(rename = "margin")]
    Margin,
}

impl FromStr for LossKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "bt" => Ok(LossKind::BradleyTerry),
            "margin" => Ok(LossKind::Margin),
            other => Err(Error::invalid_config(format!(
                "unknown loss `{other}`, expected `bt` or `margin`"
            ))),
        }
    }
}

impl Display for LossKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LossKind::BradleyTerry => write!(f, "bt"),
            LossKind::Margin => write!(f, "margin"),
        }
    }
}

/// `log(1 + exp(x))` without overflow for large `|x|`
fn softplus(xs: &Tensor) -> candle_core::Result<Tensor> {
    let tail = (xs.abs()?.neg()?.exp()? + 1.)?.log()?;
    xs.relu()? + tail
}

/// Bradley-Terry loss: `mean(-log sigmoid(chosen - rejected))`.
///
/// Equals `log 2` when the scores tie and falls towards zero as the chosen
/// score pulls ahead.
pub fn bradley_terry_loss(chosen: &Tensor, rejected: &Tensor) -> candle_core::Result<Tensor> {
    let diff = (chosen - rejected)?;
    softplus(&diff.neg()?)?.mean_all()
}

/// Margin ranking loss: `mean(max(0, margin - (chosen - rejected)))`.
pub fn margin_ranking_loss(
    chosen: &Tensor,
    rejected: &Tensor,
    margin: f32,
) -> candle_core::Result<Tensor> {
    let diff = (chosen - rejected)?;
    diff.affine(-1., margin as f64)?.relu()?.mean_all()
}

/// The configured pairwise objective
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairwiseLoss {
    kind: LossKind,
    margin: f32,
}

impl Default for PairwiseLoss {
    fn default() -> Self {
        Self {
            kind: LossKind::BradleyTerry,
            margin: DEFAULT_MARGIN,
        }
    }
}

impl PairwiseLoss {
    pub fn new(kind: LossKind, margin: f32) -> Result<Self> {
        if !(margin.is_finite() && margin >= 0.) {
            return Err(Error::invalid_config(format!(
                "margin must be a non-negative number, got {margin}"
            )));
        }
        Ok(Self { kind, margin })
    }

    pub fn kind(&self) -> LossKind {
        self.kind
    }

    pub fn margin(&self) -> f32 {
        self.margin
    }

    /// Scalar loss over index-aligned score vectors of shape `(batch,)`.
    pub fn compute(&self, chosen: &Tensor, rejected: &Tensor) -> Result<Tensor> {
        if chosen.dims() != rejected.dims() {
            return Err(Error::Collation {
                reason: format!(
                    "score shapes differ: {:?} vs {:?}",
                    chosen.dims(),
                    rejected.dims()
                ),
            });
        }
        let loss = match self.kind {
            LossKind::BradleyTerry => bradley_terry_loss(chosen, rejected)?,
            LossKind::Margin => margin_ranking_loss(chosen, rejected, self.margin)?,
        };
        Ok(loss)
    }
}

/// Batch statistics of a pair of score vectors
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreferenceMetrics {
    /// Fraction of pairs with `chosen > rejected`; ties count as wrong.
    pub accuracy: f32,
    pub mean_chosen: f32,
    pub mean_rejected: f32,
    pub mean_margin: f32,
    pub n: usize,
}

impl PreferenceMetrics {
    pub fn from_scores(chosen: &Tensor, rejected: &Tensor) -> Result<Self> {
        let chosen = chosen.detach().to_dtype(DType::F32)?.to_vec1::<f32>()?;
        let rejected = rejected.detach().to_dtype(DType::F32)?.to_vec1::<f32>()?;
        Ok(Self::from_slices(&chosen, &rejected))
    }

    pub fn from_slices(chosen: &[f32], rejected: &[f32]) -> Self {
        let n = chosen.len().min(rejected.len());
        if n == 0 {
            return Self {
                accuracy: 0.,
                mean_chosen: 0.,
                mean_rejected: 0.,
                mean_margin: 0.,
                n: 0,
            };
        }
        let pairs = chosen.iter().zip(rejected.iter());
        let correct = pairs.clone().filter(|(c, r)| c > r).count();
        let sum_chosen: f32 = chosen[..n].iter().sum();
        let sum_rejected: f32 = rejected[..n].iter().sum();
        let sum_margin: f32 = pairs.map(|(c, r)| c - r).sum();
        Self {
            accuracy: correct as f32 / n as f32,
            mean_chosen: sum_chosen / n as f32,
            mean_rejected: sum_rejected / n as f32,
            mean_margin: sum_margin / n as f32,
            n,
        }
    }
}
