//! Scoring network
//!
//! A small bidirectional encoder that maps a padded token sequence to one
//! scalar reward. Both sides of a preference pair are scored by the same
//! `RewardModel`, so weights are shared by construction.

use crate::attention::{key_padding_bias, MultiHeadAttention};
use crate::collator::Batch;
use crate::error::Error;
use candle_core::{DType, IndexOp, Module, Result, Tensor, D};
use candle_nn::{embedding, linear_b, Dropout, Embedding, Linear, VarBuilder};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;

const EPS: f32 = 1e-5;

/// How token states are reduced to one vector per sequence
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pooling {
    /// Average over real tokens
    #[default]
    Mean,
    /// State of the last real token
    #[serde(rename = "last")]
    LastToken,
}

impl FromStr for Pooling {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "mean" => Ok(Pooling::Mean),
            "last" => Ok(Pooling::LastToken),
            other => Err(Error::invalid_config(format!(
                "unknown pooling `{other}`, expected `mean` or `last`"
            ))),
        }
    }
}

impl Display for Pooling {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Pooling::Mean => write!(f, "mean"),
            Pooling::LastToken => write!(f, "last"),
        }
    }
}

impl Pooling {
    /// Pools `xs` of shape `(batch, seq_len, n_embd)` under a 0/1 `mask`
    /// of shape `(batch, seq_len)`. Fully padded rows pool to zeros.
    pub fn pool(&self, xs: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let (b, _seq_len, n_embd) = xs.dims3()?;
        let mask = mask.to_dtype(xs.dtype())?;
        let counts = mask.sum_keepdim(D::Minus1)?; // (b, 1)
        match self {
            Pooling::Mean => {
                let summed = xs.broadcast_mul(&mask.unsqueeze(D::Minus1)?)?.sum(1)?;
                summed.broadcast_div(&counts.maximum(1f32)?)
            }
            Pooling::LastToken => {
                let last_ix = (counts.clone() - 1.)?
                    .maximum(0f32)?
                    .to_dtype(DType::U32)?
                    .reshape((b, 1, 1))?
                    .broadcast_as((b, 1, n_embd))?
                    .contiguous()?;
                let last = xs.contiguous()?.gather(&last_ix, 1)?.squeeze(1)?;
                last.broadcast_mul(&counts.minimum(1f32)?)
            }
        }
    }
}

/// Config for specifying parameters of a reward model
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub vocab_size: usize,
    pub block_size: usize,
    pub n_layer: usize,
    pub n_head: usize,
    pub n_embd: usize,
    pub drop_rate: f32,
    pub qkv_bias: bool,
    #[serde(default)]
    pub pooling: Pooling,
}

impl Config {
    /// Returns the configuration used by the demo run
    pub fn rm_demo() -> Self {
        Self {
            vocab_size: 50_257,
            block_size: 256,
            n_layer: 2,
            n_head: 2,
            n_embd: 128,
            drop_rate: 0.1,
            qkv_bias: false,
            pooling: Pooling::Mean,
        }
    }

    /// Returns a custom configuration to be used in unit tests
    #[allow(dead_code)]
    pub fn rm_sm_test() -> Self {
        Self {
            vocab_size: 32,
            block_size: 8,
            n_layer: 2,
            n_head: 3,
            n_embd: 12,
            drop_rate: 0.1,
            qkv_bias: false,
            pooling: Pooling::Mean,
        }
    }

    pub fn validate(&self) -> crate::Result<()> {
        let sizes = [
            ("vocab_size", self.vocab_size),
            ("block_size", self.block_size),
            ("n_layer", self.n_layer),
            ("n_head", self.n_head),
            ("n_embd", self.n_embd),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, v)| *v == 0) {
            return Err(Error::invalid_config(format!("{name} must be positive")));
        }
        if self.n_embd % self.n_head != 0 {
            return Err(Error::invalid_config(format!(
                "n_embd ({}) must be divisible by n_head ({})",
                self.n_embd, self.n_head
            )));
        }
        if !(0.0..1.0).contains(&self.drop_rate) {
            return Err(Error::invalid_config(format!(
                "drop_rate ({}) must be in [0, 1)",
                self.drop_rate
            )));
        }
        Ok(())
    }

    /// Whether weights trained under `other` can be loaded under `self`.
    pub fn is_compatible_with(&self, other: &Config) -> bool {
        self.vocab_size == other.vocab_size
            && self.block_size == other.block_size
            && self.n_layer == other.n_layer
            && self.n_head == other.n_head
            && self.n_embd == other.n_embd
            && self.qkv_bias == other.qkv_bias
            && self.pooling == other.pooling
    }
}

/// A layer normalization struct
#[derive(Clone, Debug)]
pub struct LayerNorm {
    eps: f32,
    scale: Tensor,
    shift: Tensor,
}

impl LayerNorm {
    pub fn new(n_embd: usize, vb: VarBuilder<'_>) -> Result<Self> {
        let scale = vb.get_with_hints(n_embd, "scale", candle_nn::Init::Const(1.))?;
        let shift = vb.get_with_hints(n_embd, "shift", candle_nn::Init::Const(0.))?;
        Ok(Self {
            eps: EPS,
            scale,
            shift,
        })
    }
}

impl Module for LayerNorm {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mean = xs.mean_keepdim(D::Minus1)?;
        let centered = xs.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let norm_xs = centered.broadcast_div(&(var + self.eps as f64)?.sqrt()?)?;
        norm_xs
            .broadcast_mul(&self.scale)?
            .broadcast_add(&self.shift)
    }
}

/// GELU activation, tanh approximation
#[derive(Clone, Debug)]
pub struct GELU;

impl Module for GELU {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let cubic = (xs.mul(xs)?.mul(xs)? * 0.044715)?;
        let inner = ((2_f64 / std::f64::consts::PI).sqrt() * (xs + cubic)?)?;
        (0.5 * xs)?.mul(&(inner.tanh()? + 1.)?)
    }
}

/// Position-wise feed forward network with a 4x expansion
#[derive(Clone, Debug)]
pub struct FeedForward {
    fc: Linear,
    act: GELU,
    proj: Linear,
}

impl FeedForward {
    pub fn new(cfg: Config, vb: VarBuilder<'_>) -> Result<Self> {
        let hidden = 4_usize * cfg.n_embd;
        Ok(Self {
            fc: linear_b(cfg.n_embd, hidden, true, vb.pp("first_layer"))?,
            act: GELU,
            proj: linear_b(hidden, cfg.n_embd, true, vb.pp("second_layer"))?,
        })
    }
}

impl Module for FeedForward {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = self.fc.forward(xs)?;
        let xs = self.act.forward(&xs)?;
        self.proj.forward(&xs)
    }
}

/// Pre-norm encoder block: masked self-attention then feed forward, each
/// wrapped in a residual connection.
#[derive(Clone, Debug)]
pub struct EncoderBlock {
    att: MultiHeadAttention,
    ff: FeedForward,
    norm1: LayerNorm,
    norm2: LayerNorm,
    drop_shortcut: Dropout,
}

impl EncoderBlock {
    pub fn new(cfg: Config, vb: VarBuilder<'_>) -> Result<Self> {
        let att = MultiHeadAttention::new(
            cfg.n_embd,
            cfg.n_embd,
            cfg.drop_rate,
            cfg.n_head,
            cfg.qkv_bias,
            vb.pp("mha"),
        )?;
        Ok(Self {
            att,
            ff: FeedForward::new(cfg, vb.pp("ff"))?,
            norm1: LayerNorm::new(cfg.n_embd, vb.pp("norm1"))?,
            norm2: LayerNorm::new(cfg.n_embd, vb.pp("norm2"))?,
            drop_shortcut: Dropout::new(cfg.drop_rate),
        })
    }

    pub fn forward_masked(
        &self,
        xs: &Tensor,
        key_bias: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let shortcut = xs.clone();
        let mut x = self.norm1.forward(xs)?;
        x = self.att.forward_masked(&x, key_bias, train)?;
        x = self.drop_shortcut.forward(&x, train)?;
        x = (x + shortcut)?;

        let shortcut = x.clone();
        x = self.norm2.forward(&x)?;
        x = self.ff.forward(&x)?;
        x = self.drop_shortcut.forward(&x, train)?;
        x + shortcut
    }
}

/// Encoder with a pooled scalar head
pub struct RewardModel {
    cfg: Config,
    tok_emb: Embedding,
    pos_emb: Embedding,
    drop_emb: Dropout,
    trf_blocks: Vec<EncoderBlock>,
    final_norm: LayerNorm,
    head: Linear,
}

impl RewardModel {
    /// Creates a new `RewardModel`
    ///
    /// ```rust
    /// use candle_core::{Device, DType};
    /// use candle_nn::{VarBuilder, VarMap};
    /// use reward_model_rs::model::{Config, RewardModel};
    ///
    /// let varmap = VarMap::new();
    /// let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    /// let model = RewardModel::new(Config::rm_sm_test(), vb).unwrap();
    /// assert_eq!(model.num_blocks(), 2);
    /// ```
    pub fn new(cfg: Config, vb: VarBuilder<'_>) -> Result<Self> {
        let tok_emb = embedding(cfg.vocab_size, cfg.n_embd, vb.pp("tok_emb"))?;
        let pos_emb = embedding(cfg.block_size, cfg.n_embd, vb.pp("pos_emb"))?;
        let trf_blocks = (0..cfg.n_layer)
            .map(|ix| EncoderBlock::new(cfg, vb.pp(format!("trf.{ix}"))))
            .collect::<Result<Vec<_>>>()?;
        let final_norm = LayerNorm::new(cfg.n_embd, vb.pp("final_norm"))?;
        let head = linear_b(cfg.n_embd, 1, true, vb.pp("head"))?;
        Ok(Self {
            cfg,
            tok_emb,
            pos_emb,
            drop_emb: Dropout::new(cfg.drop_rate),
            trf_blocks,
            final_norm,
            head,
        })
    }

    pub fn cfg(&self) -> &Config {
        &self.cfg
    }

    pub fn num_blocks(&self) -> usize {
        self.trf_blocks.len()
    }

    /// Scores token ids of shape `(batch, seq_len)` under their padding mask,
    /// returning one reward per row.
    pub fn score(&self, ids: &Tensor, mask: &Tensor, train: bool) -> Result<Tensor> {
        let (_b, seq_len) = ids.dims2()?;
        if seq_len > self.cfg.block_size {
            candle_core::bail!(
                "sequence length {seq_len} exceeds block size {}",
                self.cfg.block_size
            )
        }
        let tok_embeds = self.tok_emb.forward(ids)?;
        let pos_ids = Tensor::arange(0u32, seq_len as u32, ids.device())?;
        let pos_embeds = self.pos_emb.embeddings().index_select(&pos_ids, 0)?;

        let mut x = tok_embeds.broadcast_add(&pos_embeds)?;
        x = self.drop_emb.forward(&x, train)?;
        let key_bias = key_padding_bias(mask)?;
        for block in self.trf_blocks.iter() {
            x = block.forward_masked(&x, Some(&key_bias), train)?;
        }
        x = self.final_norm.forward(&x)?;

        let pooled = self.cfg.pooling.pool(&x, mask)?;
        self.head.forward(&pooled)?.i((.., 0))
    }

    /// Scores both sides of a batch with the same weights.
    pub fn score_pair(&self, batch: &Batch, train: bool) -> Result<(Tensor, Tensor)> {
        let chosen = self.score(batch.chosen_ids(), batch.chosen_mask(), train)?;
        let rejected = self.score(batch.rejected_ids(), batch.rejected_mask(), train)?;
        Ok((chosen, rejected))
    }
}
