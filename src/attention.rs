//! Bidirectional multi-head self-attention with key-padding masks

use candle_core::{DType, Module, Result, Tensor, D};
use candle_nn::{linear_b, ops::softmax, Dropout, Linear, VarBuilder};

/// Bias added to attention scores of padded keys
pub const MASKED_KEY_BIAS: f64 = -1e9;

/// Converts a `(batch, seq_len)` 0/1 mask into an additive attention bias of
/// shape `(batch, 1, 1, seq_len)`.
///
/// Real tokens get `0`, padded ones get `MASKED_KEY_BIAS`. The bias is finite
/// so a fully padded row still yields a valid softmax.
pub fn key_padding_bias(mask: &Tensor) -> Result<Tensor> {
    mask.to_dtype(DType::F32)?
        .affine(-MASKED_KEY_BIAS, MASKED_KEY_BIAS)?
        .unsqueeze(1)?
        .unsqueeze(1)
}

#[derive(Clone, Debug)]
pub struct MultiHeadAttention {
    num_heads: usize,
    d_out: usize,
    head_dim: usize,
    w_query: Linear,
    w_key: Linear,
    w_value: Linear,
    out_proj: Linear,
    scaling: f64,
    dropout: Dropout,
    drop_p: f32,
}

impl MultiHeadAttention {
    /// Creates a new `MultiHeadAttention`
    ///
    /// ```rust
    /// use candle_core::{Device, DType};
    /// use candle_nn::{VarBuilder, VarMap};
    /// use reward_model_rs::attention::MultiHeadAttention;
    ///
    /// let varmap = VarMap::new();
    /// let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    /// let mha = MultiHeadAttention::new(12, 12, 0.1, 3, false, vb.pp("mha")).unwrap();
    /// assert_eq!(mha.head_dim(), 4);
    /// ```
    pub fn new(
        d_in: usize,
        d_out: usize,
        drop_p: f32,
        num_heads: usize,
        qkv_bias: bool,
        vb: VarBuilder<'_>,
    ) -> Result<Self> {
        if num_heads == 0 || d_out % num_heads != 0 {
            candle_core::bail!(
                "d_out ({d_out}) must be divisible by num_heads ({num_heads})"
            )
        }
        let head_dim = d_out / num_heads;
        let w_query = linear_b(d_in, d_out, qkv_bias, vb.pp("query"))?;
        let w_key = linear_b(d_in, d_out, qkv_bias, vb.pp("key"))?;
        let w_value = linear_b(d_in, d_out, qkv_bias, vb.pp("value"))?;
        let out_proj = linear_b(d_out, d_out, true, vb.pp("out_proj"))?;
        Ok(Self {
            num_heads,
            d_out,
            head_dim,
            w_query,
            w_key,
            w_value,
            out_proj,
            scaling: 1. / (head_dim as f64).sqrt(),
            dropout: Dropout::new(drop_p),
            drop_p,
        })
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    pub fn drop_p(&self) -> f32 {
        self.drop_p
    }

    pub fn w_query(&self) -> &Linear {
        &self.w_query
    }

    pub fn w_key(&self) -> &Linear {
        &self.w_key
    }

    fn split_heads(&self, xs: &Tensor, b: usize, num_tokens: usize) -> Result<Tensor> {
        xs.reshape((b, num_tokens, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// Attends over all positions, skipping keys hidden by `key_bias`.
    ///
    /// `key_bias` is the output of `key_padding_bias`.
    pub fn forward_masked(
        &self,
        xs: &Tensor,
        key_bias: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let (b, num_tokens, _d_in) = xs.dims3()?;
        let queries = self.split_heads(&self.w_query.forward(xs)?, b, num_tokens)?;
        let keys = self.split_heads(&self.w_key.forward(xs)?, b, num_tokens)?;
        let values = self.split_heads(&self.w_value.forward(xs)?, b, num_tokens)?;

        let mut attn_scores = (queries.matmul(&keys.t()?.contiguous()?)? * self.scaling)?;
        if let Some(bias) = key_bias {
            attn_scores = attn_scores.broadcast_add(bias)?;
        }
        let attn_weights = softmax(&attn_scores, D::Minus1)?;
        let attn_weights = self.dropout.forward(&attn_weights, train)?;

        let context = attn_weights
            .matmul(&values)?
            .transpose(1, 2)?
            .reshape((b, num_tokens, self.d_out))?;
        self.out_proj.forward(&context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, IndexOp};
    use candle_nn::VarMap;
    use rstest::*;

    #[fixture]
    pub fn vb() -> VarBuilder<'static> {
        let varmap = VarMap::new();
        VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu)
    }

    #[rstest]
    fn test_mha_init(vb: VarBuilder<'_>) -> Result<()> {
        let mha = MultiHeadAttention::new(6, 6, 0.5, 2, false, vb.pp("mha"))?;

        assert_eq!(mha.num_heads(), 2);
        assert_eq!(mha.head_dim(), 3);
        assert_eq!(mha.drop_p(), 0.5);
        assert_eq!(mha.w_key().weight().dims(), &[6, 6]);
        assert!(mha.w_query().bias().is_none());
        Ok(())
    }

    #[rstest]
    fn test_mha_rejects_indivisible_heads(vb: VarBuilder<'_>) {
        let mha = MultiHeadAttention::new(6, 6, 0.0, 4, false, vb.pp("mha"));
        assert!(mha.is_err());
    }

    #[rstest]
    fn test_key_padding_bias() -> Result<()> {
        let mask = Tensor::new(&[[1u8, 1, 0], [0, 0, 0]], &Device::Cpu)?;
        let bias = key_padding_bias(&mask)?;

        assert_eq!(bias.dims(), &[2, 1, 1, 3]);
        let row = bias.i((0, 0, 0))?.to_vec1::<f32>()?;
        assert_eq!(row[..2], [0., 0.]);
        assert!(row[2] <= -1e8);
        Ok(())
    }

    #[rstest]
    fn test_mha_forward_masked_is_finite(vb: VarBuilder<'_>) -> Result<()> {
        let mha = MultiHeadAttention::new(6, 6, 0.0, 2, false, vb.pp("mha"))?;
        let xs = Tensor::rand(0f32, 1f32, (2, 3, 6), vb.device())?;
        let mask = Tensor::new(&[[1u8, 1, 0], [0, 0, 0]], vb.device())?;
        let bias = key_padding_bias(&mask)?;

        let out = mha.forward_masked(&xs, Some(&bias), false)?;
        assert_eq!(out.dims(), &[2, 3, 6]);
        let values = out.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|v| v.is_finite()));
        Ok(())
    }

    #[rstest]
    fn test_mha_ignores_padded_keys(vb: VarBuilder<'_>) -> Result<()> {
        let mha = MultiHeadAttention::new(6, 6, 0.0, 2, false, vb.pp("mha"))?;
        let real = Tensor::rand(0f32, 1f32, (1, 2, 6), vb.device())?;
        let pad_a = Tensor::rand(0f32, 1f32, (1, 1, 6), vb.device())?;
        let pad_b = Tensor::rand(0f32, 1f32, (1, 1, 6), vb.device())?;
        let mask = Tensor::new(&[[1u8, 1, 0]], vb.device())?;
        let bias = key_padding_bias(&mask)?;

        let out_a = mha.forward_masked(&Tensor::cat(&[&real, &pad_a], 1)?, Some(&bias), false)?;
        let out_b = mha.forward_masked(&Tensor::cat(&[&real, &pad_b], 1)?, Some(&bias), false)?;
        let diff = (out_a.i((.., ..2))? - out_b.i((.., ..2))?)?
            .abs()?
            .max_all()?
            .to_scalar::<f32>()?;
        assert!(diff < 1e-5);
        Ok(())
    }
}
