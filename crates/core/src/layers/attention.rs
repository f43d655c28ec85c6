use candle_core::{Module, Result, Tensor, D};
use candle_nn::{linear, Dropout, Linear, VarBuilder};

use crate::config::CaptionConfig;
use crate::layers::mask::causal_mask;

/// Masked multi-head self-attention over the decoder sequence.
///
/// Queries, keys, and values come from a single fused projection
/// (`c_attn`). A precomputed lower-triangular mask forbids attention to
/// future positions, so the output at position `i` depends only on
/// positions `0..=i`.
pub struct CausalSelfAttention {
    c_attn: Linear,
    c_proj: Linear,
    attn_dropout: Dropout,
    resid_dropout: Dropout,
    mask: Tensor,
    num_heads: usize,
    head_size: usize,
    scale: f64,
}

impl CausalSelfAttention {
    pub fn new(cfg: &CaptionConfig, vb: VarBuilder) -> Result<Self> {
        let head_size = cfg.head_size();
        let c_attn = linear(cfg.embed_dim, 3 * cfg.embed_dim, vb.pp("c_attn"))?;
        let c_proj = linear(cfg.embed_dim, cfg.embed_dim, vb.pp("c_proj"))?;
        let mask = causal_mask(cfg.seq_len, vb.dtype(), vb.device())?;
        Ok(Self {
            c_attn,
            c_proj,
            attn_dropout: Dropout::new(cfg.attention_dropout),
            resid_dropout: Dropout::new(cfg.residual_dropout),
            mask,
            num_heads: cfg.num_heads,
            head_size,
            scale: (head_size as f64).powf(-0.5),
        })
    }

    /// `[batch, seq_len, embed_dim]` -> `[batch, num_heads, seq_len, head_size]`
    fn split_heads(&self, xs: &Tensor, b: usize, t: usize) -> Result<Tensor> {
        xs.reshape((b, t, self.num_heads, self.head_size))?
            .transpose(1, 2)?
            .contiguous()
    }

    pub fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let (b, t, c) = xs.dims3()?;

        let qkv = self.c_attn.forward(xs)?;
        let chunks = qkv.chunk(3, D::Minus1)?;
        let q = self.split_heads(&chunks[0], b, t)?;
        let k = self.split_heads(&chunks[1], b, t)?;
        let v = self.split_heads(&chunks[2], b, t)?;

        let scores = (q.matmul(&k.transpose(2, 3)?)? * self.scale)?;
        let mask = self.mask.narrow(2, 0, t)?.narrow(3, 0, t)?;
        let scores = scores.broadcast_add(&mask)?;

        let weights = candle_nn::ops::softmax_last_dim(&scores)?;
        let weights = self.attn_dropout.forward(&weights, train)?;

        let attention = weights.matmul(&v)?;
        let attention = attention.transpose(1, 2)?.contiguous()?.reshape((b, t, c))?;

        let out = self.c_proj.forward(&attention)?;
        self.resid_dropout.forward(&out, train)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    use crate::testing::tiny_caption_config;

    fn build_attention(device: &Device) -> CausalSelfAttention {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        CausalSelfAttention::new(&tiny_caption_config(), vb).unwrap()
    }

    #[test]
    fn output_shape_matches_input() {
        let device = Device::Cpu;
        let attn = build_attention(&device);
        let xs = Tensor::randn(0f32, 1f32, (2, 5, 8), &device).unwrap();
        let out = attn.forward(&xs, false).unwrap();
        assert_eq!(out.dims(), xs.dims());
    }

    #[test]
    fn earlier_positions_ignore_future_changes() {
        let device = Device::Cpu;
        let attn = build_attention(&device);

        let xs = Tensor::randn(0f32, 1f32, (1, 4, 8), &device).unwrap();
        let base = attn.forward(&xs, false).unwrap();

        // Replace only the last position and re-run.
        let prefix = xs.narrow(1, 0, 3).unwrap();
        let perturbed_tail = Tensor::randn(5f32, 1f32, (1, 1, 8), &device).unwrap();
        let perturbed = Tensor::cat(&[&prefix, &perturbed_tail], 1).unwrap();
        let out = attn.forward(&perturbed, false).unwrap();

        let base = base.to_vec3::<f32>().unwrap();
        let out = out.to_vec3::<f32>().unwrap();
        for pos in 0..3 {
            for dim in 0..8 {
                let delta = (base[0][pos][dim] - out[0][pos][dim]).abs();
                assert!(
                    delta < 1e-5,
                    "position {pos} changed by {delta} after a future-only perturbation"
                );
            }
        }
    }
}
