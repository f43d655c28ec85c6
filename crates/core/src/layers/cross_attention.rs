//! Cross-attention from the decoder sequence to the vision features.
//!
//! Queries come from the decoder state; keys and values come from the
//! vision feature sequence. There is no causal mask: the vision sequence is
//! a fully-available encoder output, so every decoder position may attend
//! to every vision position.

use candle_core::{Module, Result, Tensor};
use candle_nn::{Dropout, Init, Linear, VarBuilder};

use crate::config::CaptionConfig;

/// Multi-head attention with separately parameterized query, key, and value
/// projections and no causal mask.
///
/// Unlike the rest of the model, this module's linear weights are drawn
/// from `N(0, 0.02)` with zero biases at construction. These are the only
/// fusion parameters trained from scratch, and the narrow initialization
/// keeps their early contribution close to the identity residual.
pub struct CrossAttention {
    q: Linear,
    k: Linear,
    v: Linear,
    c_proj: Linear,
    attn_dropout: Dropout,
    resid_dropout: Dropout,
    num_heads: usize,
    head_size: usize,
    scale: f64,
}

const INIT_WEIGHT: Init = Init::Randn {
    mean: 0.,
    stdev: 0.02,
};
const INIT_BIAS: Init = Init::Const(0.);

fn init_linear(dim: usize, vb: VarBuilder) -> Result<Linear> {
    let weight = vb.get_with_hints((dim, dim), "weight", INIT_WEIGHT)?;
    let bias = vb.get_with_hints(dim, "bias", INIT_BIAS)?;
    Ok(Linear::new(weight, Some(bias)))
}

impl CrossAttention {
    pub fn new(cfg: &CaptionConfig, vb: VarBuilder) -> Result<Self> {
        let head_size = cfg.head_size();
        let q = init_linear(cfg.embed_dim, vb.pp("q"))?;
        let k = init_linear(cfg.embed_dim, vb.pp("k"))?;
        let v = init_linear(cfg.embed_dim, vb.pp("v"))?;
        let c_proj = init_linear(cfg.embed_dim, vb.pp("c_proj"))?;
        Ok(Self {
            q,
            k,
            v,
            c_proj,
            attn_dropout: Dropout::new(cfg.attention_dropout),
            resid_dropout: Dropout::new(cfg.residual_dropout),
            num_heads: cfg.num_heads,
            head_size,
            scale: (head_size as f64).powf(-0.5),
        })
    }

    /// `[batch, seq_len, embed_dim]` -> `[batch, num_heads, seq_len, head_size]`
    fn split_heads(&self, xs: Tensor, b: usize, t: usize) -> Result<Tensor> {
        xs.reshape((b, t, self.num_heads, self.head_size))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// Attend from `q_src` (decoder state) to `k_src`/`v_src` (vision
    /// features). Output length matches `q_src`.
    pub fn forward(
        &self,
        q_src: &Tensor,
        k_src: &Tensor,
        v_src: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let (b, tgt_len, c) = q_src.dims3()?;
        let (_, src_len, _) = k_src.dims3()?;

        let q = self.split_heads(self.q.forward(q_src)?, b, tgt_len)?;
        let k = self.split_heads(self.k.forward(k_src)?, b, src_len)?;
        let v = self.split_heads(self.v.forward(v_src)?, b, src_len)?;

        let scores = (q.matmul(&k.transpose(2, 3)?)? * self.scale)?;
        let weights = candle_nn::ops::softmax_last_dim(&scores)?;
        let weights = self.attn_dropout.forward(&weights, train)?;

        let attention = weights.matmul(&v)?;
        let attention = attention
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, tgt_len, c))?;

        let out = self.c_proj.forward(&attention)?;
        self.resid_dropout.forward(&out, train)
    }
}
