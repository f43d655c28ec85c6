//! ViT-style vision feature pipeline.
//!
//! The fused model consumes this as a feature extractor: `embed` turns an
//! image batch into a token sequence (class token + patch tokens, with
//! positional embeddings), and the blocks refine that sequence one step per
//! fused depth level. The backbone is randomly initialized here; in
//! practice its weights come from a pretrained vision checkpoint and stay
//! frozen throughout fine-tuning.

use candle_core::{Module, Result, Tensor};
use candle_nn::{
    conv2d, layer_norm, linear, Activation, Conv2d, Conv2dConfig, Dropout, LayerNorm, VarBuilder,
};

use crate::config::CaptionConfig;

const LN_EPS: f64 = 1e-6;

/// Non-overlapping patch embedding: a strided convolution whose output grid
/// is flattened into a token sequence.
struct PatchEmbed {
    proj: Conv2d,
}

impl PatchEmbed {
    fn new(cfg: &CaptionConfig, vb: VarBuilder) -> Result<Self> {
        let conv_cfg = Conv2dConfig {
            stride: cfg.patch_size,
            ..Default::default()
        };
        let proj = conv2d(
            cfg.num_channels,
            cfg.embed_dim,
            cfg.patch_size,
            conv_cfg,
            vb.pp("proj"),
        )?;
        Ok(Self { proj })
    }

    /// `[batch, channels, h, w]` -> `[batch, num_patches, embed_dim]`
    fn forward(&self, images: &Tensor) -> Result<Tensor> {
        images.apply(&self.proj)?.flatten_from(2)?.t()
    }
}

struct VisionAttention {
    qkv: candle_nn::Linear,
    proj: candle_nn::Linear,
    num_heads: usize,
    head_size: usize,
    scale: f64,
}

impl VisionAttention {
    fn new(cfg: &CaptionConfig, vb: VarBuilder) -> Result<Self> {
        let head_size = cfg.head_size();
        let qkv = linear(cfg.embed_dim, 3 * cfg.embed_dim, vb.pp("qkv"))?;
        let proj = linear(cfg.embed_dim, cfg.embed_dim, vb.pp("proj"))?;
        Ok(Self {
            qkv,
            proj,
            num_heads: cfg.num_heads,
            head_size,
            scale: (head_size as f64).powf(-0.5),
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, t, c) = xs.dims3()?;
        let qkv = self.qkv.forward(xs)?;
        let chunks = qkv.chunk(3, candle_core::D::Minus1)?;
        let split = |xs: &Tensor| -> Result<Tensor> {
            xs.reshape((b, t, self.num_heads, self.head_size))?
                .transpose(1, 2)?
                .contiguous()
        };
        let q = split(&chunks[0])?;
        let k = split(&chunks[1])?;
        let v = split(&chunks[2])?;

        // Encoder attention: every patch attends to every patch.
        let scores = (q.matmul(&k.transpose(2, 3)?)? * self.scale)?;
        let weights = candle_nn::ops::softmax_last_dim(&scores)?;
        let attention = weights.matmul(&v)?;
        let attention = attention.transpose(1, 2)?.contiguous()?.reshape((b, t, c))?;
        self.proj.forward(&attention)
    }
}

struct VisionMlp {
    fc1: candle_nn::Linear,
    fc2: candle_nn::Linear,
    act: Activation,
}

impl VisionMlp {
    fn new(cfg: &CaptionConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = cfg.embed_dim * cfg.mlp_ratio;
        let fc1 = linear(cfg.embed_dim, hidden, vb.pp("fc1"))?;
        let fc2 = linear(hidden, cfg.embed_dim, vb.pp("fc2"))?;
        Ok(Self {
            fc1,
            fc2,
            act: Activation::Gelu,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.fc2.forward(&self.act.forward(&self.fc1.forward(xs)?)?)
    }
}

/// Pre-norm encoder block: self-attention then MLP, both with additive
/// residuals. Maps a token sequence to one of the same shape.
pub struct VisionBlock {
    norm1: LayerNorm,
    attn: VisionAttention,
    norm2: LayerNorm,
    mlp: VisionMlp,
}

impl VisionBlock {
    fn new(cfg: &CaptionConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            norm1: layer_norm(cfg.embed_dim, LN_EPS, vb.pp("norm1"))?,
            attn: VisionAttention::new(cfg, vb.pp("attn"))?,
            norm2: layer_norm(cfg.embed_dim, LN_EPS, vb.pp("norm2"))?,
            mlp: VisionMlp::new(cfg, vb.pp("mlp"))?,
        })
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = (xs + self.attn.forward(&self.norm1.forward(xs)?)?)?;
        &xs + self.mlp.forward(&self.norm2.forward(&xs)?)?
    }
}

/// Patch embedder, class token, positional table, and `depth` encoder
/// blocks. The fused model advances the blocks itself, in lock-step with
/// its own decoder blocks.
pub struct VisionEncoder {
    patch_embed: PatchEmbed,
    cls_token: Tensor,
    pos_embed: Tensor,
    pos_drop: Dropout,
    blocks: Vec<VisionBlock>,
}

impl VisionEncoder {
    /// Parameter paths (`patch_embed.*`, `cls_token`, `pos_embed`,
    /// `blocks.{i}.*`) sit at the builder root; the transplant ignore set
    /// and the freezing vision group match them by these names.
    pub fn new(cfg: &CaptionConfig, vb: VarBuilder) -> Result<Self> {
        let patch_embed = PatchEmbed::new(cfg, vb.pp("patch_embed"))?;
        let cls_token = vb.get((1, 1, cfg.embed_dim), "cls_token")?;
        let pos_embed = vb.get((1, cfg.num_patches() + 1, cfg.embed_dim), "pos_embed")?;
        let blocks = (0..cfg.depth)
            .map(|i| VisionBlock::new(cfg, vb.pp(format!("blocks.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            patch_embed,
            cls_token,
            pos_embed,
            pos_drop: Dropout::new(0.),
            blocks,
        })
    }

    /// Embed an image batch into its initial token sequence:
    /// `[batch, num_patches + 1, embed_dim]`.
    pub fn embed(&self, images: &Tensor, train: bool) -> Result<Tensor> {
        let b = images.dim(0)?;
        let patches = self.patch_embed.forward(images)?;
        let d = self.cls_token.dim(candle_core::D::Minus1)?;
        let cls = self.cls_token.broadcast_as((b, 1, d))?.contiguous()?;
        let xs = Tensor::cat(&[&cls, &patches], 1)?;
        let xs = xs.broadcast_add(&self.pos_embed)?;
        self.pos_drop.forward(&xs, train)
    }

    pub fn blocks(&self) -> &[VisionBlock] {
        &self.blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    use crate::testing::tiny_caption_config;

    #[test]
    fn embed_produces_cls_plus_patches() {
        let device = Device::Cpu;
        let cfg = tiny_caption_config();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let encoder = VisionEncoder::new(&cfg, vb).unwrap();

        let images = Tensor::randn(0f32, 1f32, (2, 3, 32, 32), &device).unwrap();
        let tokens = encoder.embed(&images, false).unwrap();
        // 32/16 = 2 patches per side -> 4 patches + 1 class token.
        assert_eq!(tokens.dims(), [2, 5, 8]);
    }

    #[test]
    fn blocks_preserve_sequence_shape() {
        let device = Device::Cpu;
        let cfg = tiny_caption_config();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let encoder = VisionEncoder::new(&cfg, vb).unwrap();
        assert_eq!(encoder.blocks().len(), cfg.depth);

        let images = Tensor::randn(0f32, 1f32, (1, 3, 32, 32), &device).unwrap();
        let mut tokens = encoder.embed(&images, false).unwrap();
        let shape = tokens.dims().to_vec();
        for block in encoder.blocks() {
            tokens = block.forward(&tokens).unwrap();
            assert_eq!(tokens.dims(), shape.as_slice());
        }
    }
}
