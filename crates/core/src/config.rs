use candle_core::{bail, Result};
use serde::Deserialize;

/// Model hyperparameters, shared between the vision and decoder stacks.
///
/// Both stacks use the same `embed_dim`, `num_heads`, and `depth`; the
/// forward pass advances them in lock-step, one block per depth index.
#[derive(Debug, Clone, Deserialize)]
pub struct CaptionConfig {
    pub vocab_size: usize,
    pub embed_dim: usize,
    pub num_heads: usize,
    /// Maximum decoder sequence length; sizes the causal mask buffer and
    /// the positional embedding table.
    pub seq_len: usize,
    /// Number of vision blocks and of fusion blocks.
    pub depth: usize,
    pub attention_dropout: f32,
    pub residual_dropout: f32,
    pub emb_dropout: f32,
    pub mlp_dropout: f32,
    pub mlp_ratio: usize,
    pub image_size: usize,
    pub patch_size: usize,
    pub num_channels: usize,
    pub eos_token_id: u32,
}

impl Default for CaptionConfig {
    fn default() -> Self {
        // GPT-2 small decoder over a ViT-B/16 backbone.
        Self {
            vocab_size: 50257,
            embed_dim: 768,
            num_heads: 12,
            seq_len: 1024,
            depth: 12,
            attention_dropout: 0.1,
            residual_dropout: 0.1,
            emb_dropout: 0.1,
            mlp_dropout: 0.1,
            mlp_ratio: 4,
            image_size: 224,
            patch_size: 16,
            num_channels: 3,
            eos_token_id: 50256,
        }
    }
}

impl CaptionConfig {
    /// Per-head embedding width.
    pub fn head_size(&self) -> usize {
        self.embed_dim / self.num_heads
    }

    /// Number of patch tokens produced by the vision embedder (excluding
    /// the class token).
    pub fn num_patches(&self) -> usize {
        let per_side = self.image_size / self.patch_size;
        per_side * per_side
    }

    /// Check the construction-time invariants. No partial model is built
    /// when this fails.
    pub fn validate(&self) -> Result<()> {
        if self.num_heads == 0 || self.embed_dim % self.num_heads != 0 {
            bail!(
                "embed_dim ({}) must be divisible by num_heads ({})",
                self.embed_dim,
                self.num_heads
            );
        }
        if self.patch_size == 0 || self.image_size % self.patch_size != 0 {
            bail!(
                "image_size ({}) must be divisible by patch_size ({})",
                self.image_size,
                self.patch_size
            );
        }
        if self.depth == 0 {
            bail!("depth must be at least 1");
        }
        Ok(())
    }
}
