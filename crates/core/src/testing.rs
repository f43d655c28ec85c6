//! Shared test utilities.
//!
//! Tiny configurations and a synthetic pretrained-weight source so model
//! tests run on the CPU in well under a second.

use std::collections::HashMap;

use candle_core::{Result, Tensor};

use crate::config::CaptionConfig;
use crate::model::CaptionModel;
use crate::pretrained::{is_ignored, is_transposed};

/// A minimal valid configuration: embed 8, 2 heads, sequence 16, one fused
/// depth level, 20-token vocabulary, 32x32 images with 16x16 patches, all
/// dropout disabled.
pub fn tiny_caption_config() -> CaptionConfig {
    CaptionConfig {
        vocab_size: 20,
        embed_dim: 8,
        num_heads: 2,
        seq_len: 16,
        depth: 1,
        attention_dropout: 0.0,
        residual_dropout: 0.0,
        emb_dropout: 0.0,
        mlp_dropout: 0.0,
        mlp_ratio: 2,
        image_size: 32,
        patch_size: 16,
        num_channels: 3,
        eos_token_id: 19,
    }
}

/// Extract a pretrained-source mapping from a donor model, in the source's
/// storage convention: the four projection weights are stored transposed,
/// everything the transplant ignores is absent, all tensors are detached
/// copies.
pub fn synthetic_pretrained_source(donor: &CaptionModel) -> Result<HashMap<String, Tensor>> {
    let mut source = HashMap::new();
    let data = donor.varmap().data().lock().unwrap();
    for (name, var) in data.iter() {
        if is_ignored(name) {
            continue;
        }
        let tensor = if is_transposed(name) {
            var.as_tensor().t()?.contiguous()?
        } else {
            var.as_tensor().copy()?
        };
        source.insert(name.clone(), tensor);
    }
    Ok(source)
}
