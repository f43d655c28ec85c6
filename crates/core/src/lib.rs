//! Image-captioning core.
//!
//! Fuses a ViT-style vision backbone with a GPT-2-style causal decoder
//! through per-depth cross-attention. The crate covers the fused forward
//! pass (loss or next-token logits), parameter transplant from a pretrained
//! decoder, the staged freezing policy, and autoregressive generation.
//!
//! Dataset loading, optimizer stepping, checkpointing, and weight fetching
//! are host concerns; the model exposes its [`candle_nn::VarMap`] and the
//! set of trainable variables for that purpose.

pub mod config;
pub mod layers;
pub mod model;
pub mod pretrained;
pub mod sampling;
pub mod vision;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use config::CaptionConfig;
pub use model::CaptionModel;
pub use pretrained::TransplantError;
pub use sampling::GenerationParams;
