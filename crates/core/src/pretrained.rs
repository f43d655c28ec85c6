//! Parameter transplant from a pretrained causal decoder.
//!
//! The source is a flat mapping from dotted parameter names to tensors,
//! laid out like the pretrained decoder's own state (GPT-2 convention:
//! the four projection weights are stored transposed relative to this
//! model's `[out, in]` layout). Two declarative tables drive the copy: an
//! ignore set for everything the source cannot provide (vision path and
//! fusion additions), and a suffix set for the transposed projections.

use std::collections::HashMap;

use candle_core::Tensor;
use candle_nn::VarMap;
use thiserror::Error;
use tracing::info;

/// Name substrings excluded from the transplant: vision blocks, the
/// cross-attention modules, their feed-forward pre-norm, and the vision
/// embedding tables. These stay randomly initialized.
pub const IGNORED_SUBSTRINGS: [&str; 6] = [
    "blocks.",
    "cross_attn.",
    "ln_3",
    "cls_token",
    "pos_embed",
    "patch_embed.",
];

/// Weight names stored transposed in the source. Copying these takes the
/// transpose after checking the reversed shape.
pub const TRANSPOSED_SUFFIXES: [&str; 4] = [
    "attn.c_attn.weight",
    "attn.c_proj.weight",
    "mlp.c_fc.weight",
    "mlp.c_proj.weight",
];

pub fn is_ignored(name: &str) -> bool {
    IGNORED_SUBSTRINGS.iter().any(|m| name.contains(m))
}

pub fn is_transposed(name: &str) -> bool {
    TRANSPOSED_SUFFIXES.iter().any(|w| name.ends_with(w))
}

#[derive(Debug, Error)]
pub enum TransplantError {
    /// The source does not cover a transplantable parameter; the source is
    /// incompatible with this model's architecture.
    #[error("pretrained source is missing tensor '{0}'")]
    MissingTensor(String),
    /// Shape mismatch after applying the transpose rule. The transplant is
    /// not transactional: earlier copies are not rolled back, and the model
    /// should be discarded.
    #[error(
        "shape mismatch for '{name}' (transposed: {transposed}): found {found:?}, expected {expected:?}"
    )]
    ShapeMismatch {
        name: String,
        found: Vec<usize>,
        expected: Vec<usize>,
        transposed: bool,
    },
    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}

/// Overwrite every transplantable variable in `varmap` with the matching
/// source tensor, in place and without gradient tracking. Returns the
/// number of tensors copied.
pub fn transplant(
    varmap: &VarMap,
    source: &HashMap<String, Tensor>,
) -> Result<usize, TransplantError> {
    let data = varmap.data().lock().unwrap();
    let mut names: Vec<&String> = data.keys().filter(|name| !is_ignored(name)).collect();
    names.sort();

    let mut copied = 0usize;
    for name in names {
        let var = &data[name];
        let src = source
            .get(name)
            .ok_or_else(|| TransplantError::MissingTensor(name.clone()))?;

        let target_dims = var.as_tensor().dims().to_vec();
        let src_dims = src.dims().to_vec();

        if is_transposed(name) {
            let reversed: Vec<usize> = src_dims.iter().rev().copied().collect();
            if reversed != target_dims {
                return Err(TransplantError::ShapeMismatch {
                    name: name.clone(),
                    found: src_dims,
                    expected: target_dims,
                    transposed: true,
                });
            }
            var.set(&src.t()?.contiguous()?)?;
        } else {
            if src_dims != target_dims {
                return Err(TransplantError::ShapeMismatch {
                    name: name.clone(),
                    found: src_dims,
                    expected: target_dims,
                    transposed: false,
                });
            }
            var.set(src)?;
        }
        copied += 1;
    }

    info!(copied, "transplanted pretrained decoder weights");
    Ok(copied)
}
