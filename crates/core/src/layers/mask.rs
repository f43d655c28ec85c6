use candle_core::{DType, Device, Result, Tensor};

/// Build the additive causal mask buffer for decoder self-attention.
///
/// Returns shape `[1, 1, max_len, max_len]` with `0.0` on and below the
/// diagonal and `-inf` above it. The buffer is computed once at model
/// construction and narrowed to the live sequence length per forward pass;
/// it is read-only afterwards and safe to share across forward passes.
pub fn causal_mask(max_len: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let mask: Vec<f32> = (0..max_len)
        .flat_map(|i| (0..max_len).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 }))
        .collect();
    let mask = Tensor::from_vec(mask, (1, 1, max_len, max_len), device)?;
    mask.to_dtype(dtype)
}
