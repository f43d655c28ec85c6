//! Token selection for the generation loop.
//!
//! Sampling runs on the CPU over the raw logit vector: temperature scaling,
//! softmax, then either greedy argmax or one multinomial draw. Randomness is
//! accepted as-is; there is no resampling or backtracking.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Parameters controlling one `generate` call.
#[derive(Debug, Clone)]
pub struct GenerationParams {
    /// Maximum number of tokens appended to the seed sequence.
    pub max_tokens: usize,
    /// Temperature for logit scaling; < 1 sharpens the distribution,
    /// > 1 flattens it. Must be positive.
    pub temperature: f32,
    /// Greedy argmax selection instead of multinomial sampling.
    pub deterministic: bool,
    /// Generation stops as soon as this token is produced; the token is
    /// kept as the last element of the returned sequence.
    pub eos_token_id: u32,
    /// Optional seed for reproducible stochastic sampling.
    pub seed: Option<u64>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 50,
            temperature: 1.0,
            deterministic: false,
            eos_token_id: 50256,
            seed: None,
        }
    }
}

/// Per-call RNG state.
pub struct SamplerState {
    rng: StdRng,
}

impl SamplerState {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }

    pub fn rng_mut(&mut self) -> &mut StdRng {
        &mut self.rng
    }
}

/// Select the next token from a raw logit vector.
pub fn sample_token(
    logits: &[f32],
    temperature: f32,
    deterministic: bool,
    rng: &mut StdRng,
) -> u32 {
    let mut logits = logits.to_vec();
    if temperature != 1.0 {
        let inv_temp = 1.0 / temperature;
        for logit in logits.iter_mut() {
            *logit *= inv_temp;
        }
    }
    let probs = softmax(&logits);
    if deterministic {
        argmax(&probs)
    } else {
        sample_from_probs(&probs, rng)
    }
}

pub(crate) fn softmax(logits: &[f32]) -> Vec<f32> {
    let max_logit = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut probs: Vec<f32> = logits.iter().map(|&l| (l - max_logit).exp()).collect();
    let sum: f32 = probs.iter().sum();
    if sum > 0.0 {
        let inv_sum = 1.0 / sum;
        for p in probs.iter_mut() {
            *p *= inv_sum;
        }
    }
    probs
}

fn argmax(values: &[f32]) -> u32 {
    values
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i as u32)
        .unwrap_or(0)
}

fn sample_from_probs(probs: &[f32], rng: &mut StdRng) -> u32 {
    let r: f32 = rng.gen();
    let mut cumsum = 0.0f32;
    for (i, &p) in probs.iter().enumerate() {
        cumsum += p;
        if r < cumsum {
            return i as u32;
        }
    }
    // Fallback for accumulated rounding error: last token.
    probs.len() as u32 - 1
}
