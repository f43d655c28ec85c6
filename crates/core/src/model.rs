//! The fused captioning model.
//!
//! A stack of `depth` fusion blocks runs in lock-step with the vision
//! encoder's `depth` blocks: at depth `i` the vision sequence is advanced
//! one block, then the decoder sequence self-attends (causally) and
//! cross-attends to the just-advanced vision sequence. The token embedding
//! table and the output projection share one weight tensor.

use std::collections::{HashMap, HashSet};

use candle_core::{bail, DType, Device, Module, Result, Tensor, Var};
use candle_nn::{
    embedding, layer_norm, loss, Dropout, Embedding, LayerNorm, Linear, VarBuilder, VarMap,
};
use tracing::debug;

use crate::config::CaptionConfig;
use crate::layers::{CausalSelfAttention, CrossAttention, Mlp};
use crate::pretrained::{self, TransplantError};
use crate::sampling::{sample_token, GenerationParams, SamplerState};
use crate::vision::VisionEncoder;

const LN_EPS: f64 = 1e-5;

/// One decoder depth level: causal self-attention, cross-attention to the
/// vision features, and a feed-forward transform, each pre-normalized with
/// an additive residual.
pub struct FusionBlock {
    ln_1: LayerNorm,
    attn: CausalSelfAttention,
    ln_2: LayerNorm,
    cross_attn: CrossAttention,
    ln_3: LayerNorm,
    mlp: Mlp,
}

impl FusionBlock {
    fn new(cfg: &CaptionConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            ln_1: layer_norm(cfg.embed_dim, LN_EPS, vb.pp("ln_1"))?,
            attn: CausalSelfAttention::new(cfg, vb.pp("attn"))?,
            ln_2: layer_norm(cfg.embed_dim, LN_EPS, vb.pp("ln_2"))?,
            cross_attn: CrossAttention::new(cfg, vb.pp("cross_attn"))?,
            ln_3: layer_norm(cfg.embed_dim, LN_EPS, vb.pp("ln_3"))?,
            mlp: Mlp::new(cfg, vb.pp("mlp"))?,
        })
    }

    /// Advance the decoder state `x` against the current vision sequence
    /// `enc_out`. `enc_out` is not modified; the caller advances it.
    pub fn forward(&self, x: &Tensor, enc_out: &Tensor, train: bool) -> Result<Tensor> {
        let x = (x + self.attn.forward(&self.ln_1.forward(x)?, train)?)?;
        let x = (&x
            + self
                .cross_attn
                .forward(&self.ln_2.forward(&x)?, enc_out, enc_out, train)?)?;
        &x + self.mlp.forward(&self.ln_3.forward(&x)?, train)?
    }
}

/// Parameter-group predicates for the freezing policy and the transplant
/// partition. Vision-path names sit at the root; decoder names under
/// `transformer.`.
mod groups {
    /// Vision feature pipeline: patch embedder, class token, positional
    /// table, and the vision blocks.
    pub(super) const VISION: [&str; 4] = ["patch_embed.", "cls_token", "pos_embed", "blocks."];

    /// Decoder parameters shared across blocks that come from the
    /// pretrained source: embeddings, final norm (the tied head has no
    /// variable of its own).
    pub(super) const DECODER_SHARED: [&str; 3] =
        ["transformer.wte.", "transformer.wpe.", "transformer.ln_f."];

    /// Per-block decoder parameters that come from the pretrained source.
    /// `.attn.` does not match `.cross_attn.` (underscore before `attn`).
    pub(super) const DECODER_BLOCK: [&str; 4] = [".ln_1.", ".ln_2.", ".attn.", ".mlp."];

    pub(super) fn is_vision(name: &str) -> bool {
        VISION.iter().any(|prefix| name.starts_with(prefix))
    }

    pub(super) fn is_decoder_block(name: &str) -> bool {
        name.starts_with("transformer.h.") && DECODER_BLOCK.iter().any(|m| name.contains(m))
    }

    /// Everything populated by the parameter transplant; the complement is
    /// the fusion additions (cross-attention and `ln_3`) plus the vision
    /// path.
    pub(super) fn is_pretrained(name: &str) -> bool {
        is_vision(name)
            || DECODER_SHARED.iter().any(|prefix| name.starts_with(prefix))
            || is_decoder_block(name)
    }
}

pub struct CaptionModel {
    cfg: CaptionConfig,
    varmap: VarMap,
    vision: VisionEncoder,
    wte: Embedding,
    wpe: Embedding,
    emb_drop: Dropout,
    blocks: Vec<FusionBlock>,
    ln_f: LayerNorm,
    lm_head: Linear,
    frozen: HashSet<String>,
}

impl CaptionModel {
    /// Build a randomly initialized model. The model owns its variable
    /// store so that the transplant and freezing operations can act on it.
    pub fn new(cfg: &CaptionConfig, device: &Device) -> Result<Self> {
        cfg.validate()?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let vision = VisionEncoder::new(cfg, vb.clone())?;

        let tvb = vb.pp("transformer");
        let wte = embedding(cfg.vocab_size, cfg.embed_dim, tvb.pp("wte"))?;
        let wpe = embedding(cfg.seq_len, cfg.embed_dim, tvb.pp("wpe"))?;
        let blocks = (0..cfg.depth)
            .map(|i| FusionBlock::new(cfg, tvb.pp(format!("h.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let ln_f = layer_norm(cfg.embed_dim, LN_EPS, tvb.pp("ln_f"))?;

        // Weight tying: the output projection is a view over the token
        // embedding table. One storage, two roles; an in-place update to
        // either is observed by both.
        let lm_head = Linear::new(wte.embeddings().clone(), None);

        // The forward pass pairs the stacks index-by-index.
        assert_eq!(vision.blocks().len(), blocks.len());

        Ok(Self {
            cfg: cfg.clone(),
            varmap,
            vision,
            wte,
            wpe,
            emb_drop: Dropout::new(cfg.emb_dropout),
            blocks,
            ln_f,
            lm_head,
            frozen: HashSet::new(),
        })
    }

    /// Build a model and overwrite its decoder weights from a pretrained
    /// source (a flat dotted-name to tensor mapping). Vision-path weights
    /// and the fusion additions stay randomly initialized.
    pub fn from_pretrained(
        cfg: &CaptionConfig,
        source: &HashMap<String, Tensor>,
        device: &Device,
    ) -> std::result::Result<Self, TransplantError> {
        let model = Self::new(cfg, device)?;
        pretrained::transplant(&model.varmap, source)?;
        Ok(model)
    }

    pub fn config(&self) -> &CaptionConfig {
        &self.cfg
    }

    /// The variable store backing every trainable tensor in the model.
    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Forward pass.
    ///
    /// With `targets`, runs in training mode (dropout active) and returns
    /// the scalar cross-entropy loss over all positions. Without, runs in
    /// inference mode and returns last-position logits `[batch, 1, vocab]`.
    ///
    /// `input_ids` is `[batch, seq_len]` of token ids with
    /// `seq_len <= cfg.seq_len`; longer sequences fail at the mask/position
    /// lookup.
    pub fn forward(
        &self,
        images: &Tensor,
        input_ids: &Tensor,
        targets: Option<&Tensor>,
    ) -> Result<Tensor> {
        let train = targets.is_some();

        let mut enc_out = self.vision.embed(images, train)?;

        let (_b, t) = input_ids.dims2()?;
        let token_embeddings = self.wte.forward(input_ids)?;
        let positions = Tensor::arange(0u32, t as u32, input_ids.device())?;
        let positional_embeddings = self.wpe.forward(&positions)?;
        let embeddings = token_embeddings.broadcast_add(&positional_embeddings)?;
        let mut x = self.emb_drop.forward(&embeddings, train)?;

        // Lock-step advancement: the decoder at depth i attends to vision
        // features already refined by block i.
        for (vision_block, fusion_block) in self.vision.blocks().iter().zip(self.blocks.iter()) {
            enc_out = vision_block.forward(&enc_out)?;
            x = fusion_block.forward(&x, &enc_out, train)?;
        }

        let x = self.ln_f.forward(&x)?;

        match targets {
            Some(targets) => {
                let logits = self.lm_head.forward(&x)?;
                let (b, t, v) = logits.dims3()?;
                loss::cross_entropy(&logits.reshape((b * t, v))?, &targets.flatten_all()?)
            }
            None => {
                let last = x.narrow(1, t - 1, 1)?;
                self.lm_head.forward(&last)
            }
        }
    }

    /// Autoregressive decoding from a seed sequence for a single image
    /// (`images` is `[1, channels, h, w]`). Returns the seed plus up to
    /// `max_tokens` generated ids, stopping early when `eos_token_id` is
    /// produced (the EOS id is kept).
    pub fn generate(
        &self,
        images: &Tensor,
        seed: &[u32],
        params: &GenerationParams,
    ) -> Result<Vec<u32>> {
        let batch = images.dim(0)?;
        if batch != 1 {
            bail!("generate expects a single image, got a batch of {batch}")
        }
        let mut sequence = seed.to_vec();
        let mut sampler = SamplerState::new(params.seed);

        for _ in 0..params.max_tokens {
            let input = Tensor::new(sequence.as_slice(), images.device())?.unsqueeze(0)?;
            let logits = self.forward(images, &input, None)?;
            let logits = logits.flatten_all()?.to_vec1::<f32>()?;
            let next_token = sample_token(
                &logits,
                params.temperature,
                params.deterministic,
                sampler.rng_mut(),
            );
            sequence.push(next_token);
            if next_token == params.eos_token_id {
                debug!(len = sequence.len(), "end-of-sequence token produced");
                break;
            }
        }

        Ok(sequence)
    }

    /// Stage-1 policy: set every pretrained parameter (vision path,
    /// embeddings, final norm, per-block self-attention / feed-forward /
    /// first two norms) to `trainable`. The fusion additions
    /// (cross-attention and `ln_3`) are always trainable.
    pub fn set_pretrained_trainable(&mut self, trainable: bool) {
        let names: Vec<String> = {
            let data = self.varmap.data().lock().unwrap();
            data.keys()
                .filter(|name| groups::is_pretrained(name))
                .cloned()
                .collect()
        };
        for name in names {
            if trainable {
                self.frozen.remove(&name);
            } else {
                self.frozen.insert(name);
            }
        }
        debug!(
            frozen_params = self.num_frozen_params(),
            "updated pretrained trainable flag"
        );
    }

    /// Stage-2 policy: flip the per-block decoder parameters (self-attention,
    /// feed-forward, `ln_1`, `ln_2`) back to trainable while the vision path
    /// and shared decoder tables stay as they are.
    pub fn unfreeze_decoder(&mut self) {
        self.frozen.retain(|name| !groups::is_decoder_block(name));
        debug!(
            frozen_params = self.num_frozen_params(),
            "unfroze decoder blocks"
        );
    }

    /// Variables the host optimizer should step, in deterministic order.
    pub fn trainable_vars(&self) -> Vec<Var> {
        let data = self.varmap.data().lock().unwrap();
        let mut entries: Vec<(&String, &Var)> = data
            .iter()
            .filter(|(name, _)| !self.frozen.contains(*name))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries.into_iter().map(|(_, var)| var.clone()).collect()
    }

    /// Total number of scalar parameters currently frozen.
    pub fn num_frozen_params(&self) -> usize {
        let data = self.varmap.data().lock().unwrap();
        data.iter()
            .filter(|(name, _)| self.frozen.contains(*name))
            .map(|(_, var)| var.as_tensor().elem_count())
            .sum()
    }
}
