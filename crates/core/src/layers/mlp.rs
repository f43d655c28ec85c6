use candle_core::{Module, Result, Tensor};
use candle_nn::{linear, Activation, Dropout, Linear, VarBuilder};

use crate::config::CaptionConfig;

/// Position-wise feed-forward block: expand by `mlp_ratio`, GELU, project
/// back, dropout. No mixing between sequence positions.
pub struct Mlp {
    c_fc: Linear,
    c_proj: Linear,
    act: Activation,
    dropout: Dropout,
}

impl Mlp {
    pub fn new(cfg: &CaptionConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = cfg.embed_dim * cfg.mlp_ratio;
        let c_fc = linear(cfg.embed_dim, hidden, vb.pp("c_fc"))?;
        let c_proj = linear(hidden, cfg.embed_dim, vb.pp("c_proj"))?;
        Ok(Self {
            c_fc,
            c_proj,
            act: Activation::Gelu,
            dropout: Dropout::new(cfg.mlp_dropout),
        })
    }

    pub fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let xs = self.c_fc.forward(xs)?;
        let xs = self.act.forward(&xs)?;
        let xs = self.c_proj.forward(&xs)?;
        self.dropout.forward(&xs, train)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{VarBuilder, VarMap};

    use crate::testing::tiny_caption_config;

    #[test]
    fn positions_do_not_mix() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let mlp = Mlp::new(&tiny_caption_config(), vb).unwrap();

        let xs = Tensor::randn(0f32, 1f32, (1, 4, 8), &device).unwrap();
        let base = mlp.forward(&xs, false).unwrap();

        let prefix = xs.narrow(1, 0, 3).unwrap();
        let tail = Tensor::randn(3f32, 1f32, (1, 1, 8), &device).unwrap();
        let perturbed = Tensor::cat(&[&prefix, &tail], 1).unwrap();
        let out = mlp.forward(&perturbed, false).unwrap();

        let base = base.to_vec3::<f32>().unwrap();
        let out = out.to_vec3::<f32>().unwrap();
        for pos in 0..3 {
            for dim in 0..8 {
                assert!((base[0][pos][dim] - out[0][pos][dim]).abs() < 1e-6);
            }
        }
    }
}
