//! Adaptive layer normalisation.
//!
//! `AdaLN(a, s) = sigmoid(gate(LN_s(s))) * LN(a) + skip(LN_s(s))`, where `LN`
//! has no affine parameters and `LN_s` carries a learnable scale without an
//! offset. The gate starts with zero weights and a unit bias and the skip
//! path starts at zero, so a fresh module returns `sigmoid(1) * LN(a)`.

use candle_core::{DType, Device, Result, Tensor};

use crate::{
    checks,
    dtypes::PrecisionPolicy,
    gating::sigmoid_gate,
    linear::{Linear, LinearConfig, LinearInit},
    norm::{LayerNorm, NormConfig},
};

/// Adaptive LayerNorm conditioned on a second representation.
#[derive(Debug, Clone)]
pub struct AdaLN {
    dim: usize,
    a_norm: LayerNorm,
    s_norm: LayerNorm,
    gating_linear: Linear,
    skip_linear: Linear,
}

impl AdaLN {
    /// Builds a freshly initialised module for `dim` channels.
    pub fn new(dim: usize, device: &Device, dtype: DType) -> Result<Self> {
        let a_norm = LayerNorm::without_affine(NormConfig::new(dim))?;
        let s_norm = LayerNorm::with_scale(Tensor::ones(dim, dtype, device)?, NormConfig::new(dim))?;
        let gating_linear =
            Linear::with_init(LinearConfig::new(dim, dim), LinearInit::Gating, device, dtype)?;
        let skip_linear = Linear::with_init(
            LinearConfig::without_bias(dim, dim),
            LinearInit::Final,
            device,
            dtype,
        )?;
        Self::from_parts(dim, a_norm, s_norm, gating_linear, skip_linear)
    }

    /// Assembles the module from explicit sub-layers.
    pub fn from_parts(
        dim: usize,
        a_norm: LayerNorm,
        s_norm: LayerNorm,
        gating_linear: Linear,
        skip_linear: Linear,
    ) -> Result<Self> {
        for (label, linear) in [("adaln.gating", &gating_linear), ("adaln.skip", &skip_linear)] {
            let cfg = linear.config();
            if cfg.input_dim != dim || cfg.output_dim != dim {
                return Err(candle_core::Error::Msg(format!(
                    "{label}: expected {dim} -> {dim} projection, got {} -> {}",
                    cfg.input_dim, cfg.output_dim
                )));
            }
        }
        Ok(Self {
            dim,
            a_norm,
            s_norm,
            gating_linear,
            skip_linear,
        })
    }

    /// Channel width of both inputs.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Conditions `a` on `s`; both are `(..., dim)` with identical shapes.
    pub fn forward(&self, a: &Tensor, s: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_shape("adaln.s", s, a.dims())?;
        let a = self.a_norm.forward(a, policy)?;
        let s = self.s_norm.forward(s, policy)?;
        let gate = self.gating_linear.forward(&s, policy)?;
        let gated = sigmoid_gate(&gate, &a, policy)?;
        let skip = self.skip_linear.forward(&s, policy)?;
        gated.add(&skip)
    }
}
