//! Global attention over a sequence axis.
//!
//! Each row of `m [*, N_res, N_seq, C_in]` is pooled into a single
//! mask-weighted mean query per head; keys and values use one shared head.
//! The attended vector is broadcast back over `N_seq` and gated per position.

use std::sync::Arc;

use candle_core::{DType, Device, Result as CandleResult, Tensor, D};
use layers::{sigmoid_gate, Linear, LinearConfig, LinearInit, PrecisionPolicy};

use crate::core::{AttentionDispatcher, AttentionError, AttentionStrategy};
use crate::heads::{flatten_last_two, unflatten_last};
use crate::masks::{key_mask_bias, MASK_DTYPE};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GlobalAttentionConfig {
    pub c_in: usize,
    pub c_hidden: usize,
    pub no_heads: usize,
    /// Finite masking constant; padded keys get `-inf`.
    pub inf: f64,
    /// Guards the pooling denominator of fully masked rows.
    pub eps: f64,
}

impl GlobalAttentionConfig {
    pub fn new(c_in: usize, c_hidden: usize, no_heads: usize) -> Self {
        Self {
            c_in,
            c_hidden,
            no_heads,
            inf: 1e9,
            eps: 1e-10,
        }
    }

    pub fn with_masking(mut self, inf: f64, eps: f64) -> Self {
        self.inf = inf;
        self.eps = eps;
        self
    }

    fn validate(&self) -> Result<(), AttentionError> {
        if self.c_in == 0 || self.c_hidden == 0 || self.no_heads == 0 {
            return Err(AttentionError::config(format!(
                "global attention dimensions must be non-zero: {self:?}"
            )));
        }
        if !(self.inf.is_finite() && self.inf > 0.0) {
            return Err(AttentionError::config(format!(
                "masking constant must be positive and finite, got {}",
                self.inf
            )));
        }
        if !(self.eps.is_finite() && self.eps > 0.0) {
            return Err(AttentionError::config(format!(
                "pooling epsilon must be positive and finite, got {}",
                self.eps
            )));
        }
        Ok(())
    }
}

/// Mask-weighted mean over the sequence axis.
///
/// `m [*, N_seq, C]`, `mask [*, N_seq]` -> `[*, C]`. Computed in `f32` so the
/// epsilon survives half-precision inputs; the result is cast back to
/// `m`'s dtype.
pub fn pooled_query(m: &Tensor, mask: &Tensor, eps: f64) -> CandleResult<Tensor> {
    let m32 = m.to_dtype(DType::F32)?;
    let mask32 = mask.to_dtype(MASK_DTYPE)?;
    let weighted = m32.broadcast_mul(&mask32.unsqueeze(D::Minus1)?)?;
    let total = weighted.sum(D::Minus2)?;
    let count = (mask32.sum_keepdim(D::Minus1)? + eps)?;
    total.broadcast_div(&count)?.to_dtype(m.dtype())
}

/// Learned projections of a [`GlobalAttention`].
///
/// `linear_q` and `linear_g` produce all heads; `linear_k` and `linear_v`
/// produce the single shared head.
#[derive(Debug, Clone)]
pub struct GlobalAttentionLayers {
    pub linear_q: Linear,
    pub linear_k: Linear,
    pub linear_v: Linear,
    pub linear_g: Linear,
    pub linear_o: Linear,
}

impl GlobalAttentionLayers {
    /// Glorot q/k/v, gating-initialised gate, zero output projection.
    pub fn initialise(
        config: &GlobalAttentionConfig,
        device: &Device,
        dtype: DType,
    ) -> CandleResult<Self> {
        let hidden = config.c_hidden * config.no_heads;
        let glorot = |output: usize| {
            Linear::with_init(
                LinearConfig::without_bias(config.c_in, output),
                LinearInit::Glorot,
                device,
                dtype,
            )
        };
        Ok(Self {
            linear_q: glorot(hidden)?,
            linear_k: glorot(config.c_hidden)?,
            linear_v: glorot(config.c_hidden)?,
            linear_g: Linear::with_init(
                LinearConfig::new(config.c_in, hidden),
                LinearInit::Gating,
                device,
                dtype,
            )?,
            linear_o: Linear::with_init(
                LinearConfig::new(hidden, config.c_in),
                LinearInit::Final,
                device,
                dtype,
            )?,
        })
    }

    fn validate(&self, config: &GlobalAttentionConfig) -> Result<(), AttentionError> {
        let hidden = config.c_hidden * config.no_heads;
        for (label, linear, input, output) in [
            ("linear_q", &self.linear_q, config.c_in, hidden),
            ("linear_k", &self.linear_k, config.c_in, config.c_hidden),
            ("linear_v", &self.linear_v, config.c_in, config.c_hidden),
            ("linear_g", &self.linear_g, config.c_in, hidden),
            ("linear_o", &self.linear_o, hidden, config.c_in),
        ] {
            let cfg = linear.config();
            if cfg.input_dim != input || cfg.output_dim != output {
                return Err(AttentionError::shape(format!(
                    "{label}: expected {input} -> {output}, got {} -> {}",
                    cfg.input_dim, cfg.output_dim
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct GlobalAttention {
    config: GlobalAttentionConfig,
    layers: GlobalAttentionLayers,
    dispatcher: Arc<AttentionDispatcher>,
    policy: PrecisionPolicy,
}

impl GlobalAttention {
    pub fn new(
        config: GlobalAttentionConfig,
        dispatcher: Arc<AttentionDispatcher>,
        device: &Device,
        dtype: DType,
    ) -> Result<Self, AttentionError> {
        config.validate()?;
        let layers = GlobalAttentionLayers::initialise(&config, device, dtype)?;
        Self::from_layers(config, layers, dispatcher)
    }

    /// Assembles the module from explicit projections, e.g. trained weights.
    pub fn from_layers(
        config: GlobalAttentionConfig,
        layers: GlobalAttentionLayers,
        dispatcher: Arc<AttentionDispatcher>,
    ) -> Result<Self, AttentionError> {
        config.validate()?;
        layers.validate(&config)?;
        let policy = PrecisionPolicy::for_storage(layers.linear_q.weight().dtype());
        Ok(Self {
            config,
            layers,
            dispatcher,
            policy,
        })
    }

    pub fn config(&self) -> &GlobalAttentionConfig {
        &self.config
    }

    pub fn layers(&self) -> &GlobalAttentionLayers {
        &self.layers
    }

    /// `m [*, N_res, N_seq, C_in]`, `mask [*, N_res, N_seq]` -> `[*, N_res, N_seq, C_in]`.
    pub fn global_attend(
        &self,
        m: &Tensor,
        mask: &Tensor,
        use_low_memory: bool,
    ) -> Result<Tensor, AttentionError> {
        let dims = m.dims();
        if dims.len() < 3 || dims[dims.len() - 1] != self.config.c_in {
            return Err(AttentionError::shape(format!(
                "expected m [*, N_res, N_seq, {}], got {dims:?}",
                self.config.c_in
            )));
        }
        if mask.dims() != &dims[..dims.len() - 1] {
            return Err(AttentionError::shape(format!(
                "mask {:?} must match the leading dims of m {dims:?}",
                mask.dims()
            )));
        }

        let strategy = if use_low_memory {
            AttentionStrategy::low_memory_default()
        } else {
            AttentionStrategy::Direct
        };

        // [*, N_res, H, C]
        let pooled = pooled_query(m, mask, self.config.eps)?;
        let q = self.layers.linear_q.forward(&pooled, &self.policy)?;
        let q = (unflatten_last(&q, self.config.no_heads)? / (self.config.c_hidden as f64).sqrt())?;

        // [*, N_res, N_seq, C]
        let k = self.layers.linear_k.forward(m, &self.policy)?;
        let v = self.layers.linear_v.forward(m, &self.policy)?;

        // [*, N_res, 1, N_seq]
        let bias = key_mask_bias(&mask.to_dtype(MASK_DTYPE)?, self.config.inf)?;

        let o = self.dispatcher.run(strategy, &q, &k, &v, &[bias])?;
        Ok(self.wrap_up(&o, m)?)
    }

    fn wrap_up(&self, o: &Tensor, m: &Tensor) -> CandleResult<Tensor> {
        // [*, N_res, N_seq, H, C]
        let g = unflatten_last(&self.layers.linear_g.forward(m, &self.policy)?, self.config.no_heads)?;
        let o = o.unsqueeze(o.rank() - 2)?;
        let o = sigmoid_gate(&g, &o, &self.policy)?;
        self.layers.linear_o.forward(&flatten_last_two(&o)?, &self.policy)
    }
}
