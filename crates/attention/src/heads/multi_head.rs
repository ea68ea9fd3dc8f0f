//! Gated multi-head attention.
//!
//! `q_x [*, Q, c_q]` and `kv_x [*, K, c_k]` are projected to `no_heads`
//! heads of width `c_hidden`, attended with the requested strategy, gated by
//! `sigmoid(linear_g(q_x))` when gating is on, and projected back to `c_q`.

use std::sync::Arc;

use candle_core::{DType, Device, Result as CandleResult, Tensor};
use layers::{sigmoid_gate, Linear, LinearConfig, LinearInit, PrecisionPolicy};

use crate::core::{AttentionDispatcher, AttentionError, AttentionStrategy, StrategyRequest};
use crate::heads::{flatten_last_two, heads_last, split_heads, unflatten_last};

/// Static shape of a [`MultiHeadGatedAttention`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultiHeadConfig {
    /// Channel width of the query input.
    pub c_q: usize,
    /// Channel width of the key input.
    pub c_k: usize,
    /// Channel width of the value input (the same tensor as the key input).
    pub c_v: usize,
    /// Per-head hidden width.
    pub c_hidden: usize,
    pub no_heads: usize,
    pub gating: bool,
}

impl MultiHeadConfig {
    /// Gated configuration.
    pub fn new(c_q: usize, c_k: usize, c_v: usize, c_hidden: usize, no_heads: usize) -> Self {
        Self {
            c_q,
            c_k,
            c_v,
            c_hidden,
            no_heads,
            gating: true,
        }
    }

    pub fn without_gating(mut self) -> Self {
        self.gating = false;
        self
    }

    fn validate(&self) -> Result<(), AttentionError> {
        if [self.c_q, self.c_k, self.c_v, self.c_hidden, self.no_heads].contains(&0) {
            return Err(AttentionError::config(format!(
                "multi-head attention dimensions must be non-zero: {self:?}"
            )));
        }
        if self.c_k != self.c_v {
            return Err(AttentionError::config(format!(
                "keys and values are projected from the same input, so c_k ({}) must equal c_v ({})",
                self.c_k, self.c_v
            )));
        }
        Ok(())
    }

    fn projected(&self) -> usize {
        self.no_heads * self.c_hidden
    }
}

/// Learned projections of a [`MultiHeadGatedAttention`].
#[derive(Debug, Clone)]
pub struct MultiHeadLayers {
    pub linear_q: Linear,
    pub linear_k: Linear,
    pub linear_v: Linear,
    pub linear_g: Option<Linear>,
    pub linear_o: Linear,
}

impl MultiHeadLayers {
    /// Fresh projections: glorot q/k/v without bias, gating-initialised gate,
    /// zero output projection.
    pub fn initialise(config: &MultiHeadConfig, device: &Device, dtype: DType) -> CandleResult<Self> {
        let hidden = config.projected();
        let glorot = |input: usize| {
            Linear::with_init(
                LinearConfig::without_bias(input, hidden),
                LinearInit::Glorot,
                device,
                dtype,
            )
        };
        let linear_g = if config.gating {
            Some(Linear::with_init(
                LinearConfig::new(config.c_q, hidden),
                LinearInit::Gating,
                device,
                dtype,
            )?)
        } else {
            None
        };
        Ok(Self {
            linear_q: glorot(config.c_q)?,
            linear_k: glorot(config.c_k)?,
            linear_v: glorot(config.c_v)?,
            linear_g,
            linear_o: Linear::with_init(
                LinearConfig::new(hidden, config.c_q),
                LinearInit::Final,
                device,
                dtype,
            )?,
        })
    }

    fn validate(&self, config: &MultiHeadConfig) -> Result<(), AttentionError> {
        let hidden = config.projected();
        let mut expected = vec![
            ("linear_q", &self.linear_q, config.c_q, hidden),
            ("linear_k", &self.linear_k, config.c_k, hidden),
            ("linear_v", &self.linear_v, config.c_v, hidden),
            ("linear_o", &self.linear_o, hidden, config.c_q),
        ];
        match (&self.linear_g, config.gating) {
            (Some(linear_g), true) => expected.push(("linear_g", linear_g, config.c_q, hidden)),
            (None, false) => {}
            (_, gating) => {
                return Err(AttentionError::config(format!(
                    "gate projection presence does not match gating={gating}"
                )))
            }
        }
        for (label, linear, input, output) in expected {
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

/// Multi-head attention with optional output gating.
#[derive(Debug, Clone)]
pub struct MultiHeadGatedAttention {
    config: MultiHeadConfig,
    layers: MultiHeadLayers,
    dispatcher: Arc<AttentionDispatcher>,
    policy: PrecisionPolicy,
}

impl MultiHeadGatedAttention {
    pub fn new(
        config: MultiHeadConfig,
        dispatcher: Arc<AttentionDispatcher>,
        device: &Device,
        dtype: DType,
    ) -> Result<Self, AttentionError> {
        config.validate()?;
        let layers = MultiHeadLayers::initialise(&config, device, dtype)?;
        Self::from_layers(config, layers, dispatcher)
    }

    /// Assembles the module from explicit projections.
    pub fn from_layers(
        config: MultiHeadConfig,
        layers: MultiHeadLayers,
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

    pub fn config(&self) -> &MultiHeadConfig {
        &self.config
    }

    pub fn layers(&self) -> &MultiHeadLayers {
        &self.layers
    }

    /// Attends `q_x` over `kv_x` with the strategy described by `request`.
    ///
    /// Each bias must broadcast to `[*, H, Q, K]`. Configuration problems
    /// (conflicting flags, missing fused provider, too many fused biases)
    /// are reported before shapes are checked or anything is computed.
    pub fn attend(
        &self,
        q_x: &Tensor,
        kv_x: &Tensor,
        biases: &[Tensor],
        request: &StrategyRequest,
    ) -> Result<Tensor, AttentionError> {
        let strategy = request.resolve()?;
        self.attend_with_strategy(q_x, kv_x, biases, strategy)
    }

    /// Like [`attend`](Self::attend) for an already resolved strategy.
    pub fn attend_with_strategy(
        &self,
        q_x: &Tensor,
        kv_x: &Tensor,
        biases: &[Tensor],
        strategy: AttentionStrategy,
    ) -> Result<Tensor, AttentionError> {
        self.dispatcher.check(strategy, biases.len())?;
        self.validate_inputs(q_x, kv_x)?;

        let (q, k, v) = self.prep_qkv(q_x, kv_x, !strategy.scales_internally())?;
        let o = self.dispatcher.run(strategy, &q, &k, &v, biases)?;
        Ok(self.wrap_up(&o, q_x)?)
    }

    fn validate_inputs(&self, q_x: &Tensor, kv_x: &Tensor) -> Result<(), AttentionError> {
        let (q_dims, kv_dims) = (q_x.dims(), kv_x.dims());
        if q_dims.len() < 2 || kv_dims.len() != q_dims.len() {
            return Err(AttentionError::shape(format!(
                "q_x [*, Q, c_q] and kv_x [*, K, c_k] must share a rank of at least 2, got {q_dims:?} and {kv_dims:?}"
            )));
        }
        let rank = q_dims.len();
        if q_dims[rank - 1] != self.config.c_q || kv_dims[rank - 1] != self.config.c_k {
            return Err(AttentionError::shape(format!(
                "expected channel widths c_q={} and c_k={}, got {q_dims:?} and {kv_dims:?}",
                self.config.c_q, self.config.c_k
            )));
        }
        if q_dims[..rank - 2] != kv_dims[..rank - 2] {
            return Err(AttentionError::shape(format!(
                "batch dimensions of q_x {q_dims:?} and kv_x {kv_dims:?} differ"
            )));
        }
        Ok(())
    }

    /// Projects to `[*, H, Q|K, c_hidden]`, optionally scaling the query.
    fn prep_qkv(
        &self,
        q_x: &Tensor,
        kv_x: &Tensor,
        apply_scale: bool,
    ) -> CandleResult<(Tensor, Tensor, Tensor)> {
        let heads = self.config.no_heads;
        let mut q = split_heads(&self.layers.linear_q.forward(q_x, &self.policy)?, heads)?;
        let k = split_heads(&self.layers.linear_k.forward(kv_x, &self.policy)?, heads)?;
        let v = split_heads(&self.layers.linear_v.forward(kv_x, &self.policy)?, heads)?;
        if apply_scale {
            q = (q / (self.config.c_hidden as f64).sqrt())?;
        }
        Ok((q, k, v))
    }

    /// Gates `o [*, H, Q, c_hidden]` and projects it back to `[*, Q, c_q]`.
    fn wrap_up(&self, o: &Tensor, q_x: &Tensor) -> CandleResult<Tensor> {
        let mut o = heads_last(o)?;
        if let Some(linear_g) = &self.layers.linear_g {
            let g = unflatten_last(&linear_g.forward(q_x, &self.policy)?, self.config.no_heads)?;
            o = sigmoid_gate(&g, &o, &self.policy)?;
        }
        self.layers
            .linear_o
            .forward(&flatten_last_two(&o)?, &self.policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Var, D};

    use crate::core::{Config, RuntimeCapabilities};
    use crate::fused::ScaledReferenceProvider;

    fn portable() -> Arc<AttentionDispatcher> {
        Arc::new(AttentionDispatcher::portable())
    }

    fn input(dims: &[usize], device: &Device) -> CandleResult<Tensor> {
        let len: usize = dims.iter().product();
        let data = (0..len)
            .map(|i| ((i * 7 + 3) % 13) as f32 / 6.5 - 1.0)
            .collect::<Vec<_>>();
        Tensor::from_vec(data, dims, device)
    }

    /// Replaces the zero output projection so results become observable.
    fn observable(config: MultiHeadConfig, dispatcher: Arc<AttentionDispatcher>) -> MultiHeadGatedAttention {
        let device = Device::Cpu;
        let mut layers = MultiHeadLayers::initialise(&config, &device, DType::F32).unwrap();
        layers.linear_o = Linear::with_init(
            LinearConfig::new(config.no_heads * config.c_hidden, config.c_q),
            LinearInit::Glorot,
            &device,
            DType::F32,
        )
        .unwrap();
        MultiHeadGatedAttention::from_layers(config, layers, dispatcher).unwrap()
    }

    #[test]
    fn fresh_module_outputs_zero() -> CandleResult<()> {
        let device = Device::Cpu;
        let module =
            MultiHeadGatedAttention::new(MultiHeadConfig::new(6, 6, 6, 4, 2), portable(), &device, DType::F32)
                .unwrap();
        assert!(module
            .layers()
            .linear_o
            .weight()
            .flatten_all()?
            .to_vec1::<f32>()?
            .iter()
            .all(|w| *w == 0.0));

        let x = input(&[2, 5, 6], &device)?;
        let out = module.attend(&x, &x, &[], &StrategyRequest::direct()).unwrap();
        assert_eq!(out.dims(), &[2, 5, 6]);
        assert!(out.abs()?.max_all()?.to_vec0::<f32>()? == 0.0);
        Ok(())
    }

    #[test]
    fn strategies_agree() -> CandleResult<()> {
        let device = Device::Cpu;
        let module = observable(MultiHeadConfig::new(6, 5, 5, 3, 2), portable());
        let q_x = input(&[2, 7, 6], &device)?;
        let kv_x = input(&[2, 4, 5], &device)?;
        let bias = input(&[2, 1, 7, 4], &device)?;

        let direct = module
            .attend(&q_x, &kv_x, &[bias.clone()], &StrategyRequest::direct())
            .unwrap();
        for request in [
            StrategyRequest::chunked(3),
            StrategyRequest::low_memory(2, 3),
            StrategyRequest::low_memory_default(),
        ] {
            let out = module.attend(&q_x, &kv_x, &[bias.clone()], &request).unwrap();
            let diff = out.sub(&direct)?.abs()?.max_all()?.to_vec0::<f32>()?;
            assert!(diff < 1e-5, "{request:?} diverged by {diff}");
        }
        Ok(())
    }

    #[test]
    fn chunked_strategy_keeps_projection_gradients() -> CandleResult<()> {
        let device = Device::Cpu;
        let config = MultiHeadConfig::new(6, 6, 6, 3, 2);
        let mut layers = observable(config, portable()).layers().clone();
        let weight = Var::from_tensor(layers.linear_q.weight())?;
        layers.linear_q = Linear::new(
            layers.linear_q.config().clone(),
            weight.as_tensor().clone(),
            layers.linear_q.bias().cloned(),
        )?;
        let module = MultiHeadGatedAttention::from_layers(config, layers, portable()).unwrap();
        let x = input(&[2, 5, 6], &device)?;
        let bias = input(&[2, 1, 5, 5], &device)?;

        let grad_for = |request: StrategyRequest| -> CandleResult<Tensor> {
            let out = module.attend(&x, &x, &[bias.clone()], &request).unwrap();
            let grads = out.sqr()?.sum_all()?.backward()?;
            Ok(grads.get(weight.as_tensor()).cloned().unwrap())
        };
        let direct = grad_for(StrategyRequest::direct())?;
        let chunked = grad_for(StrategyRequest::chunked(2))?;
        assert!(direct.abs()?.max_all()?.to_vec0::<f32>()? > 0.0);
        let diff = chunked.sub(&direct)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 1e-5, "gradients diverged by {diff}");
        Ok(())
    }

    #[test]
    fn fused_provider_matches_direct() -> CandleResult<()> {
        let device = Device::Cpu;
        let dispatcher = Arc::new(
            AttentionDispatcher::new(
                Config::default(),
                RuntimeCapabilities::with_fused(Arc::new(ScaledReferenceProvider)),
            )
            .unwrap(),
        );
        let module = observable(MultiHeadConfig::new(4, 4, 4, 2, 3), dispatcher);
        let x = input(&[1, 5, 4], &device)?;
        let direct = module.attend(&x, &x, &[], &StrategyRequest::direct()).unwrap();
        let fused = module.attend(&x, &x, &[], &StrategyRequest::fused()).unwrap();
        let diff = fused.sub(&direct)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 1e-5);
        Ok(())
    }

    #[test]
    fn configuration_errors_come_first() -> CandleResult<()> {
        let device = Device::Cpu;
        let module = observable(MultiHeadConfig::new(4, 4, 4, 2, 2), portable());
        let x = input(&[1, 3, 4], &device)?;
        let wrong = input(&[1, 3, 5], &device)?;

        let conflicting = StrategyRequest {
            use_lma: true,
            use_fused: true,
            ..StrategyRequest::default()
        };
        assert!(matches!(
            module.attend(&wrong, &wrong, &[], &conflicting),
            Err(AttentionError::InvalidConfig { .. })
        ));
        let half_lma = StrategyRequest {
            use_lma: true,
            kv_chunk_size: Some(2),
            ..StrategyRequest::default()
        };
        assert!(matches!(
            module.attend(&x, &x, &[], &half_lma),
            Err(AttentionError::InvalidConfig { .. })
        ));
        assert!(matches!(
            module.attend(&x, &x, &[], &StrategyRequest::fused()),
            Err(AttentionError::InvalidConfig { .. })
        ));
        assert!(matches!(
            module.attend(&wrong, &x, &[], &StrategyRequest::direct()),
            Err(AttentionError::InvalidShape { .. })
        ));
        Ok(())
    }

    #[test]
    fn incompatible_bias_is_a_shape_error() -> CandleResult<()> {
        let device = Device::Cpu;
        let module = observable(MultiHeadConfig::new(4, 4, 4, 2, 2), portable());
        let x = input(&[1, 3, 4], &device)?;
        let bias = Tensor::zeros((1, 2, 2, 3), DType::F32, &device)?;
        assert!(matches!(
            module.attend(&x, &x, &[bias], &StrategyRequest::direct()),
            Err(AttentionError::InvalidShape { .. })
        ));
        Ok(())
    }

    #[test]
    fn uniform_keys_average_values() -> CandleResult<()> {
        let device = Device::Cpu;
        let config = MultiHeadConfig::new(4, 3, 3, 2, 2).without_gating();
        let module = observable(config, portable());
        let q_x = input(&[1, 5, 4], &device)?;
        let row = Tensor::new(&[0.3f32, -0.7, 1.1], &device)?;
        let kv_x = row.broadcast_as((1, 6, 3))?.contiguous()?;

        let out = module.attend(&q_x, &kv_x, &[], &StrategyRequest::low_memory(2, 4)).unwrap();
        // Every query sees identical keys, so every row equals the projection
        // of the shared value regardless of the query.
        let first = out.narrow(1, 0, 1)?;
        let spread = out
            .broadcast_sub(&first)?
            .abs()?
            .max_keepdim(D::Minus1)?
            .max_all()?
            .to_vec0::<f32>()?;
        assert!(spread < 1e-5);
        Ok(())
    }

    #[test]
    fn mismatched_key_and_value_widths_are_rejected() {
        let device = Device::Cpu;
        assert!(matches!(
            MultiHeadGatedAttention::new(MultiHeadConfig::new(4, 4, 5, 2, 2), portable(), &device, DType::F32),
            Err(AttentionError::InvalidConfig { .. })
        ));
    }
}
