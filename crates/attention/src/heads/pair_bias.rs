//! Self-attention over a single representation with a learned pair bias.
//!
//! The single representation is conditioned on `cond` through [`AdaLN`],
//! attended with a per-head bias projected from the pair representation, and
//! the result passes an adaLN-Zero output gate. Both the attention output
//! projection and the gate start in a state that makes a fresh module return
//! zeros.

use std::sync::Arc;

use candle_core::{DType, Device, Result as CandleResult, Tensor};
use layers::{
    sigmoid_gate, AdaLN, LayerNorm, Linear, LinearConfig, LinearInit, NormConfig, PrecisionPolicy,
};

use crate::core::{AttentionDispatcher, AttentionError, AttentionStrategy, StrategyRequest};
use crate::heads::{flatten_last_two, heads_last, split_heads};
use crate::masks::{pair_mask_bias, DEFAULT_PAIR_MASK_VALUE, MASK_DTYPE};

/// Bias of the output gate at initialisation; `sigmoid(-2) ~ 0.12`.
const OUTPUT_GATE_BIAS: f64 = -2.0;

#[derive(Debug, Clone, PartialEq)]
pub struct PairBiasConfig {
    pub dim: usize,
    pub c_pair: usize,
    pub num_heads: usize,
    /// Added to the pair bias wherever either position is padding.
    pub mask_value: f64,
    pub strategy: StrategyRequest,
}

impl PairBiasConfig {
    pub fn new(dim: usize, c_pair: usize, num_heads: usize) -> Self {
        Self {
            dim,
            c_pair,
            num_heads,
            mask_value: DEFAULT_PAIR_MASK_VALUE,
            strategy: StrategyRequest::direct(),
        }
    }

    pub fn with_mask_value(mut self, mask_value: f64) -> Self {
        self.mask_value = mask_value;
        self
    }

    pub fn with_strategy(mut self, strategy: StrategyRequest) -> Self {
        self.strategy = strategy;
        self
    }

    /// Per-head width.
    pub fn head_dim(&self) -> usize {
        self.dim / self.num_heads
    }

    fn validate(&self) -> Result<(), AttentionError> {
        if self.dim == 0 || self.c_pair == 0 || self.num_heads == 0 {
            return Err(AttentionError::config(format!(
                "pair-bias attention dimensions must be non-zero: {self:?}"
            )));
        }
        if self.dim % self.num_heads != 0 {
            return Err(AttentionError::shape(format!(
                "dim {} is not divisible by num_heads {}",
                self.dim, self.num_heads
            )));
        }
        if !self.mask_value.is_finite() {
            return Err(AttentionError::config(format!(
                "pair mask value must be finite, got {}",
                self.mask_value
            )));
        }
        Ok(())
    }
}

/// Learned parameters of a [`PairBiasAttention`].
#[derive(Debug, Clone)]
pub struct PairBiasLayers {
    pub ada_ln: AdaLN,
    pub q_linear: Linear,
    pub k_linear: Linear,
    pub v_linear: Linear,
    pub layer_norm_pair: LayerNorm,
    pub linear_pair: Linear,
    pub gating_linear: Linear,
    pub attention_proj: Linear,
    pub output_gate: Linear,
}

impl PairBiasLayers {
    pub fn initialise(config: &PairBiasConfig, device: &Device, dtype: DType) -> CandleResult<Self> {
        let dim = config.dim;
        Ok(Self {
            ada_ln: AdaLN::new(dim, device, dtype)?,
            q_linear: Linear::with_init(LinearConfig::new(dim, dim), LinearInit::Glorot, device, dtype)?,
            k_linear: Linear::with_init(
                LinearConfig::without_bias(dim, dim),
                LinearInit::Glorot,
                device,
                dtype,
            )?,
            v_linear: Linear::with_init(
                LinearConfig::without_bias(dim, dim),
                LinearInit::Glorot,
                device,
                dtype,
            )?,
            layer_norm_pair: LayerNorm::identity(NormConfig::new(config.c_pair), dtype, device)?,
            linear_pair: Linear::with_init(
                LinearConfig::without_bias(config.c_pair, config.num_heads),
                LinearInit::Lecun,
                device,
                dtype,
            )?,
            gating_linear: Linear::with_init(
                LinearConfig::without_bias(dim, dim),
                LinearInit::Gating,
                device,
                dtype,
            )?,
            attention_proj: Linear::with_init(
                LinearConfig::without_bias(dim, dim),
                LinearInit::Final,
                device,
                dtype,
            )?,
            output_gate: Linear::with_init(LinearConfig::new(dim, dim), LinearInit::Gating, device, dtype)?
                .with_constant_bias(OUTPUT_GATE_BIAS)?,
        })
    }

    fn validate(&self, config: &PairBiasConfig) -> Result<(), AttentionError> {
        let dim = config.dim;
        if self.ada_ln.dim() != dim {
            return Err(AttentionError::shape(format!(
                "ada_ln: expected width {dim}, got {}",
                self.ada_ln.dim()
            )));
        }
        if self.layer_norm_pair.config().hidden_size != config.c_pair {
            return Err(AttentionError::shape(format!(
                "layer_norm_pair: expected width {}, got {}",
                config.c_pair,
                self.layer_norm_pair.config().hidden_size
            )));
        }
        for (label, linear, input, output) in [
            ("q_linear", &self.q_linear, dim, dim),
            ("k_linear", &self.k_linear, dim, dim),
            ("v_linear", &self.v_linear, dim, dim),
            ("linear_pair", &self.linear_pair, config.c_pair, config.num_heads),
            ("gating_linear", &self.gating_linear, dim, dim),
            ("attention_proj", &self.attention_proj, dim, dim),
            ("output_gate", &self.output_gate, dim, dim),
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

/// Pair-biased, adaLN-conditioned self-attention.
#[derive(Debug, Clone)]
pub struct PairBiasAttention {
    config: PairBiasConfig,
    layers: PairBiasLayers,
    strategy: AttentionStrategy,
    dispatcher: Arc<AttentionDispatcher>,
    policy: PrecisionPolicy,
}

impl PairBiasAttention {
    pub fn new(
        config: PairBiasConfig,
        dispatcher: Arc<AttentionDispatcher>,
        device: &Device,
        dtype: DType,
    ) -> Result<Self, AttentionError> {
        config.validate()?;
        let layers = PairBiasLayers::initialise(&config, device, dtype)?;
        Self::from_layers(config, layers, dispatcher)
    }

    /// Assembles the module from explicit parameters. The configured strategy
    /// is resolved and checked against the dispatcher here.
    pub fn from_layers(
        config: PairBiasConfig,
        layers: PairBiasLayers,
        dispatcher: Arc<AttentionDispatcher>,
    ) -> Result<Self, AttentionError> {
        config.validate()?;
        layers.validate(&config)?;
        let strategy = config.strategy.resolve()?;
        dispatcher.check(strategy, 1)?;
        let policy = PrecisionPolicy::for_storage(layers.q_linear.weight().dtype());
        Ok(Self {
            config,
            layers,
            strategy,
            dispatcher,
            policy,
        })
    }

    pub fn config(&self) -> &PairBiasConfig {
        &self.config
    }

    pub fn layers(&self) -> &PairBiasLayers {
        &self.layers
    }

    pub fn strategy(&self) -> AttentionStrategy {
        self.strategy
    }

    /// `single`, `cond [B, N, dim]`, `pair [B, N, N, c_pair]`, optional
    /// `mask [B, N]` (1 for real tokens) -> `[B, N, dim]`.
    pub fn pair_bias_attend(
        &self,
        single: &Tensor,
        cond: &Tensor,
        pair: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<Tensor, AttentionError> {
        self.validate_inputs(single, cond, pair, mask)?;
        let heads = self.config.num_heads;

        let a = self.layers.ada_ln.forward(single, cond, &self.policy)?;
        let mut q = split_heads(&self.layers.q_linear.forward(&a, &self.policy)?, heads)?;
        let k = split_heads(&self.layers.k_linear.forward(&a, &self.policy)?, heads)?;
        let v = split_heads(&self.layers.v_linear.forward(&a, &self.policy)?, heads)?;
        if !self.strategy.scales_internally() {
            q = (q / (self.config.head_dim() as f64).sqrt())?;
        }

        let bias = self.pair_bias(pair, mask)?;
        let o = self.dispatcher.run(self.strategy, &q, &k, &v, &[bias])?;
        Ok(self.wrap_up(&o)?)
    }

    /// `[B, H, N, N]` bias from the pair representation and the token mask.
    ///
    /// With a mask the bias stays in `f32`; the kernels fit it to their
    /// working dtype.
    fn pair_bias(&self, pair: &Tensor, mask: Option<&Tensor>) -> CandleResult<Tensor> {
        let normed = self.layers.layer_norm_pair.forward(pair, &self.policy)?;
        let mut bias = self.layers.linear_pair.forward(&normed, &self.policy)?;
        if let Some(mask) = mask {
            let masked = pair_mask_bias(&mask.to_dtype(MASK_DTYPE)?, self.config.mask_value)?;
            bias = bias.to_dtype(MASK_DTYPE)?.broadcast_add(&masked)?;
        }
        bias.permute((0, 3, 1, 2))
    }

    /// Per-head gate, projection, then the output gate driven by the
    /// projected output itself.
    fn wrap_up(&self, o: &Tensor) -> CandleResult<Tensor> {
        let o = flatten_last_two(&heads_last(o)?)?;
        let gate = self.layers.gating_linear.forward(&o, &self.policy)?;
        let o = sigmoid_gate(&gate, &o, &self.policy)?;
        let out = self.layers.attention_proj.forward(&o, &self.policy)?;
        let gate = self.layers.output_gate.forward(&out, &self.policy)?;
        sigmoid_gate(&gate, &out, &self.policy)
    }

    fn validate_inputs(
        &self,
        single: &Tensor,
        cond: &Tensor,
        pair: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<(), AttentionError> {
        let (dim, c_pair) = (self.config.dim, self.config.c_pair);
        let (b, n) = match single.dims() {
            &[b, n, d] if d == dim => (b, n),
            other => {
                return Err(AttentionError::shape(format!(
                    "single must be [B, N, {dim}], got {other:?}"
                )))
            }
        };
        if cond.dims() != single.dims() {
            return Err(AttentionError::shape(format!(
                "cond {:?} must match single {:?}",
                cond.dims(),
                single.dims()
            )));
        }
        if pair.dims() != [b, n, n, c_pair] {
            return Err(AttentionError::shape(format!(
                "pair must be [{b}, {n}, {n}, {c_pair}], got {:?}",
                pair.dims()
            )));
        }
        if let Some(mask) = mask {
            if mask.dims() != [b, n] {
                return Err(AttentionError::shape(format!(
                    "mask must be [{b}, {n}], got {:?}",
                    mask.dims()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::core::{Config, Precision, RuntimeCapabilities};
    use crate::fused::ScaledReferenceProvider;

    fn input(dims: &[usize], seed: usize, device: &Device) -> CandleResult<Tensor> {
        let len: usize = dims.iter().product();
        let data = (0..len)
            .map(|i| (((i + seed) * 13 + 7) % 19) as f32 / 9.5 - 1.0)
            .collect::<Vec<_>>();
        Tensor::from_vec(data, dims, device)
    }

    fn portable() -> Arc<AttentionDispatcher> {
        Arc::new(AttentionDispatcher::portable())
    }

    /// Fresh layers with a non-zero attention projection.
    fn observable(config: PairBiasConfig, dispatcher: Arc<AttentionDispatcher>) -> PairBiasAttention {
        let device = Device::Cpu;
        let mut layers = PairBiasLayers::initialise(&config, &device, DType::F32).unwrap();
        layers.attention_proj = Linear::with_init(
            LinearConfig::without_bias(config.dim, config.dim),
            LinearInit::Glorot,
            &device,
            DType::F32,
        )
        .unwrap();
        PairBiasAttention::from_layers(config, layers, dispatcher).unwrap()
    }

    fn max_diff(a: &Tensor, b: &Tensor) -> CandleResult<f32> {
        a.sub(b)?.abs()?.max_all()?.to_vec0::<f32>()
    }

    #[test]
    fn fresh_module_outputs_zero() -> CandleResult<()> {
        let device = Device::Cpu;
        let module =
            PairBiasAttention::new(PairBiasConfig::new(8, 3, 2), portable(), &device, DType::F32).unwrap();
        let single = input(&[2, 5, 8], 0, &device)?;
        let cond = input(&[2, 5, 8], 3, &device)?;
        let pair = input(&[2, 5, 5, 3], 1, &device)?;
        let out = module.pair_bias_attend(&single, &cond, &pair, None).unwrap();
        assert_eq!(out.dims(), &[2, 5, 8]);
        assert_eq!(out.abs()?.max_all()?.to_vec0::<f32>()?, 0.0);
        Ok(())
    }

    #[test]
    fn padded_tokens_do_not_leak() -> CandleResult<()> {
        let device = Device::Cpu;
        let module = observable(PairBiasConfig::new(6, 4, 3), portable());
        let single = input(&[1, 5, 6], 0, &device)?;
        let cond = input(&[1, 5, 6], 2, &device)?;
        let pair = input(&[1, 5, 5, 4], 5, &device)?;
        let mask = Tensor::new(&[[1f32, 1.0, 1.0, 0.0, 0.0]], &device)?;

        let base = module.pair_bias_attend(&single, &cond, &pair, Some(&mask)).unwrap();
        let noise = Tensor::cat(
            &[
                Tensor::zeros((1, 3, 6), DType::F32, &device)?,
                (input(&[1, 2, 6], 11, &device)? * 25.0)?,
            ],
            1,
        )?;
        let perturbed = (&single + &noise)?;
        let moved = module.pair_bias_attend(&perturbed, &cond, &pair, Some(&mask)).unwrap();

        assert!(max_diff(&base.narrow(1, 0, 3)?, &moved.narrow(1, 0, 3)?)? < 1e-5);
        assert!(max_diff(&base, &moved)? > 1e-3);
        Ok(())
    }

    #[test]
    fn half_precision_padding_stays_finite() -> CandleResult<()> {
        let device = Device::Cpu;
        let single = input(&[1, 4, 4], 0, &device)?.to_dtype(DType::F16)?;
        let pair = input(&[1, 4, 4, 3], 2, &device)?.to_dtype(DType::F16)?;
        let mask = Tensor::new(&[[1f32, 1.0, 1.0, 0.0]], &device)?;
        let inherit = Config {
            precision: Precision::Inherit,
            ..Config::default()
        };
        let inherit = Arc::new(AttentionDispatcher::new(inherit, RuntimeCapabilities::none()).unwrap());

        for dispatcher in [portable(), inherit] {
            for request in [
                StrategyRequest::direct(),
                StrategyRequest::chunked(2),
                StrategyRequest::low_memory(2, 2),
            ] {
                let config = PairBiasConfig::new(4, 3, 2).with_strategy(request);
                let mut layers = PairBiasLayers::initialise(&config, &device, DType::F16).unwrap();
                layers.attention_proj = Linear::with_init(
                    LinearConfig::without_bias(4, 4),
                    LinearInit::Glorot,
                    &device,
                    DType::F16,
                )?;
                let module = PairBiasAttention::from_layers(config, layers, dispatcher.clone()).unwrap();
                let out = module
                    .pair_bias_attend(&single, &single, &pair, Some(&mask))
                    .unwrap();
                assert_eq!(out.dtype(), DType::F16);
                let values = out.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
                assert!(
                    values.iter().all(|v| v.is_finite()),
                    "{request:?} under {:?}: {values:?}",
                    dispatcher.config().precision
                );
            }
        }
        Ok(())
    }

    #[test]
    fn output_gate_reads_the_projected_output() -> CandleResult<()> {
        let device = Device::Cpu;
        let config = PairBiasConfig::new(4, 2, 2);
        let mut layers = PairBiasLayers::initialise(&config, &device, DType::F32).unwrap();
        layers.attention_proj = Linear::with_init(
            LinearConfig::without_bias(4, 4),
            LinearInit::Glorot,
            &device,
            DType::F32,
        )?;
        // A steep identity gate lets positive outputs through and closes on negative ones.
        layers.output_gate = Linear::new(
            LinearConfig::new(4, 4),
            (Tensor::eye(4, DType::F32, &device)? * 50.0)?,
            Some(Tensor::zeros(4, DType::F32, &device)?),
        )?;
        let module = PairBiasAttention::from_layers(config, layers, portable()).unwrap();

        let single = input(&[2, 5, 4], 1, &device)?;
        let cond = input(&[2, 5, 4], 6, &device)?;
        let pair = input(&[2, 5, 5, 2], 3, &device)?;
        let values = module
            .pair_bias_attend(&single, &cond, &pair, None)
            .unwrap()
            .flatten_all()?
            .to_vec1::<f32>()?;
        assert!(values.iter().all(|v| *v > -0.01), "{values:?}");
        assert!(values.iter().any(|v| *v > 0.01));
        Ok(())
    }

    #[test]
    fn strategies_agree() -> CandleResult<()> {
        let device = Device::Cpu;
        let single = input(&[2, 7, 6], 1, &device)?;
        let cond = input(&[2, 7, 6], 4, &device)?;
        let pair = input(&[2, 7, 7, 2], 9, &device)?;
        let mask = Tensor::new(
            &[[1f32, 1.0, 1.0, 1.0, 1.0, 0.0, 0.0], [1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0]],
            &device,
        )?;

        let config = PairBiasConfig::new(6, 2, 2);
        let reference = observable(config.clone(), portable());
        let direct = reference.pair_bias_attend(&single, &cond, &pair, Some(&mask)).unwrap();

        for request in [StrategyRequest::chunked(3), StrategyRequest::low_memory(2, 4)] {
            let module = PairBiasAttention::from_layers(
                config.clone().with_strategy(request),
                reference.layers().clone(),
                portable(),
            )
            .unwrap();
            let out = module.pair_bias_attend(&single, &cond, &pair, Some(&mask)).unwrap();
            assert!(max_diff(&out, &direct)? < 1e-5, "{request:?}");
        }

        let fused = PairBiasAttention::from_layers(
            config.with_strategy(StrategyRequest::fused()),
            reference.layers().clone(),
            Arc::new(
                AttentionDispatcher::new(
                    Config::default(),
                    RuntimeCapabilities::with_fused(Arc::new(ScaledReferenceProvider)),
                )
                .unwrap(),
            ),
        )
        .unwrap();
        let out = fused.pair_bias_attend(&single, &cond, &pair, Some(&mask)).unwrap();
        assert!(max_diff(&out, &direct)? < 1e-5);
        Ok(())
    }

    #[test]
    fn configuration_errors() {
        let device = Device::Cpu;
        assert!(matches!(
            PairBiasAttention::new(PairBiasConfig::new(7, 2, 2), portable(), &device, DType::F32),
            Err(AttentionError::InvalidShape { .. })
        ));
        assert!(matches!(
            PairBiasAttention::new(
                PairBiasConfig::new(8, 2, 2).with_strategy(StrategyRequest::fused()),
                portable(),
                &device,
                DType::F32
            ),
            Err(AttentionError::InvalidConfig { .. })
        ));
        assert!(matches!(
            PairBiasAttention::new(
                PairBiasConfig::new(8, 2, 2).with_mask_value(f64::NEG_INFINITY),
                portable(),
                &device,
                DType::F32
            ),
            Err(AttentionError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn input_shapes_are_checked() -> CandleResult<()> {
        let device = Device::Cpu;
        let module = observable(PairBiasConfig::new(4, 2, 2), portable());
        let single = input(&[1, 3, 4], 0, &device)?;
        let pair = input(&[1, 3, 3, 2], 0, &device)?;
        let bad_pair = input(&[1, 3, 2, 2], 0, &device)?;
        let bad_mask = Tensor::ones((1, 4), DType::F32, &device)?;

        assert!(matches!(
            module.pair_bias_attend(&single, &single, &bad_pair, None),
            Err(AttentionError::InvalidShape { .. })
        ));
        assert!(matches!(
            module.pair_bias_attend(&single, &single, &pair, Some(&bad_mask)),
            Err(AttentionError::InvalidShape { .. })
        ));
        assert!(module.pair_bias_attend(&single, &single, &pair, None).is_ok());
        Ok(())
    }
}
