//! Layer normalisation over the trailing channel axis.
//!
//! Inputs follow the `(..., hidden)` convention; any number of leading axes is
//! preserved. Statistics (mean, variance) are promoted to
//! [`PrecisionPolicy::reduction`] before the output is cast back.
//!
//! Three parameterisations are supported, matching what the heads need:
//! scale and offset, scale only, and no affine parameters at all.

use candle_core::{Error, Result, Tensor, D};

use crate::{checks, dtypes::PrecisionPolicy};

/// Configuration for a [`LayerNorm`].
#[derive(Debug, Clone, PartialEq)]
pub struct NormConfig {
    /// Size of the channel axis being normalised.
    pub hidden_size: usize,
    /// Numeric stabiliser added to the variance.
    pub epsilon: f64,
}

impl NormConfig {
    /// Creates a configuration with the default epsilon of `1e-5`.
    pub fn new(hidden_size: usize) -> Self {
        Self {
            hidden_size,
            epsilon: 1e-5,
        }
    }
}

/// LayerNorm with optional scale and offset parameters.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    config: NormConfig,
    weight: Option<Tensor>,
    bias: Option<Tensor>,
}

impl LayerNorm {
    /// Constructs a LayerNorm with learnable scale and offset.
    pub fn new(weight: Tensor, bias: Tensor, config: NormConfig) -> Result<Self> {
        Self::build(config, Some(weight), Some(bias))
    }

    /// Constructs a LayerNorm with an affine scale but no offset.
    pub fn with_scale(weight: Tensor, config: NormConfig) -> Result<Self> {
        Self::build(config, Some(weight), None)
    }

    /// Constructs a LayerNorm without affine parameters.
    pub fn without_affine(config: NormConfig) -> Result<Self> {
        Self::build(config, None, None)
    }

    /// Scale = 1 and offset = 0, the usual fresh initialisation.
    pub fn identity(
        config: NormConfig,
        dtype: candle_core::DType,
        device: &candle_core::Device,
    ) -> Result<Self> {
        let weight = Tensor::ones(config.hidden_size, dtype, device)?;
        let bias = Tensor::zeros(config.hidden_size, dtype, device)?;
        Self::new(weight, bias, config)
    }

    fn build(config: NormConfig, weight: Option<Tensor>, bias: Option<Tensor>) -> Result<Self> {
        if config.hidden_size == 0 {
            return Err(Error::Msg("norm hidden_size must be non-zero".into()));
        }
        if let Some(weight) = &weight {
            checks::expect_shape("norm.weight", weight, &[config.hidden_size])?;
            checks::expect_dtype_in("norm.weight", weight, &checks::FLOAT_DTYPES)?;
        }
        if let Some(bias) = &bias {
            checks::expect_shape("norm.bias", bias, &[config.hidden_size])?;
            checks::expect_dtype_in("norm.bias", bias, &checks::FLOAT_DTYPES)?;
        }
        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    /// Returns the configuration so callers can check shape compatibility.
    pub fn config(&self) -> &NormConfig {
        &self.config
    }

    /// Normalises `hidden` along its last axis.
    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_last_dim("norm.input", hidden, self.config.hidden_size)?;

        let hidden_size = self.config.hidden_size as f64;
        let compute = policy.to_reduction(hidden)?;

        let mean = (compute.sum_keepdim(D::Minus1)? / hidden_size)?;
        let centered = compute.broadcast_sub(&mean)?;
        let variance = (centered.sqr()?.sum_keepdim(D::Minus1)? / hidden_size)?;
        let denom = (variance + self.config.epsilon)?.sqrt()?;
        let mut normalized = centered.broadcast_div(&denom)?;

        if normalized.dtype() != policy.compute() {
            normalized = normalized.to_dtype(policy.compute())?;
        }
        if let Some(weight) = &self.weight {
            normalized = normalized.broadcast_mul(&weight.to_dtype(normalized.dtype())?)?;
        }
        if let Some(bias) = &self.bias {
            normalized = normalized.broadcast_add(&bias.to_dtype(normalized.dtype())?)?;
        }

        policy.to_storage(&normalized)
    }
}
