//! Linear projections with the initialisation conventions used by the trunk.
//!
//! Inputs may have any number of leading axes, `(..., in_dim)`, and come back
//! as `(..., out_dim)`. Matmuls run in [`PrecisionPolicy::compute`] and the
//! result is cast with
//! [`PrecisionPolicy::to_storage`](crate::dtypes::PrecisionPolicy::to_storage).
//!
//! Initialisers follow the structure-module recipes:
//!
//! * `default`: LeCun fan-in truncated normal.
//! * `relu`: He truncated normal.
//! * `glorot`: fan-average Glorot uniform.
//! * `gating`: weights 0, bias 1, so `sigmoid(gate)` starts near 0.73.
//! * `normal`: normal with std `1/sqrt(fan_in)`.
//! * `final`: weights 0, bias 0, so the layer initially contributes nothing.

use std::str::FromStr;

use candle_core::{DType, Device, Error, Result, Tensor};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::{checks, dtypes::PrecisionPolicy, LayerError};

/// Standard deviation of a unit normal truncated to `[-2, 2]`.
const TRUNCATED_NORMAL_STD: f64 = 0.879_625_661_034_239_8;

/// Configuration shared by dense projection layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearConfig {
    /// Incoming feature dimension.
    pub input_dim: usize,
    /// Output feature dimension.
    pub output_dim: usize,
    /// Whether a learnable bias vector should be applied.
    pub bias: bool,
}

impl LinearConfig {
    /// Creates a configuration for a projection with a bias vector.
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: true,
        }
    }

    /// Creates a configuration for a projection without a bias vector.
    pub fn without_bias(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: false,
        }
    }
}

/// Supported weight initialisation policies.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LinearInit {
    /// LeCun fan-in truncated normal (`scale = 1`).
    Lecun,
    /// He truncated normal (`scale = 2`).
    He,
    /// Fan-average Glorot uniform.
    Glorot,
    /// Zero weights with the bias filled with ones.
    Gating,
    /// Normal with standard deviation `1/sqrt(fan_in)`.
    Normal,
    /// Zero weights and zero bias.
    Final,
}

impl Default for LinearInit {
    fn default() -> Self {
        Self::Lecun
    }
}

impl FromStr for LinearInit {
    type Err = LayerError;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value {
            "default" => Ok(Self::Lecun),
            "relu" => Ok(Self::He),
            "glorot" => Ok(Self::Glorot),
            "gating" => Ok(Self::Gating),
            "normal" => Ok(Self::Normal),
            "final" => Ok(Self::Final),
            other => Err(LayerError::UnknownInit(other.to_string())),
        }
    }
}

impl LinearInit {
    fn sample_weight(&self, shape: (usize, usize), device: &Device, dtype: DType) -> Result<Tensor> {
        let (out_dim, in_dim) = shape;
        let (fan_in, fan_out) = (in_dim as f64, out_dim as f64);
        let weight_f32 = match self {
            LinearInit::Lecun => truncated_normal(shape, 1.0 / fan_in.max(1.0), device)?,
            LinearInit::He => truncated_normal(shape, 2.0 / fan_in.max(1.0), device)?,
            LinearInit::Glorot => {
                let bound = (6.0f64 / (fan_in + fan_out)).sqrt();
                Tensor::rand(-bound as f32, bound as f32, shape, device)?
            }
            LinearInit::Normal => {
                let std = 1.0 / fan_in.max(1.0).sqrt();
                Tensor::randn(0f32, std as f32, shape, device)?
            }
            LinearInit::Gating | LinearInit::Final => Tensor::zeros(shape, DType::F32, device)?,
        };
        weight_f32.to_dtype(dtype)
    }

    fn bias_fill(&self) -> f64 {
        match self {
            LinearInit::Gating => 1.0,
            _ => 0.0,
        }
    }
}

/// Samples `N(0, variance)` truncated to two standard deviations, rescaled so
/// the truncated distribution keeps the requested variance.
fn truncated_normal(shape: (usize, usize), variance: f64, device: &Device) -> Result<Tensor> {
    let std = variance.sqrt() / TRUNCATED_NORMAL_STD;
    let mut rng = rand::thread_rng();
    let total = shape.0 * shape.1;
    let mut data = Vec::with_capacity(total);
    while data.len() < total {
        let z: f64 = rng.sample(StandardNormal);
        if (-2.0..=2.0).contains(&z) {
            data.push((z * std) as f32);
        }
    }
    Tensor::from_vec(data, shape, device)
}

/// Dense affine projection with an optional bias.
#[derive(Debug, Clone)]
pub struct Linear {
    config: LinearConfig,
    weight: Tensor,
    bias: Option<Tensor>,
}

impl Linear {
    /// Constructs a linear layer from pre-existing parameters.
    ///
    /// `weight` is laid out `(output_dim, input_dim)`.
    pub fn new(config: LinearConfig, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        Self::validate_weight(&config, &weight)?;
        Self::validate_bias(&config, bias.as_ref())?;
        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    /// Builds a linear layer with weights drawn from `init`.
    pub fn with_init(
        config: LinearConfig,
        init: LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let weight = init.sample_weight((config.output_dim, config.input_dim), device, dtype)?;
        let bias = if config.bias {
            Some(Tensor::full(init.bias_fill() as f32, config.output_dim, device)?.to_dtype(dtype)?)
        } else {
            None
        };
        Self::new(config, weight, bias)
    }

    /// Replaces the bias with a constant vector.
    pub fn with_constant_bias(self, value: f64) -> Result<Self> {
        if !self.config.bias {
            return Err(Error::Msg("layer was configured without a bias".into()));
        }
        let bias = Tensor::full(value as f32, self.config.output_dim, self.weight.device())?
            .to_dtype(self.weight.dtype())?;
        Self::new(self.config, self.weight, Some(bias))
    }

    /// Returns the static configuration.
    pub fn config(&self) -> &LinearConfig {
        &self.config
    }

    /// Returns the weight tensor, laid out `(output_dim, input_dim)`.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Returns the bias tensor if present.
    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    fn validate_weight(config: &LinearConfig, weight: &Tensor) -> Result<()> {
        checks::expect_rank("linear.weight", weight, 2)?;
        checks::expect_shape(
            "linear.weight",
            weight,
            &[config.output_dim, config.input_dim],
        )?;
        checks::expect_dtype_in("linear.weight", weight, &checks::FLOAT_DTYPES)?;
        checks::expect_contiguous("linear.weight", weight)?;
        Ok(())
    }

    fn validate_bias(config: &LinearConfig, bias: Option<&Tensor>) -> Result<()> {
        match (config.bias, bias) {
            (true, Some(tensor)) => {
                checks::expect_shape("linear.bias", tensor, &[config.output_dim])?;
                checks::expect_dtype_in("linear.bias", tensor, &checks::FLOAT_DTYPES)?;
                Ok(())
            }
            (false, Some(_)) => Err(Error::Msg("bias provided but config disables bias".into())),
            (true, None) => Err(Error::Msg("config expects bias but none supplied".into())),
            (false, None) => Ok(()),
        }
    }

    /// Applies the projection to a `(..., input_dim)` tensor.
    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_last_dim("linear.input", hidden, self.config.input_dim)?;

        let dims = hidden.dims();
        let leading = &dims[..dims.len() - 1];
        let rows: usize = leading.iter().product();

        let input = policy.to_compute(hidden)?;
        let weight = policy.to_compute(&self.weight)?;
        let flat = input.reshape((rows, self.config.input_dim))?;
        let mut output = flat.matmul(&weight.t()?)?;

        if let Some(bias) = &self.bias {
            output = output.broadcast_add(&policy.to_compute(bias)?)?;
        }

        let mut out_dims = leading.to_vec();
        out_dims.push(self.config.output_dim);
        policy.to_storage(&output.reshape(out_dims)?)
    }
}
