//! Additive bias terms combined with attention logits.
//!
//! A bias is any tensor that broadcasts to the `[..., Q, K]` logits: it may
//! have fewer axes (they are aligned from the right) and any axis may be `1`.
//! Masks, pair-derived biases and learned offsets all travel through here.

use candle_core::{DType, Result as CandleResult, Tensor};

use crate::core::AttentionError;

/// Validates and applies broadcastable bias tensors.
#[derive(Debug, Clone, Copy, Default)]
pub struct BiasCombiner;

impl BiasCombiner {
    /// Checks every bias against the logits shape without touching data.
    pub fn validate(logits_dims: &[usize], biases: &[Tensor]) -> Result<(), AttentionError> {
        for (index, bias) in biases.iter().enumerate() {
            let dims = bias.dims();
            if dims.len() > logits_dims.len() {
                return Err(AttentionError::shape(format!(
                    "bias {index} has rank {} but logits have rank {} ({dims:?} vs {logits_dims:?})",
                    dims.len(),
                    logits_dims.len()
                )));
            }
            let offset = logits_dims.len() - dims.len();
            for (axis, &size) in dims.iter().enumerate() {
                let target = logits_dims[offset + axis];
                if size != target && size != 1 {
                    return Err(AttentionError::shape(format!(
                        "bias {index} with shape {dims:?} does not broadcast to logits {logits_dims:?}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Returns `logits + sum(biases)` after validation.
    pub fn combine(logits: &Tensor, biases: &[Tensor]) -> Result<Tensor, AttentionError> {
        Self::validate(logits.dims(), biases)?;
        Ok(apply(logits, biases)?)
    }
}

/// Adds already-validated biases.
///
/// For half-precision logits the summed bias is clamped to
/// [`finite_bias_limit`] before the cast, so masking constants stay finite
/// and fully masked rows keep a defined softmax.
pub(crate) fn apply(logits: &Tensor, biases: &[Tensor]) -> CandleResult<Tensor> {
    let Some(total) = sum(biases)? else {
        return Ok(logits.clone());
    };
    let total = match finite_bias_limit(logits.dtype()) {
        Some(limit) => total.clamp(-limit, limit)?,
        None => total,
    };
    logits.broadcast_add(&total.to_dtype(logits.dtype())?)
}

/// Broadcast sum of `biases` in at least `f32`; `None` for an empty list.
pub(crate) fn sum(biases: &[Tensor]) -> CandleResult<Option<Tensor>> {
    let wide = if biases.iter().any(|b| b.dtype() == DType::F64) {
        DType::F64
    } else {
        DType::F32
    };
    let mut total: Option<Tensor> = None;
    for bias in biases {
        let bias = bias.to_dtype(wide)?;
        total = Some(match total {
            None => bias,
            Some(acc) => acc.broadcast_add(&bias)?,
        });
    }
    Ok(total)
}

/// Largest bias magnitude added to logits of `dtype`, or `None` when the
/// summed bias is already representable. Half of the finite range leaves
/// room for the logits themselves.
pub(crate) fn finite_bias_limit(dtype: DType) -> Option<f64> {
    match dtype {
        DType::F16 => Some(32_752.0),
        DType::BF16 => Some(1.0e38),
        _ => None,
    }
}

/// Whether `bias` carries a real (non-broadcast) query axis.
pub(crate) fn has_query_axis(bias: &Tensor) -> bool {
    let dims = bias.dims();
    dims.len() >= 2 && dims[dims.len() - 2] != 1
}

/// Slices the query axis of `bias`, leaving broadcast axes untouched.
pub(crate) fn slice_query(bias: &Tensor, start: usize, len: usize) -> CandleResult<Tensor> {
    if has_query_axis(bias) {
        bias.narrow(bias.rank() - 2, start, len)
    } else {
        Ok(bias.clone())
    }
}

/// Slices the key axis of `bias`, leaving broadcast axes untouched.
pub(crate) fn slice_key(bias: &Tensor, start: usize, len: usize) -> CandleResult<Tensor> {
    let dims = bias.dims();
    if !dims.is_empty() && dims[dims.len() - 1] != 1 {
        bias.narrow(bias.rank() - 1, start, len)
    } else {
        Ok(bias.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    use crate::ops::stable_softmax_last_dim;

    fn logits(device: &Device) -> CandleResult<Tensor> {
        Tensor::arange(0f32, 24.0, device)?.reshape((1, 2, 3, 4))
    }

    #[test]
    fn zero_bias_leaves_logits_unchanged() -> CandleResult<()> {
        let device = Device::Cpu;
        let logits = logits(&device)?;
        let zero = Tensor::zeros((1, 2, 3, 4), DType::F32, &device)?;
        let combined = BiasCombiner::combine(&logits, &[zero]).unwrap();
        assert_eq!(
            combined.flatten_all()?.to_vec1::<f32>()?,
            logits.flatten_all()?.to_vec1::<f32>()?
        );
        assert_eq!(
            BiasCombiner::combine(&logits, &[])
                .unwrap()
                .flatten_all()?
                .to_vec1::<f32>()?,
            logits.flatten_all()?.to_vec1::<f32>()?
        );
        Ok(())
    }

    #[test]
    fn masking_constant_drives_weight_to_zero() -> CandleResult<()> {
        let device = Device::Cpu;
        let logits = logits(&device)?;
        let mask = Tensor::new(&[0f32, -1e9, 0.0, 0.0], &device)?;
        let combined = BiasCombiner::combine(&logits, &[mask]).unwrap();
        let weights = stable_softmax_last_dim(&combined)?
            .flatten_to(2)?
            .to_vec2::<f32>()?;
        for row in weights {
            assert!(row[1] < 1e-12);
        }
        Ok(())
    }

    #[test]
    fn broadcast_axes_are_accepted() -> CandleResult<()> {
        let device = Device::Cpu;
        let dims = [2, 4, 3, 5];
        for shape in [
            vec![2, 1, 3, 5],
            vec![1, 4, 1, 5],
            vec![3, 1],
            vec![5],
            vec![],
        ] {
            let bias = Tensor::zeros(shape.as_slice(), DType::F32, &device)?;
            assert!(BiasCombiner::validate(&dims, &[bias]).is_ok(), "{shape:?}");
        }
        Ok(())
    }

    #[test]
    fn incompatible_trailing_dims_are_rejected() -> CandleResult<()> {
        let device = Device::Cpu;
        let dims = [2, 4, 3, 5];
        for shape in [vec![2, 4, 3, 4], vec![2, 4, 2, 5], vec![1, 2, 4, 3, 5]] {
            let bias = Tensor::zeros(shape.as_slice(), DType::F32, &device)?;
            assert!(
                matches!(
                    BiasCombiner::validate(&dims, &[bias]),
                    Err(AttentionError::InvalidShape { .. })
                ),
                "{shape:?}"
            );
        }
        Ok(())
    }

    #[test]
    fn slicing_skips_broadcast_axes() -> CandleResult<()> {
        let device = Device::Cpu;
        let full = Tensor::zeros((2, 6, 7), DType::F32, &device)?;
        assert_eq!(slice_query(&full, 2, 3)?.dims(), &[2, 3, 7]);
        assert_eq!(slice_key(&full, 1, 4)?.dims(), &[2, 6, 4]);

        let row = Tensor::zeros((2, 1, 7), DType::F32, &device)?;
        assert_eq!(slice_query(&row, 2, 3)?.dims(), &[2, 1, 7]);

        let column = Tensor::zeros((2, 6, 1), DType::F32, &device)?;
        assert_eq!(slice_key(&column, 1, 4)?.dims(), &[2, 6, 1]);
        Ok(())
    }

    #[test]
    fn half_logits_keep_masking_constants_finite() -> CandleResult<()> {
        let device = Device::Cpu;
        let logits = Tensor::zeros((1, 1, 2, 3), DType::F16, &device)?;
        let keys = Tensor::new(&[0f32, -1e9, -1e9], &device)?;
        let rows = Tensor::new(&[[0f32], [-1e6]], &device)?;
        let combined = apply(&logits, &[keys, rows])?;
        assert_eq!(combined.dtype(), DType::F16);
        let values = combined.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|v| v.is_finite()), "{values:?}");

        let weights = stable_softmax_last_dim(&combined.to_dtype(DType::F32)?)?
            .flatten_to(2)?
            .to_vec2::<f32>()?;
        assert!(weights[0][0] > 0.999);
        // The second row is masked everywhere and falls back to uniform weights.
        for w in &weights[1] {
            assert!((w - 1.0 / 3.0).abs() < 1e-3, "{:?}", weights[1]);
        }
        Ok(())
    }
}
