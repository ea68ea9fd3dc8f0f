//! Shape and dtype validation for kernel inputs.
//!
//! Kernels take `q [..., Q, C]`, `k [..., K, C]` and `v [..., K, Cv]`. The
//! leading axes (heads included) must match exactly across the three inputs.

use candle_core::{DType, Device, Tensor};

use crate::core::{AttentionError, Precision};

/// Dimensions extracted from validated `q`, `k`, `v`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QkvDims {
    pub leading: Vec<usize>,
    pub q_len: usize,
    pub k_len: usize,
    pub channels: usize,
    pub value_channels: usize,
}

impl QkvDims {
    /// Shape of the `[..., Q, K]` logits tensor.
    pub fn logits_dims(&self) -> Vec<usize> {
        let mut dims = self.leading.clone();
        dims.push(self.q_len);
        dims.push(self.k_len);
        dims
    }

    /// Shape of the `[..., Q, Cv]` output tensor.
    pub fn output_dims(&self) -> Vec<usize> {
        let mut dims = self.leading.clone();
        dims.push(self.q_len);
        dims.push(self.value_channels);
        dims
    }

    /// Index of the query axis.
    pub fn query_axis(&self) -> usize {
        self.leading.len()
    }
}

/// Checks device, dtype and shape agreement between `q`, `k` and `v`.
pub fn validate_qkv(q: &Tensor, k: &Tensor, v: &Tensor) -> Result<QkvDims, AttentionError> {
    let device = q.device();
    if !device.same_device(k.device()) || !device.same_device(v.device()) {
        return Err(AttentionError::shape("q, k, v must reside on the same device"));
    }

    let dtype = q.dtype();
    if dtype != k.dtype() || dtype != v.dtype() {
        return Err(AttentionError::shape(format!(
            "q, k, v must share the same dtype, got {:?}/{:?}/{:?}",
            dtype,
            k.dtype(),
            v.dtype()
        )));
    }
    if !matches!(dtype, DType::F16 | DType::BF16 | DType::F32 | DType::F64) {
        return Err(AttentionError::UnsupportedDType {
            requested: format!("{dtype:?}"),
        });
    }

    let (q_dims, k_dims, v_dims) = (q.dims(), k.dims(), v.dims());
    if q_dims.len() < 3 {
        return Err(AttentionError::shape(format!(
            "q must have shape [..., heads, q_len, channels], got {q_dims:?}"
        )));
    }
    if k_dims.len() != q_dims.len() || v_dims.len() != q_dims.len() {
        return Err(AttentionError::shape(format!(
            "q, k, v must share a rank, got {q_dims:?}, {k_dims:?}, {v_dims:?}"
        )));
    }

    let rank = q_dims.len();
    let leading = &q_dims[..rank - 2];
    if &k_dims[..rank - 2] != leading || &v_dims[..rank - 2] != leading {
        return Err(AttentionError::shape(format!(
            "batch dimensions differ across q, k, v: {q_dims:?}, {k_dims:?}, {v_dims:?}"
        )));
    }

    let (q_len, channels) = (q_dims[rank - 2], q_dims[rank - 1]);
    let (k_len, k_channels) = (k_dims[rank - 2], k_dims[rank - 1]);
    let (v_len, value_channels) = (v_dims[rank - 2], v_dims[rank - 1]);
    if k_channels != channels {
        return Err(AttentionError::shape(format!(
            "k channels {k_channels} do not match q channels {channels}"
        )));
    }
    if v_len != k_len {
        return Err(AttentionError::shape(format!(
            "v length {v_len} does not match k length {k_len}"
        )));
    }
    if q_len == 0 || k_len == 0 {
        return Err(AttentionError::shape("q_len and k_len must be non-zero"));
    }

    Ok(QkvDims {
        leading: leading.to_vec(),
        q_len,
        k_len,
        channels,
        value_channels,
    })
}

/// The dtype the score matrix is computed in on `device`.
///
/// The CPU backend has no bf16 matmul, so `Inherit` still promotes bf16
/// there.
pub fn working_dtype(input: DType, precision: Precision, device: &Device) -> DType {
    match (precision, input) {
        (Precision::ForceF32, DType::F16 | DType::BF16) => DType::F32,
        (Precision::Inherit, DType::BF16) if device.is_cpu() => DType::F32,
        (_, dtype) => dtype,
    }
}

/// Casts `q`, `k`, `v` to the working dtype for `precision`.
pub(crate) fn promote_qkv(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    precision: Precision,
) -> candle_core::Result<(Tensor, Tensor, Tensor)> {
    let dtype = working_dtype(q.dtype(), precision, q.device());
    if dtype == q.dtype() {
        return Ok((q.clone(), k.clone(), v.clone()));
    }
    Ok((q.to_dtype(dtype)?, k.to_dtype(dtype)?, v.to_dtype(dtype)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Result};

    fn zeros(dims: &[usize]) -> Result<Tensor> {
        Tensor::zeros(dims, DType::F32, &Device::Cpu)
    }

    #[test]
    fn accepts_matching_inputs() -> Result<()> {
        let dims = validate_qkv(
            &zeros(&[2, 3, 4, 8])?,
            &zeros(&[2, 3, 5, 8])?,
            &zeros(&[2, 3, 5, 6])?,
        )
        .unwrap();
        assert_eq!(dims.logits_dims(), vec![2, 3, 4, 5]);
        assert_eq!(dims.output_dims(), vec![2, 3, 4, 6]);
        assert_eq!(dims.query_axis(), 2);
        Ok(())
    }

    #[test]
    fn rejects_batch_and_channel_mismatches() -> Result<()> {
        let q = zeros(&[2, 3, 4, 8])?;
        assert!(matches!(
            validate_qkv(&q, &zeros(&[1, 3, 4, 8])?, &zeros(&[1, 3, 4, 8])?),
            Err(AttentionError::InvalidShape { .. })
        ));
        assert!(matches!(
            validate_qkv(&q, &zeros(&[2, 3, 4, 7])?, &zeros(&[2, 3, 4, 8])?),
            Err(AttentionError::InvalidShape { .. })
        ));
        assert!(matches!(
            validate_qkv(&q, &zeros(&[2, 3, 4, 8])?, &zeros(&[2, 3, 5, 8])?),
            Err(AttentionError::InvalidShape { .. })
        ));
        assert!(validate_qkv(&zeros(&[4, 8])?, &zeros(&[4, 8])?, &zeros(&[4, 8])?).is_err());
        Ok(())
    }

    #[test]
    fn rejects_integer_inputs() -> Result<()> {
        let q = Tensor::zeros((1, 2, 2), DType::U32, &Device::Cpu)?;
        assert!(matches!(
            validate_qkv(&q, &q, &q),
            Err(AttentionError::UnsupportedDType { .. })
        ));
        Ok(())
    }

    #[test]
    fn working_dtype_promotes_half_precision() {
        let cpu = Device::Cpu;
        assert_eq!(working_dtype(DType::BF16, Precision::ForceF32, &cpu), DType::F32);
        assert_eq!(working_dtype(DType::F16, Precision::Inherit, &cpu), DType::F16);
        assert_eq!(working_dtype(DType::F64, Precision::ForceF32, &cpu), DType::F64);
    }

    #[test]
    fn inherit_promotes_bf16_on_cpu_only() {
        assert_eq!(
            working_dtype(DType::BF16, Precision::Inherit, &Device::Cpu),
            DType::F32
        );
        assert_eq!(
            working_dtype(DType::F32, Precision::Inherit, &Device::Cpu),
            DType::F32
        );
    }
}
