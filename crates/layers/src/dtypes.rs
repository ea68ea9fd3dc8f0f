//! Storage versus compute precision.
//!
//! Parameters may live in `f16`/`bf16`; projections and gates then run in
//! `f32`, and normalisation statistics never drop below `f32`.

use candle_core::{DType, Result, Tensor};

/// Dtypes used for storage, projections and reductions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecisionPolicy {
    storage: DType,
    compute: DType,
    reduction: DType,
}

impl PrecisionPolicy {
    /// Derives compute and reduction dtypes from the parameter dtype.
    pub fn for_storage(storage: DType) -> Self {
        let (compute, reduction) = match storage {
            DType::F16 | DType::BF16 => (DType::F32, DType::F32),
            DType::F64 => (DType::F64, DType::F64),
            other => (other, DType::F32),
        };
        Self {
            storage,
            compute,
            reduction,
        }
    }

    pub fn storage(&self) -> DType {
        self.storage
    }

    pub fn compute(&self) -> DType {
        self.compute
    }

    pub fn reduction(&self) -> DType {
        self.reduction
    }

    pub fn is_mixed_precision(&self) -> bool {
        self.storage != self.compute || self.compute != self.reduction
    }

    pub fn to_compute(&self, tensor: &Tensor) -> Result<Tensor> {
        cast(tensor, self.compute)
    }

    pub fn to_reduction(&self, tensor: &Tensor) -> Result<Tensor> {
        cast(tensor, self.reduction)
    }

    pub fn to_storage(&self, tensor: &Tensor) -> Result<Tensor> {
        cast(tensor, self.storage)
    }
}

fn cast(tensor: &Tensor, dtype: DType) -> Result<Tensor> {
    if tensor.dtype() == dtype {
        Ok(tensor.clone())
    } else {
        tensor.to_dtype(dtype)
    }
}
