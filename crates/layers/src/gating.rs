//! Sigmoid gating shared by the attention heads.

use candle_core::{Result, Tensor};
use candle_nn::ops::sigmoid;

use crate::dtypes::PrecisionPolicy;

/// Returns `sigmoid(signal) * value`, broadcasting `signal` against `value`.
///
/// Both operands are promoted to the compute dtype; the product is cast back
/// to storage.
pub fn sigmoid_gate(signal: &Tensor, value: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
    let gate = sigmoid(&policy.to_compute(signal)?)?;
    let value = policy.to_compute(value)?;
    policy.to_storage(&value.broadcast_mul(&gate)?)
}
