//! Fused attention providers.
//!
//! Hardware-specific kernels live outside this crate. They plug in through
//! [`FusedAttention`] and reach the dispatcher via
//! [`RuntimeCapabilities`](crate::core::RuntimeCapabilities). Unlike the
//! portable kernels, a fused provider receives an unscaled query and applies
//! `1/sqrt(C)` itself.

use std::fmt::Debug;

use candle_core::Tensor;

use crate::core::AttentionError;
use crate::reference::attention_forward;

/// Most bias terms a fused provider is handed.
pub const MAX_FUSED_BIASES: usize = 2;

/// An external kernel computing scaled dot-product attention.
pub trait FusedAttention: Debug + Send + Sync {
    /// Identifier used in logs.
    fn name(&self) -> &str;

    /// Attends with an unscaled `q`; shapes and biases are pre-validated.
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        biases: &[Tensor],
    ) -> Result<Tensor, AttentionError>;
}

/// Portable provider that scales the query and runs the exact kernel.
///
/// Useful wherever code paths behind the fused capability need exercising
/// without an accelerator.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScaledReferenceProvider;

impl FusedAttention for ScaledReferenceProvider {
    fn name(&self) -> &str {
        "scaled-reference"
    }

    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        biases: &[Tensor],
    ) -> Result<Tensor, AttentionError> {
        let channels = q.dim(candle_core::D::Minus1)?;
        let q = (q / (channels as f64).sqrt())?;
        Ok(attention_forward(&q, k, v, biases)?)
    }
}
