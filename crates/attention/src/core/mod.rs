//! Core traits and types shared across attention implementations.
//!
//! Kernels operate on `q [..., Q, C]`, `k [..., K, C]` and `v [..., K, Cv]`
//! whose leading axes (batch and heads) match exactly. The query arrives
//! pre-scaled; kernels never apply `1/sqrt(C)` themselves. The output is
//! `[..., Q, Cv]` in the dtype of `q`.

pub mod capabilities;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod shapes;
pub mod strategy;

use candle_core::Tensor;

pub use capabilities::RuntimeCapabilities;
pub use config::{Config, Precision};
pub use dispatch::AttentionDispatcher;
pub use errors::AttentionError;
pub use shapes::{validate_qkv, QkvDims};
pub use strategy::{
    AttentionStrategy, StrategyRequest, DEFAULT_LMA_KV_CHUNK_SIZE, DEFAULT_LMA_Q_CHUNK_SIZE,
};

/// Unified interface for attention kernels.
///
/// * `q`, `k`, `v` follow the layout described in the module docs.
/// * Each bias must broadcast to the `[..., Q, K]` logits
///   (see [`BiasCombiner`](crate::bias::BiasCombiner)).
/// * Working precision follows [`Config::precision`].
pub trait Attention {
    /// Computes `softmax(q k^T + sum(biases)) v`.
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        biases: &[Tensor],
        config: &Config,
    ) -> Result<Tensor, AttentionError>;
}
