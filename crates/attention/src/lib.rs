//! Attention kernels and heads for structure-prediction trunks.
//!
//! Kernels take `q [..., Q, C]`, `k [..., K, C]` and `v [..., K, Cv]` with
//! identical leading dims (batch and head axes alike) plus any number of
//! additive biases broadcastable to `[..., Q, K]`. The query arrives
//! pre-scaled. Four interchangeable strategies compute the same result:
//!
//! * direct ([`ExactAttention`]): full logits, stable softmax;
//! * chunked recompute ([`ChunkedAttention`]): query chunks evaluated without
//!   a retained graph and replayed for gradients;
//! * low memory ([`LowMemoryAttention`]): nested query/key chunks merged with
//!   an online softmax;
//! * fused: an injected [`FusedAttention`] provider.
//!
//! Masking always uses a large *finite* negative constant; chunked softmax
//! merging depends on masked logits staying finite.
//!
//! The heads in [`heads`] project raw representations, route their kernel
//! call through an [`AttentionDispatcher`] and gate the result.

pub mod bias;
pub mod chunked;
pub mod core;
pub mod fused;
pub mod heads;
pub mod lma;
pub mod masks;
pub(crate) mod ops;
pub mod reference;

pub use bias::BiasCombiner;
pub use chunked::{AttentionGrads, ChunkReplay, ChunkedAttention};
pub use self::core::{
    Attention, AttentionDispatcher, AttentionError, AttentionStrategy, Config, Precision,
    RuntimeCapabilities, StrategyRequest,
};
pub use fused::FusedAttention;
pub use heads::{
    GlobalAttention, GlobalAttentionConfig, MultiHeadConfig, MultiHeadGatedAttention,
    PairBiasAttention, PairBiasConfig,
};
pub use lma::{LowMemoryAttention, PartialSoftmax};
pub use reference::ExactAttention;
