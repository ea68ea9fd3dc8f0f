//! Attention heads assembled from `layers` building blocks.
//!
//! Every head projects its inputs, routes the kernel call through a shared
//! [`AttentionDispatcher`](crate::core::AttentionDispatcher) and gates the
//! result. Output projections start at zero so a fresh head contributes
//! nothing to an enclosing residual stream.

pub mod global;
pub mod multi_head;
pub mod pair_bias;

use candle_core::{Result, Tensor};

pub use global::{GlobalAttention, GlobalAttentionConfig, GlobalAttentionLayers};
pub use multi_head::{MultiHeadConfig, MultiHeadGatedAttention, MultiHeadLayers};
pub use pair_bias::{PairBiasAttention, PairBiasConfig, PairBiasLayers};

/// `[..., L, H * C]` -> `[..., H, L, C]`.
pub(crate) fn split_heads(x: &Tensor, heads: usize) -> Result<Tensor> {
    let dims = x.dims();
    let rank = dims.len();
    let width = dims[rank - 1];
    let mut shape = dims[..rank - 1].to_vec();
    shape.push(heads);
    shape.push(width / heads);
    x.reshape(shape)?.transpose(rank - 2, rank - 1)
}

/// `[..., H, L, C]` -> `[..., L, H, C]`.
pub(crate) fn heads_last(x: &Tensor) -> Result<Tensor> {
    let rank = x.rank();
    x.transpose(rank - 3, rank - 2)
}

/// Merges the trailing two axes.
pub(crate) fn flatten_last_two(x: &Tensor) -> Result<Tensor> {
    let dims = x.dims();
    let rank = dims.len();
    let mut shape = dims[..rank - 2].to_vec();
    shape.push(dims[rank - 2] * dims[rank - 1]);
    x.reshape(shape)
}

/// Splits the trailing axis into `[heads, width / heads]`.
pub(crate) fn unflatten_last(x: &Tensor, heads: usize) -> Result<Tensor> {
    let dims = x.dims();
    let rank = dims.len();
    let mut shape = dims[..rank - 1].to_vec();
    shape.push(heads);
    shape.push(dims[rank - 1] / heads);
    x.reshape(shape)
}
