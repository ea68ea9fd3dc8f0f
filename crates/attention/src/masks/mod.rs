//! Mask utilities shared by the attention heads.
//!
//! Position masks are multiplicative `f32` tensors with `1.0` for real
//! positions and `0.0` for padding. The functions here turn them into
//! additive biases using a large *finite* negative constant, never
//! `f32::NEG_INFINITY`: chunked softmax merging relies on masked logits
//! staying finite.

pub mod key;
pub mod pair;
pub mod padding;

use candle_core::DType;

/// Dtype shared by all masks built here.
pub const MASK_DTYPE: DType = DType::F32;

/// Default additive constant for masked query/key pairs.
pub const DEFAULT_PAIR_MASK_VALUE: f64 = -1e6;

pub use key::key_mask_bias;
pub use pair::pair_mask_bias;
pub use padding::{mask_from_booleans, mask_from_lengths};
