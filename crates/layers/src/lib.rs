//! Building blocks for attention heads.
//!
//! The crate hosts the projection, normalisation and gating pieces that the
//! `attention` heads are assembled from. Everything operates on Candle
//! tensors whose trailing axis is the channel axis; leading axes are treated
//! as batch axes and preserved.

pub mod adaln;
pub mod checks;
pub mod dtypes;
pub mod gating;
pub mod linear;
pub mod norm;

use thiserror::Error;

/// Errors raised while configuring layers (forward passes use
/// `candle_core::Result`).
#[derive(Debug, Error)]
pub enum LayerError {
    /// An initialiser name did not match any known scheme.
    #[error("unknown linear initialiser '{0}'")]
    UnknownInit(String),
}

pub use adaln::AdaLN;
pub use dtypes::PrecisionPolicy;
pub use gating::sigmoid_gate;
pub use linear::{Linear, LinearConfig, LinearInit};
pub use norm::{LayerNorm, NormConfig};
