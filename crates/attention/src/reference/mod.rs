//! Portable, exact attention.
//!
//! This path favours clarity over absolute performance and serves as the
//! baseline for validating the chunked strategies.

pub mod exact;

pub use exact::{attention_forward, ExactAttention};
