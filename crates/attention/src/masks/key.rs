//! Key-side masking biases.

use candle_core::{Result, Tensor};

/// `inf * (mask - 1)` with a query axis inserted: `[..., K]` -> `[..., 1, K]`.
///
/// Real keys get `0`, padded keys get `-inf` (the finite constant `inf`).
pub fn key_mask_bias(mask: &Tensor, inf: f64) -> Result<Tensor> {
    let rank = mask.rank();
    if rank == 0 {
        return Err(candle_core::Error::Msg(
            "key mask must have at least one axis".into(),
        ));
    }
    let bias = ((mask - 1.0)? * inf)?;
    bias.unsqueeze(rank - 1)
}
