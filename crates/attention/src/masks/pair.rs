//! Pairwise masking biases for self-attention over a single sequence.

use candle_core::{Result, Tensor};

/// Builds `mask_value * (1 - m_i * m_j)` from a position mask `[..., N]`.
///
/// The result is `[..., N, N, 1]`, ready to be added to a pair bias laid
/// out `[..., N, N, heads]`. Pairs where both positions are real get `0`.
pub fn pair_mask_bias(mask: &Tensor, mask_value: f64) -> Result<Tensor> {
    let rank = mask.rank();
    if rank == 0 {
        return Err(candle_core::Error::Msg(
            "pair mask must have at least one axis".into(),
        ));
    }
    let rows = mask.unsqueeze(rank)?;
    let cols = mask.unsqueeze(rank - 1)?;
    let both = rows.broadcast_mul(&cols)?;
    let inverted = (both.ones_like()? - both)?;
    (inverted * mask_value)?.unsqueeze(rank + 1)
}
