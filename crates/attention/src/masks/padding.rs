//! Builders for position masks.
//!
//! All masks share the dtype described in [`super::MASK_DTYPE`] and are
//! shaped `[batch, len]`.

use candle_core::{Device, Error, Result, Tensor};

use super::MASK_DTYPE;

/// Construct position masks from per-batch valid lengths.
pub fn mask_from_lengths(device: &Device, lengths: &[usize], len: usize) -> Result<Tensor> {
    let mut data = vec![0f32; lengths.len() * len];
    for (b, &valid) in lengths.iter().enumerate() {
        let valid = valid.min(len);
        for value in &mut data[b * len..b * len + valid] {
            *value = 1.0;
        }
    }
    Tensor::from_vec(data, (lengths.len(), len), device)?.to_dtype(MASK_DTYPE)
}

/// Construct position masks from boolean indicators.
///
/// Each inner slice is one batch element; `true` marks a real position.
/// All slices must share a length.
pub fn mask_from_booleans(device: &Device, present: &[Vec<bool>]) -> Result<Tensor> {
    let len = present.first().map(Vec::len).unwrap_or(0);
    if let Some(row) = present.iter().position(|row| row.len() != len) {
        return Err(Error::Msg(format!(
            "boolean mask row {row} has length {}, expected {len}",
            present[row].len()
        )));
    }

    let data = present
        .iter()
        .flat_map(|row| row.iter().map(|&keep| if keep { 1f32 } else { 0f32 }))
        .collect::<Vec<_>>();
    Tensor::from_vec(data, (present.len(), len), device)?.to_dtype(MASK_DTYPE)
}
