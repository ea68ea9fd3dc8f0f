//! Online softmax statistics for one key/value chunk.
//!
//! Each chunk is summarised relative to its own row maximum. Merging rescales
//! every summary to the global row maximum before summing, so the merged
//! result equals the softmax over the concatenated chunks.

use candle_core::{Error, Result, Tensor, D};

use crate::ops::batched_matmul;

/// Softmax statistics of one key/value chunk for a block of query rows.
#[derive(Debug, Clone)]
pub struct PartialSoftmax {
    /// Row maximum of the chunk logits, `[..., Q, 1]`. Detached.
    max: Tensor,
    /// `sum(exp(logits - max))` per row, `[..., Q, 1]`.
    weight: Tensor,
    /// `exp(logits - max) @ value`, `[..., Q, Cv]`.
    value: Tensor,
}

impl PartialSoftmax {
    /// Summarises biased `logits [..., Q, Kc]` against `value [..., Kc, Cv]`.
    pub fn from_logits(logits: &Tensor, value: &Tensor) -> Result<Self> {
        let max = logits.max_keepdim(D::Minus1)?.detach();
        let exp = logits.broadcast_sub(&max)?.exp()?;
        let weight = exp.sum_keepdim(D::Minus1)?;
        let value = batched_matmul(&exp, value)?;
        Ok(Self { max, weight, value })
    }

    pub fn max(&self) -> &Tensor {
        &self.max
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn value(&self) -> &Tensor {
        &self.value
    }

    /// Combines chunk summaries into normalised attention output `[..., Q, Cv]`.
    ///
    /// A chunk whose rows were entirely masked by a finite constant has a
    /// maximum far below the global one; its rescale factor underflows to zero
    /// and it drops out without any division by zero, provided some other
    /// chunk holds a finite-weight key for every row.
    pub fn merge(parts: &[PartialSoftmax]) -> Result<Tensor> {
        let (first, rest) = parts
            .split_first()
            .ok_or_else(|| Error::Msg("cannot merge an empty set of softmax chunks".into()))?;

        let global_max = rest
            .iter()
            .try_fold(first.max.clone(), |acc, part| acc.maximum(&part.max))?;

        let mut values: Option<Tensor> = None;
        let mut weights: Option<Tensor> = None;
        for part in parts {
            let scale = part.max.sub(&global_max)?.exp()?;
            let value = part.value.broadcast_mul(&scale)?;
            let weight = part.weight.mul(&scale)?;
            values = Some(match values {
                Some(acc) => acc.add(&value)?,
                None => value,
            });
            weights = Some(match weights {
                Some(acc) => acc.add(&weight)?,
                None => weight,
            });
        }

        match (values, weights) {
            (Some(values), Some(weights)) => values.broadcast_div(&weights),
            _ => Err(Error::Msg("softmax merge produced no accumulators".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    use crate::ops::stable_softmax_last_dim;

    fn max_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        a.sub(b)?.abs()?.max_all()?.to_dtype(DType::F32)?.to_vec0::<f32>()
    }

    fn reference(logits: &Tensor, value: &Tensor) -> Result<Tensor> {
        batched_matmul(&stable_softmax_last_dim(logits)?, value)
    }

    #[test]
    fn single_chunk_is_plain_softmax() -> Result<()> {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[[0.5f32, -1.0, 2.0], [3.0, 3.0, -2.0]]], &device)?;
        let value = Tensor::new(&[[[1f32, 0.0], [0.0, 1.0], [2.0, -1.0]]], &device)?;
        let merged = PartialSoftmax::merge(&[PartialSoftmax::from_logits(&logits, &value)?])?;
        assert!(max_diff(&merged, &reference(&logits, &value)?)? < 1e-6);
        Ok(())
    }

    #[test]
    fn merge_rescales_chunks_with_different_maxima() -> Result<()> {
        let device = Device::Cpu;
        // Chunk maxima differ by ~40 so an unscaled sum would be dominated by
        // whichever chunk happens to be added last.
        let logits = Tensor::new(&[[[40f32, 38.5, 0.1, -0.3, 1.2]]], &device)?;
        let value = Tensor::new(
            &[[[1f32, 2.0], [-1.0, 0.5], [3.0, 3.0], [0.0, -2.0], [1.0, 1.0]]],
            &device,
        )?;

        let parts = [(0, 2), (2, 2), (4, 1)]
            .iter()
            .map(|&(start, len)| {
                PartialSoftmax::from_logits(
                    &logits.narrow(2, start, len)?,
                    &value.narrow(1, start, len)?,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let merged = PartialSoftmax::merge(&parts)?;
        assert!(max_diff(&merged, &reference(&logits, &value)?)? < 1e-5);

        let mut reversed = parts.clone();
        reversed.reverse();
        assert!(max_diff(&PartialSoftmax::merge(&reversed)?, &merged)? < 1e-6);
        Ok(())
    }

    #[test]
    fn fully_masked_chunk_drops_out() -> Result<()> {
        let device = Device::Cpu;
        let open = Tensor::new(&[[[0.2f32, -0.4]]], &device)?;
        let masked = Tensor::new(&[[[-1e9f32, -1e9]]], &device)?;
        let open_value = Tensor::new(&[[[1f32], [3.0]]], &device)?;
        let masked_value = Tensor::new(&[[[100f32], [-100.0]]], &device)?;

        let merged = PartialSoftmax::merge(&[
            PartialSoftmax::from_logits(&masked, &masked_value)?,
            PartialSoftmax::from_logits(&open, &open_value)?,
        ])?;
        let expected = reference(&open, &open_value)?;
        let values = merged.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|v| v.is_finite()));
        assert!(max_diff(&merged, &expected)? < 1e-6);
        Ok(())
    }

    #[test]
    fn empty_merge_is_an_error() {
        assert!(PartialSoftmax::merge(&[]).is_err());
    }
}
