//! Tensor helpers shared by the kernels.

use candle_core::{Result, Tensor, D};

/// `a [..., M, N] @ b [..., N, P]` for identical leading dims of any rank.
///
/// The leading axes are flattened into one batch axis so the matmul always
/// runs on rank-3 operands.
pub(crate) fn batched_matmul(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let a_dims = a.dims();
    let b_dims = b.dims();
    let rank = a_dims.len();
    let (m, n) = (a_dims[rank - 2], a_dims[rank - 1]);
    let p = b_dims[b_dims.len() - 1];
    let batch: usize = a_dims[..rank - 2].iter().product();

    let a3 = a.reshape((batch, m, n))?;
    let b3 = b.reshape((batch, n, p))?;
    let out = a3.matmul(&b3)?;

    let mut out_dims = a_dims[..rank - 2].to_vec();
    out_dims.push(m);
    out_dims.push(p);
    out.reshape(out_dims)
}

/// Raw logits `q @ k^T` over the trailing two axes.
pub(crate) fn query_key_logits(q: &Tensor, k: &Tensor) -> Result<Tensor> {
    let k_t = k.transpose(D::Minus2, D::Minus1)?.contiguous()?;
    batched_matmul(q, &k_t)
}

/// Softmax along the key axis with the row maximum subtracted first.
///
/// The maximum is detached: it cancels analytically and only guards
/// `exp` against overflow.
pub(crate) fn stable_softmax_last_dim(logits: &Tensor) -> Result<Tensor> {
    let max = logits.max_keepdim(D::Minus1)?.detach();
    let exp = logits.broadcast_sub(&max)?.exp()?;
    let denom = exp.sum_keepdim(D::Minus1)?;
    exp.broadcast_div(&denom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn batched_matmul_handles_two_batch_axes() -> Result<()> {
        let device = Device::Cpu;
        let a = Tensor::arange(0f32, 24.0, &device)?.reshape((2, 3, 2, 2))?;
        let eye = Tensor::new(&[[1f32, 0.0], [0.0, 1.0]], &device)?
            .broadcast_as((2, 3, 2, 2))?
            .contiguous()?;
        let out = batched_matmul(&a, &eye)?;
        assert_eq!(out.dims(), &[2, 3, 2, 2]);
        assert_eq!(
            out.flatten_all()?.to_vec1::<f32>()?,
            a.flatten_all()?.to_vec1::<f32>()?
        );
        Ok(())
    }

    #[test]
    fn softmax_survives_huge_logits() -> Result<()> {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[1e30f32, 1e30, -1e30]], &device)?;
        let probs = stable_softmax_last_dim(&logits)?.to_vec2::<f32>()?;
        assert!((probs[0][0] - 0.5).abs() < 1e-6);
        assert!((probs[0][1] - 0.5).abs() < 1e-6);
        assert!(probs[0][2].abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn softmax_rows_sum_to_one() -> Result<()> {
        let device = Device::Cpu;
        let logits = Tensor::arange(0f32, 12.0, &device)?.reshape((3, 4))?;
        let sums = stable_softmax_last_dim(&logits)?
            .sum(D::Minus1)?
            .to_dtype(DType::F32)?
            .to_vec1::<f32>()?;
        for sum in sums {
            assert!((sum - 1.0).abs() < 1e-6);
        }
        Ok(())
    }
}
