//! Direct attention over the full `[Q, K]` score matrix.
//!
//! The exact path prioritises numerical fidelity and is the baseline every
//! chunked strategy is validated against.

use candle_core::{Result as CandleResult, Tensor};

use crate::bias::{self, BiasCombiner};
use crate::core::shapes::promote_qkv;
use crate::core::{validate_qkv, Attention, AttentionError, Config};
use crate::ops::{batched_matmul, query_key_logits, stable_softmax_last_dim};

/// Numerically stable, portable attention kernel.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactAttention;

impl Attention for ExactAttention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        biases: &[Tensor],
        config: &Config,
    ) -> Result<Tensor, AttentionError> {
        let dims = validate_qkv(q, k, v)?;
        BiasCombiner::validate(&dims.logits_dims(), biases)?;

        let (q_work, k_work, v_work) = promote_qkv(q, k, v, config.precision)?;
        let output = attention_forward(&q_work, &k_work, &v_work, biases)?;
        Ok(output.to_dtype(q.dtype())?)
    }
}

/// `softmax(q k^T + sum(biases)) v` without validation.
///
/// A pure function of its inputs, so chunked strategies can replay it.
pub fn attention_forward(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    biases: &[Tensor],
) -> CandleResult<Tensor> {
    let logits = query_key_logits(q, k)?;
    let logits = bias::apply(&logits, biases)?;
    let weights = stable_softmax_last_dim(&logits)?;
    batched_matmul(&weights, v)
}
