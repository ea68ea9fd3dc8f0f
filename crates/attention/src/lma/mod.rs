//! Low-memory attention.
//!
//! Two nested chunk loops walk the query and key/value axes; no logits
//! tensor larger than `[..., q_chunk, kv_chunk]` is ever alive. Per query
//! chunk, each key/value chunk is reduced to a [`PartialSoftmax`] and the
//! summaries are merged with the online-softmax correction. Chunk sizes only
//! change memory and time, never the result.

pub mod partial;

use candle_core::{Result as CandleResult, Tensor};

pub use partial::PartialSoftmax;

use crate::bias::{self, BiasCombiner};
use crate::core::shapes::promote_qkv;
use crate::core::{
    validate_qkv, Attention, AttentionError, Config, DEFAULT_LMA_KV_CHUNK_SIZE,
    DEFAULT_LMA_Q_CHUNK_SIZE,
};
use crate::ops::query_key_logits;

/// Nested-chunk attention with an online softmax.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LowMemoryAttention {
    q_chunk_size: usize,
    kv_chunk_size: usize,
}

impl LowMemoryAttention {
    pub fn new(q_chunk_size: usize, kv_chunk_size: usize) -> Result<Self, AttentionError> {
        if q_chunk_size == 0 || kv_chunk_size == 0 {
            return Err(AttentionError::config(format!(
                "low-memory chunk sizes must be greater than zero (q={q_chunk_size}, kv={kv_chunk_size})"
            )));
        }
        Ok(Self {
            q_chunk_size,
            kv_chunk_size,
        })
    }

    pub fn q_chunk_size(&self) -> usize {
        self.q_chunk_size
    }

    pub fn kv_chunk_size(&self) -> usize {
        self.kv_chunk_size
    }

    /// Output rows for one query chunk, merged over every key/value chunk.
    fn attend_query_chunk(
        &self,
        q_chunk: &Tensor,
        k: &Tensor,
        v: &Tensor,
        biases: &[Tensor],
        k_len: usize,
        axis: usize,
    ) -> CandleResult<Tensor> {
        let mut parts = Vec::with_capacity(k_len.div_ceil(self.kv_chunk_size));
        for kv_start in (0..k_len).step_by(self.kv_chunk_size) {
            let len = self.kv_chunk_size.min(k_len - kv_start);
            let k_chunk = k.narrow(axis, kv_start, len)?;
            let v_chunk = v.narrow(axis, kv_start, len)?;
            let small = biases
                .iter()
                .map(|b| bias::slice_key(b, kv_start, len))
                .collect::<CandleResult<Vec<_>>>()?;

            let logits = query_key_logits(q_chunk, &k_chunk)?;
            let logits = bias::apply(&logits, &small)?;
            parts.push(PartialSoftmax::from_logits(&logits, &v_chunk)?);
        }
        PartialSoftmax::merge(&parts)
    }
}

impl Default for LowMemoryAttention {
    fn default() -> Self {
        Self {
            q_chunk_size: DEFAULT_LMA_Q_CHUNK_SIZE,
            kv_chunk_size: DEFAULT_LMA_KV_CHUNK_SIZE,
        }
    }
}

impl Attention for LowMemoryAttention {
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
        let axis = dims.query_axis();
        log::debug!(
            "attention::lma q_len={} k_len={} q_chunks={} kv_chunks={}",
            dims.q_len,
            dims.k_len,
            dims.q_len.div_ceil(self.q_chunk_size),
            dims.k_len.div_ceil(self.kv_chunk_size)
        );

        let mut outputs = Vec::with_capacity(dims.q_len.div_ceil(self.q_chunk_size));
        for q_start in (0..dims.q_len).step_by(self.q_chunk_size) {
            let len = self.q_chunk_size.min(dims.q_len - q_start);
            let q_chunk = q_work.narrow(axis, q_start, len)?;
            let large = biases
                .iter()
                .map(|b| bias::slice_query(b, q_start, len))
                .collect::<CandleResult<Vec<_>>>()?;
            outputs.push(self.attend_query_chunk(
                &q_chunk,
                &k_work,
                &v_work,
                &large,
                dims.k_len,
                axis,
            )?);
        }

        Ok(Tensor::cat(&outputs, axis)?.to_dtype(q.dtype())?)
    }
}
