//! Query-chunked attention with recompute-based gradients.
//!
//! The query axis is split into chunks and each chunk runs the direct
//! kernel against the full key/value axis. In checkpoint mode a chunk that
//! takes part in autograd becomes a single graph node holding only its
//! inputs; the reverse pass replays the chunk from a [`ChunkReplay`] and
//! differentiates the replay, so no score matrix outlives the forward pass.
//! [`ChunkedAttention::backward`] runs the same replay for callers that
//! drive gradients by hand.

use std::sync::OnceLock;

use candle_core::{
    CpuStorage, CustomOp3, DType, Device, Layout, Result as CandleResult, Shape, Tensor, Var,
};

use crate::bias::{self, BiasCombiner};
use crate::core::shapes::promote_qkv;
use crate::core::{validate_qkv, Attention, AttentionError, Config};
use crate::reference::attention_forward;

/// Most bias terms a checkpointed replay carries.
pub const MAX_CHECKPOINT_BIASES: usize = 2;

/// Gradients of a scalar objective with respect to the attention inputs.
#[derive(Debug, Clone)]
pub struct AttentionGrads {
    pub query: Tensor,
    pub key: Tensor,
    pub value: Tensor,
    /// One entry per bias, shaped like that bias.
    pub biases: Vec<Tensor>,
}

/// Everything needed to recompute one query chunk.
///
/// All tensors are detached; `forward` is a pure function of them.
#[derive(Debug, Clone)]
pub struct ChunkReplay {
    start: usize,
    len: usize,
    query: Tensor,
    key: Tensor,
    value: Tensor,
    biases: [Option<Tensor>; MAX_CHECKPOINT_BIASES],
}

impl ChunkReplay {
    /// First query row covered by this chunk.
    pub fn start(&self) -> usize {
        self.start
    }

    /// Query rows covered by this chunk.
    pub fn rows(&self) -> usize {
        self.len
    }

    fn bias_list(&self) -> Vec<Tensor> {
        self.biases.iter().flatten().cloned().collect()
    }

    /// Recomputes the chunk output `[..., len, Cv]`.
    pub fn forward(&self) -> CandleResult<Tensor> {
        attention_forward(&self.query, &self.key, &self.value, &self.bias_list())
    }

    /// Replays the forward pass with fresh variables and back-propagates
    /// `grad_output` (the upstream gradient of this chunk's output).
    pub fn gradients(&self, grad_output: &Tensor) -> CandleResult<AttentionGrads> {
        let query = Var::from_tensor(&self.query)?;
        let key = Var::from_tensor(&self.key)?;
        let value = Var::from_tensor(&self.value)?;
        let biases = self
            .bias_list()
            .iter()
            .map(Var::from_tensor)
            .collect::<CandleResult<Vec<_>>>()?;
        let bias_tensors: Vec<Tensor> = biases.iter().map(|b| b.as_tensor().clone()).collect();

        let output = attention_forward(
            query.as_tensor(),
            key.as_tensor(),
            value.as_tensor(),
            &bias_tensors,
        )?;
        let grad_output = grad_output.detach().to_dtype(output.dtype())?;
        let objective = output.mul(&grad_output)?.sum_all()?;
        let store = objective.backward()?;

        let grad_of = |var: &Var| -> CandleResult<Tensor> {
            match store.get(var.as_tensor()) {
                Some(grad) => Ok(grad.clone()),
                None => var.as_tensor().zeros_like(),
            }
        };
        Ok(AttentionGrads {
            query: grad_of(&query)?,
            key: grad_of(&key)?,
            value: grad_of(&value)?,
            biases: biases.iter().map(grad_of).collect::<CandleResult<Vec<_>>>()?,
        })
    }
}

/// Query-chunked attention.
#[derive(Debug, Clone, Copy)]
pub struct ChunkedAttention {
    chunk_size: usize,
    checkpoint: bool,
}

impl ChunkedAttention {
    /// Checkpointed chunked attention with `chunk_size` queries per chunk.
    pub fn new(chunk_size: usize) -> Result<Self, AttentionError> {
        if chunk_size == 0 {
            return Err(AttentionError::config(
                "chunked attention chunk_size must be greater than zero",
            ));
        }
        Ok(Self {
            chunk_size,
            checkpoint: true,
        })
    }

    /// With checkpointing off, chunks keep their autograd graph and any
    /// number of biases is accepted.
    pub fn with_checkpoint(mut self, checkpoint: bool) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn is_checkpointing(&self) -> bool {
        self.checkpoint
    }

    fn check_bias_count(&self, count: usize) -> Result<(), AttentionError> {
        if count > MAX_CHECKPOINT_BIASES {
            return Err(AttentionError::config(format!(
                "checkpointed chunked attention permits at most {MAX_CHECKPOINT_BIASES} bias terms, got {count}"
            )));
        }
        Ok(())
    }

    /// Builds the detached replay for every query chunk.
    pub fn replays(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        biases: &[Tensor],
        config: &Config,
    ) -> Result<Vec<ChunkReplay>, AttentionError> {
        let dims = validate_qkv(q, k, v)?;
        BiasCombiner::validate(&dims.logits_dims(), biases)?;
        self.check_bias_count(biases.len())?;
        let (q, k, v) = promote_qkv(q, k, v, config.precision)?;
        Ok(self.build_replays(&q, &k, &v, biases, dims.q_len, dims.query_axis())?)
    }

    fn build_replays(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        biases: &[Tensor],
        q_len: usize,
        axis: usize,
    ) -> CandleResult<Vec<ChunkReplay>> {
        let key = k.detach();
        let value = v.detach();
        chunk_bounds(q_len, self.chunk_size)
            .map(|(start, len)| -> CandleResult<ChunkReplay> {
                let mut slots: [Option<Tensor>; MAX_CHECKPOINT_BIASES] = [None, None];
                for (slot, bias) in slots.iter_mut().zip(biases) {
                    *slot = Some(bias::slice_query(bias, start, len)?.detach());
                }
                Ok(ChunkReplay {
                    start,
                    len,
                    query: q.narrow(axis, start, len)?.detach(),
                    key: key.clone(),
                    value: value.clone(),
                    biases: slots,
                })
            })
            .collect()
    }

    /// Chunks that keep their full autograd graph.
    fn retained_chunks(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        biases: &[Tensor],
        q_len: usize,
        axis: usize,
    ) -> CandleResult<Vec<Tensor>> {
        chunk_bounds(q_len, self.chunk_size)
            .map(|(start, len)| {
                let sliced = biases
                    .iter()
                    .map(|b| bias::slice_query(b, start, len))
                    .collect::<CandleResult<Vec<_>>>()?;
                attention_forward(&q.narrow(axis, start, len)?, k, v, &sliced)
            })
            .collect()
    }

    /// Chunks recorded as [`CheckpointedChunk`] nodes. Keys and values are
    /// packed along the channel axis and the biases pre-summed, so each
    /// node has exactly three inputs.
    fn checkpointed_chunks(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        biases: &[Tensor],
        q_len: usize,
        axis: usize,
    ) -> CandleResult<Vec<Tensor>> {
        let channels = k.dim(k.rank() - 1)?;
        let kv = Tensor::cat(&[k, v], k.rank() - 1)?;
        let total = match bias::sum(biases)? {
            Some(total) => total,
            None => Tensor::zeros(1, DType::F32, q.device())?,
        };
        chunk_bounds(q_len, self.chunk_size)
            .map(|(start, len)| {
                let query = q.narrow(axis, start, len)?.contiguous()?;
                let chunk_bias = bias::slice_query(&total, start, len)?.contiguous()?;
                query.apply_op3(&kv, &chunk_bias, CheckpointedChunk { channels })
            })
            .collect()
    }

    /// Gradients of `sum(output * grad_output)` with respect to every input,
    /// computed by replaying each chunk's forward pass.
    pub fn backward(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        biases: &[Tensor],
        grad_output: &Tensor,
        config: &Config,
    ) -> Result<AttentionGrads, AttentionError> {
        let dims = validate_qkv(q, k, v)?;
        if grad_output.dims() != dims.output_dims().as_slice() {
            return Err(AttentionError::shape(format!(
                "grad_output has shape {:?}, expected {:?}",
                grad_output.dims(),
                dims.output_dims()
            )));
        }
        let replays = self.replays(q, k, v, biases, config)?;
        let axis = dims.query_axis();

        let mut query_parts = Vec::with_capacity(replays.len());
        let mut key_parts = Vec::with_capacity(replays.len());
        let mut value_parts = Vec::with_capacity(replays.len());
        let mut bias_parts: Vec<Vec<Tensor>> = vec![Vec::new(); biases.len()];
        for replay in &replays {
            let grad_chunk = grad_output.narrow(axis, replay.start, replay.len)?;
            let grads = replay.gradients(&grad_chunk)?;
            query_parts.push(grads.query);
            key_parts.push(grads.key);
            value_parts.push(grads.value);
            for (parts, grad) in bias_parts.iter_mut().zip(grads.biases) {
                parts.push(grad);
            }
        }
        log::debug!(
            "attention::chunked backward replayed {} chunks of {} queries",
            replays.len(),
            self.chunk_size
        );

        let bias_grads = biases
            .iter()
            .zip(bias_parts)
            .map(|(bias, parts)| {
                let grad = if bias::has_query_axis(bias) {
                    Tensor::cat(&parts, bias.rank() - 2)?
                } else {
                    sum_parts(&parts)?
                };
                grad.to_dtype(bias.dtype())
            })
            .collect::<CandleResult<Vec<_>>>()?;

        Ok(AttentionGrads {
            query: Tensor::cat(&query_parts, axis)?.to_dtype(q.dtype())?,
            key: sum_parts(&key_parts)?.to_dtype(k.dtype())?,
            value: sum_parts(&value_parts)?.to_dtype(v.dtype())?,
            biases: bias_grads,
        })
    }
}

impl Attention for ChunkedAttention {
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
        if self.checkpoint {
            self.check_bias_count(biases.len())?;
        }

        let (q_work, k_work, v_work) = promote_qkv(q, k, v, config.precision)?;
        let axis = dims.query_axis();
        let tracked = [q, k, v].into_iter().chain(biases).any(Tensor::track_op);
        let chunks = match (self.checkpoint, tracked) {
            (true, false) => self
                .build_replays(&q_work, &k_work, &v_work, biases, dims.q_len, axis)?
                .iter()
                .map(ChunkReplay::forward)
                .collect::<CandleResult<Vec<_>>>()?,
            (true, true) if q.device().is_cpu() => {
                self.checkpointed_chunks(&q_work, &k_work, &v_work, biases, dims.q_len, axis)?
            }
            (true, true) => {
                static RETAINED_FALLBACK: OnceLock<()> = OnceLock::new();
                if RETAINED_FALLBACK.set(()).is_ok() {
                    log::warn!(
                        "attention::chunked checkpoint replay runs on the CPU only; \
                         {:?} chunks keep their autograd graph",
                        q.device().location()
                    );
                }
                self.retained_chunks(&q_work, &k_work, &v_work, biases, dims.q_len, axis)?
            }
            (false, _) => {
                self.retained_chunks(&q_work, &k_work, &v_work, biases, dims.q_len, axis)?
            }
        };
        log::debug!(
            "attention::chunked q_len={} chunk_size={} chunks={} checkpoint={}",
            dims.q_len,
            self.chunk_size,
            chunks.len(),
            self.checkpoint
        );

        Ok(Tensor::cat(&chunks, axis)?.to_dtype(q.dtype())?)
    }
}

/// One checkpointed query chunk as an autograd node.
///
/// Inputs are the query chunk, keys and values packed as `[..., K, C + Cv]`,
/// and the summed bias for the chunk. Only these inputs are kept by the
/// graph; [`CustomOp3::bwd`] rebuilds a [`ChunkReplay`] from them.
struct CheckpointedChunk {
    channels: usize,
}

impl CheckpointedChunk {
    fn replay(&self, query: &Tensor, kv: &Tensor, bias: &Tensor) -> CandleResult<ChunkReplay> {
        let kv = kv.detach();
        let last = kv.rank() - 1;
        let width = kv.dim(last)?;
        Ok(ChunkReplay {
            start: 0,
            len: query.dim(query.rank() - 2)?,
            query: query.detach(),
            key: kv.narrow(last, 0, self.channels)?.contiguous()?,
            value: kv.narrow(last, self.channels, width - self.channels)?.contiguous()?,
            biases: [Some(bias.detach()), None],
        })
    }
}

impl CustomOp3 for CheckpointedChunk {
    fn name(&self) -> &'static str {
        "checkpointed-attention-chunk"
    }

    fn cpu_fwd(
        &self,
        s1: &CpuStorage,
        l1: &Layout,
        s2: &CpuStorage,
        l2: &Layout,
        s3: &CpuStorage,
        l3: &Layout,
    ) -> CandleResult<(CpuStorage, Shape)> {
        let replay = self.replay(
            &cpu_tensor(s1, l1)?,
            &cpu_tensor(s2, l2)?,
            &cpu_tensor(s3, l3)?,
        )?;
        cpu_storage(&replay.forward()?)
    }

    fn bwd(
        &self,
        query: &Tensor,
        kv: &Tensor,
        bias: &Tensor,
        _output: &Tensor,
        grad_output: &Tensor,
    ) -> CandleResult<(Option<Tensor>, Option<Tensor>, Option<Tensor>)> {
        let grads = self.replay(query, kv, bias)?.gradients(grad_output)?;
        let grad_kv = Tensor::cat(&[grads.key, grads.value], kv.rank() - 1)?;
        let grad_bias = if bias.track_op() {
            grads.biases.into_iter().next()
        } else {
            None
        };
        Ok((Some(grads.query), Some(grad_kv), grad_bias))
    }
}

/// Copies the visible region of a contiguous CPU buffer into a tensor.
fn cpu_tensor(storage: &CpuStorage, layout: &Layout) -> CandleResult<Tensor> {
    let (start, end) = layout.contiguous_offsets().ok_or_else(|| {
        candle_core::Error::Msg("checkpointed chunk inputs must be contiguous".into())
    })?;
    let shape = layout.shape().clone();
    let cpu = Device::Cpu;
    match storage {
        CpuStorage::F16(data) => Tensor::from_slice(&data[start..end], shape, &cpu),
        CpuStorage::BF16(data) => Tensor::from_slice(&data[start..end], shape, &cpu),
        CpuStorage::F32(data) => Tensor::from_slice(&data[start..end], shape, &cpu),
        CpuStorage::F64(data) => Tensor::from_slice(&data[start..end], shape, &cpu),
        _ => Err(candle_core::Error::Msg(
            "checkpointed chunk inputs must be floating point".into(),
        )),
    }
}

fn cpu_storage(tensor: &Tensor) -> CandleResult<(CpuStorage, Shape)> {
    let flat = tensor.flatten_all()?;
    let storage = match tensor.dtype() {
        DType::F16 => CpuStorage::F16(flat.to_vec1()?),
        DType::BF16 => CpuStorage::BF16(flat.to_vec1()?),
        DType::F32 => CpuStorage::F32(flat.to_vec1()?),
        DType::F64 => CpuStorage::F64(flat.to_vec1()?),
        other => {
            return Err(candle_core::Error::Msg(format!(
                "checkpointed chunk produced unsupported dtype {other:?}"
            )))
        }
    };
    Ok((storage, tensor.shape().clone()))
}

/// `(start, len)` of each chunk covering `0..total`.
fn chunk_bounds(total: usize, chunk_size: usize) -> impl Iterator<Item = (usize, usize)> {
    (0..total)
        .step_by(chunk_size)
        .map(move |start| (start, chunk_size.min(total - start)))
}

fn sum_parts(parts: &[Tensor]) -> CandleResult<Tensor> {
    let (first, rest) = parts
        .split_first()
        .ok_or_else(|| candle_core::Error::Msg("no chunk gradients to accumulate".into()))?;
    rest.iter().try_fold(first.clone(), |acc, part| acc.add(part))
}
