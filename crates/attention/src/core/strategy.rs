//! Strategy selection.
//!
//! Callers describe what they want with a flag-style [`StrategyRequest`],
//! which mirrors how strategies are toggled from configuration files. The
//! request resolves into exactly one [`AttentionStrategy`]; conflicting or
//! incomplete requests fail before any tensors are touched.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::AttentionError;

/// Default query chunk for low-memory attention.
pub const DEFAULT_LMA_Q_CHUNK_SIZE: usize = 1024;
/// Default key/value chunk for low-memory attention.
pub const DEFAULT_LMA_KV_CHUNK_SIZE: usize = 4096;

/// A resolved, mutually exclusive attention strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttentionStrategy {
    /// Single pass over the full `[Q, K]` score matrix.
    Direct,
    /// Query chunks whose forward pass is replayed for gradients instead of
    /// retained.
    ChunkedRecompute { chunk_size: usize },
    /// Nested query/key-value chunks merged with an online softmax.
    LowMemory {
        q_chunk_size: usize,
        kv_chunk_size: usize,
    },
    /// External fused kernel supplied through
    /// [`RuntimeCapabilities`](crate::core::RuntimeCapabilities).
    Fused,
}

impl AttentionStrategy {
    /// Low-memory attention with the default chunk sizes.
    pub fn low_memory_default() -> Self {
        Self::LowMemory {
            q_chunk_size: DEFAULT_LMA_Q_CHUNK_SIZE,
            kv_chunk_size: DEFAULT_LMA_KV_CHUNK_SIZE,
        }
    }

    /// Whether the kernel applies the `1/sqrt(c_hidden)` query scaling itself.
    pub fn scales_internally(&self) -> bool {
        matches!(self, Self::Fused)
    }

    /// Short identifier used in logs and configuration.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::ChunkedRecompute { .. } => "chunked",
            Self::LowMemory { .. } => "lma",
            Self::Fused => "fused",
        }
    }
}

impl Default for AttentionStrategy {
    fn default() -> Self {
        Self::Direct
    }
}

impl fmt::Display for AttentionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct | Self::Fused => f.write_str(self.name()),
            Self::ChunkedRecompute { chunk_size } => write!(f, "chunked(chunk={chunk_size})"),
            Self::LowMemory {
                q_chunk_size,
                kv_chunk_size,
            } => write!(f, "lma(q={q_chunk_size}, kv={kv_chunk_size})"),
        }
    }
}

/// Flag-style strategy request.
///
/// At most one of `use_fused`, `use_lma` and `use_chunked` may be set. With
/// none set the direct strategy is used. Low-memory chunk sizes must be given
/// together or not at all; chunked recompute requires `chunk_size`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyRequest {
    pub use_fused: bool,
    pub use_lma: bool,
    pub use_chunked: bool,
    pub chunk_size: Option<usize>,
    pub q_chunk_size: Option<usize>,
    pub kv_chunk_size: Option<usize>,
}

impl StrategyRequest {
    pub fn direct() -> Self {
        Self::default()
    }

    pub fn fused() -> Self {
        Self {
            use_fused: true,
            ..Self::default()
        }
    }

    pub fn chunked(chunk_size: usize) -> Self {
        Self {
            use_chunked: true,
            chunk_size: Some(chunk_size),
            ..Self::default()
        }
    }

    pub fn low_memory(q_chunk_size: usize, kv_chunk_size: usize) -> Self {
        Self {
            use_lma: true,
            q_chunk_size: Some(q_chunk_size),
            kv_chunk_size: Some(kv_chunk_size),
            ..Self::default()
        }
    }

    /// Low-memory attention falling back to the default chunk sizes.
    pub fn low_memory_default() -> Self {
        Self {
            use_lma: true,
            ..Self::default()
        }
    }

    /// Resolves the flags into a single strategy.
    pub fn resolve(&self) -> Result<AttentionStrategy, AttentionError> {
        let selected = [self.use_fused, self.use_lma, self.use_chunked]
            .iter()
            .filter(|flag| **flag)
            .count();
        if selected > 1 {
            return Err(AttentionError::config(format!(
                "choose at most one alternative attention algorithm (fused={}, lma={}, chunked={})",
                self.use_fused, self.use_lma, self.use_chunked
            )));
        }

        if self.use_fused {
            return Ok(AttentionStrategy::Fused);
        }

        if self.use_lma {
            let (q_chunk_size, kv_chunk_size) = match (self.q_chunk_size, self.kv_chunk_size) {
                (Some(q), Some(kv)) => (q, kv),
                (None, None) => (DEFAULT_LMA_Q_CHUNK_SIZE, DEFAULT_LMA_KV_CHUNK_SIZE),
                (q, kv) => {
                    return Err(AttentionError::config(format!(
                        "low-memory attention needs both chunk sizes or neither, got q={q:?} kv={kv:?}"
                    )))
                }
            };
            if q_chunk_size == 0 || kv_chunk_size == 0 {
                return Err(AttentionError::config(
                    "low-memory chunk sizes must be greater than zero",
                ));
            }
            return Ok(AttentionStrategy::LowMemory {
                q_chunk_size,
                kv_chunk_size,
            });
        }

        if self.use_chunked {
            return match self.chunk_size {
                Some(0) => Err(AttentionError::config(
                    "chunked attention chunk_size must be greater than zero",
                )),
                Some(chunk_size) => Ok(AttentionStrategy::ChunkedRecompute { chunk_size }),
                None => Err(AttentionError::config(
                    "chunked attention requires chunk_size",
                )),
            };
        }

        Ok(AttentionStrategy::Direct)
    }
}

impl From<AttentionStrategy> for StrategyRequest {
    fn from(strategy: AttentionStrategy) -> Self {
        match strategy {
            AttentionStrategy::Direct => Self::direct(),
            AttentionStrategy::Fused => Self::fused(),
            AttentionStrategy::ChunkedRecompute { chunk_size } => Self::chunked(chunk_size),
            AttentionStrategy::LowMemory {
                q_chunk_size,
                kv_chunk_size,
            } => Self::low_memory(q_chunk_size, kv_chunk_size),
        }
    }
}
