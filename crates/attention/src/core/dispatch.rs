//! Routes a resolved [`AttentionStrategy`] to its kernel.

use std::sync::OnceLock;

use candle_core::Tensor;

use crate::bias::BiasCombiner;
use crate::chunked::ChunkedAttention;
use crate::core::{
    validate_qkv, Attention, AttentionError, AttentionStrategy, Config, RuntimeCapabilities,
};
use crate::fused::MAX_FUSED_BIASES;
use crate::lma::LowMemoryAttention;
use crate::reference::ExactAttention;

/// Holds the validated configuration and the injected runtime capabilities.
#[derive(Debug)]
pub struct AttentionDispatcher {
    config: Config,
    capabilities: RuntimeCapabilities,
    first_call: OnceLock<()>,
}

impl AttentionDispatcher {
    pub fn new(config: Config, capabilities: RuntimeCapabilities) -> Result<Self, AttentionError> {
        config.validate()?;
        Ok(Self {
            config,
            capabilities,
            first_call: OnceLock::new(),
        })
    }

    /// Portable kernels with the default configuration.
    pub fn portable() -> Self {
        Self {
            config: Config::default(),
            capabilities: RuntimeCapabilities::none(),
            first_call: OnceLock::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn capabilities(&self) -> &RuntimeCapabilities {
        &self.capabilities
    }

    /// Rejects strategies the runtime cannot serve, before any tensor work.
    pub fn check(&self, strategy: AttentionStrategy, bias_count: usize) -> Result<(), AttentionError> {
        if let AttentionStrategy::Fused = strategy {
            if !self.capabilities.has_fused() {
                return Err(AttentionError::config(
                    "fused attention requested but no fused provider is available",
                ));
            }
            if bias_count > MAX_FUSED_BIASES {
                return Err(AttentionError::config(format!(
                    "fused attention accepts at most {MAX_FUSED_BIASES} bias terms, got {bias_count}"
                )));
            }
        }
        Ok(())
    }

    /// Runs one attention call with `strategy`.
    pub fn run(
        &self,
        strategy: AttentionStrategy,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        biases: &[Tensor],
    ) -> Result<Tensor, AttentionError> {
        self.check(strategy, biases.len())?;

        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::dispatch init strategy={} precision={:?} inf={} eps={} fused_provider={}",
                strategy,
                self.config.precision,
                self.config.inf,
                self.config.eps,
                self.capabilities
                    .fused()
                    .map(|provider| provider.name().to_string())
                    .unwrap_or_else(|| "none".to_string()),
            );
        }

        match strategy {
            AttentionStrategy::Direct => ExactAttention.attend(q, k, v, biases, &self.config),
            AttentionStrategy::ChunkedRecompute { chunk_size } => {
                ChunkedAttention::new(chunk_size)?.attend(q, k, v, biases, &self.config)
            }
            AttentionStrategy::LowMemory {
                q_chunk_size,
                kv_chunk_size,
            } => LowMemoryAttention::new(q_chunk_size, kv_chunk_size)?
                .attend(q, k, v, biases, &self.config),
            AttentionStrategy::Fused => {
                let provider = self.capabilities.fused().ok_or_else(|| {
                    AttentionError::config("fused provider disappeared between check and run")
                })?;
                let dims = validate_qkv(q, k, v)?;
                BiasCombiner::validate(&dims.logits_dims(), biases)?;
                provider.attend(q, k, v, biases)
            }
        }
    }
}
