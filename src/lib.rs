//! Attention strategies and heads for structure-prediction trunks.
//!
//! Re-exports the `attention` and `layers` workspace crates and adds device
//! selection for binaries and integration tests.

pub use attention::{
    bias, chunked, fused, heads, lma, masks, reference, Attention, AttentionDispatcher,
    AttentionError, AttentionGrads, AttentionStrategy, BiasCombiner, ChunkReplay,
    ChunkedAttention, Config, ExactAttention, FusedAttention, GlobalAttention,
    GlobalAttentionConfig, LowMemoryAttention, MultiHeadConfig, MultiHeadGatedAttention,
    PairBiasAttention, PairBiasConfig, PartialSoftmax, Precision, RuntimeCapabilities,
    StrategyRequest,
};
pub use {attention, layers};

use anyhow::Result;
use candle_core::Device;

/// Picks the compute device: CUDA when available unless `CANDLE_FORCE_CPU`
/// is set, CPU otherwise.
pub fn setup_device() -> Result<Device> {
    if std::env::var("CANDLE_FORCE_CPU").is_ok() {
        log::info!("CANDLE_FORCE_CPU set, using CPU backend");
        return Ok(Device::Cpu);
    }

    match Device::cuda_if_available(0) {
        Ok(device) if device.is_cuda() => {
            log::info!("CUDA device selected: {:?}", device);
            Ok(device)
        }
        Ok(_) | Err(_) => {
            log::info!("Using CPU backend");
            Ok(Device::Cpu)
        }
    }
}
