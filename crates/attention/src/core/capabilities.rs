//! Runtime capabilities injected into the dispatcher.

use std::sync::Arc;

use crate::fused::FusedAttention;

/// What the current runtime can offer beyond the portable kernels.
#[derive(Debug, Clone, Default)]
pub struct RuntimeCapabilities {
    fused: Option<Arc<dyn FusedAttention>>,
}

impl RuntimeCapabilities {
    /// Portable kernels only.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_fused(provider: Arc<dyn FusedAttention>) -> Self {
        Self {
            fused: Some(provider),
        }
    }

    pub fn fused(&self) -> Option<&Arc<dyn FusedAttention>> {
        self.fused.as_ref()
    }

    pub fn has_fused(&self) -> bool {
        self.fused.is_some()
    }
}
