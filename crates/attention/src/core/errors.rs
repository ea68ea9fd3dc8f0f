//! Error types emitted by attention implementations.

use thiserror::Error;

/// Attention-specific error category.
///
/// Every variant except [`AttentionError::Backend`] is raised during
/// validation, before any numeric work has started.
#[derive(Debug, Error)]
pub enum AttentionError {
    /// Conflicting or incomplete strategy selection, unsupported bias counts,
    /// or a requested capability that is not available.
    #[error("invalid attention configuration: {context}")]
    InvalidConfig { context: String },
    /// The supplied tensor shapes do not align with the documented contract.
    #[error("invalid tensor shape: {context}")]
    InvalidShape { context: String },
    /// The kernel does not support the requested data type.
    #[error("unsupported dtype {requested}")]
    UnsupportedDType { requested: String },
    /// A tensor-backend failure propagated to the caller.
    #[error(transparent)]
    Backend(#[from] candle_core::Error),
    /// A configuration file could not be read.
    #[error("failed to read attention config: {0}")]
    Io(#[from] std::io::Error),
    /// A configuration file could not be parsed.
    #[error("malformed attention config: {0}")]
    ConfigFormat(String),
}

impl AttentionError {
    pub(crate) fn config(context: impl Into<String>) -> Self {
        Self::InvalidConfig {
            context: context.into(),
        }
    }

    pub(crate) fn shape(context: impl Into<String>) -> Self {
        Self::InvalidShape {
            context: context.into(),
        }
    }
}

impl From<toml::de::Error> for AttentionError {
    fn from(err: toml::de::Error) -> Self {
        Self::ConfigFormat(err.to_string())
    }
}

impl From<serde_json::Error> for AttentionError {
    fn from(err: serde_json::Error) -> Self {
        Self::ConfigFormat(err.to_string())
    }
}
