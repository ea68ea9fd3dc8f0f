//! Configuration options shared by all attention implementations.
//!
//! The [`Config`] struct captures run-time knobs that callers can tune
//! without swapping implementations: the working precision, the finite
//! masking constant, the pooling epsilon and the requested strategy.
//! It loads from TOML or JSON and can be overridden from the environment.

use std::{env, fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::core::{AttentionError, AttentionStrategy, StrategyRequest};

/// Working precision for the score matrix and softmax.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    /// Promote half-precision inputs to `f32` and cast the output back.
    #[default]
    ForceF32,
    /// Compute in whatever dtype the inputs carry. bf16 on the CPU is the
    /// exception and still runs in `f32`.
    Inherit,
}

/// Configuration driving attention behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub precision: Precision,
    /// Large finite constant used to push masked logits towards zero weight.
    ///
    /// Must stay finite: fully masked chunks in the low-memory strategy rely
    /// on `exp(chunk_max - global_max)` producing zero rather than NaN.
    pub inf: f64,
    /// Stabiliser for mask-weighted mean pooling.
    pub eps: f64,
    pub strategy: StrategyRequest,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            precision: Precision::ForceF32,
            inf: 1e9,
            eps: 1e-10,
            strategy: StrategyRequest::default(),
        }
    }
}

impl Config {
    /// Loads a configuration file, picking the format from its extension.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, AttentionError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config: Config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(AttentionError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AttentionError> {
        let mut errors = Vec::new();

        if !self.inf.is_finite() || self.inf <= 0.0 {
            errors.push(format!(
                "inf must be a positive finite value, got {}",
                self.inf
            ));
        }
        if !self.eps.is_finite() || self.eps <= 0.0 {
            errors.push(format!(
                "eps must be a positive finite value, got {}",
                self.eps
            ));
        }
        if let Err(err) = self.strategy.resolve() {
            errors.push(err.to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(AttentionError::config(errors.join("; ")))
        }
    }

    /// Resolves the configured strategy request.
    pub fn resolved_strategy(&self) -> Result<AttentionStrategy, AttentionError> {
        self.strategy.resolve()
    }

    /// Applies `ATTN_*` environment overrides and re-validates.
    pub fn apply_env_overrides(&mut self) -> Result<(), AttentionError> {
        self.apply_overrides_from(|key| env::var(key).ok())
    }

    /// Applies overrides read through `lookup`.
    ///
    /// Recognised keys: `ATTN_STRATEGY` (`direct`, `chunked`, `lma`, `fused`),
    /// `ATTN_CHUNK_SIZE`, `ATTN_LMA_Q_CHUNK`, `ATTN_LMA_KV_CHUNK` and
    /// `ATTN_FORCE_F32` (`1`/`true` or `0`/`false`).
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<(), AttentionError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("ATTN_STRATEGY") {
            let request = &mut self.strategy;
            request.use_fused = false;
            request.use_lma = false;
            request.use_chunked = false;
            match value.trim().to_ascii_lowercase().as_str() {
                "direct" => {}
                "chunked" => request.use_chunked = true,
                "lma" | "low_memory" => request.use_lma = true,
                "fused" => request.use_fused = true,
                other => {
                    return Err(AttentionError::config(format!(
                        "ATTN_STRATEGY must be one of direct, chunked, lma, fused; got '{other}'"
                    )))
                }
            }
        }
        if let Some(value) = lookup("ATTN_CHUNK_SIZE") {
            self.strategy.chunk_size = Some(parse_size("ATTN_CHUNK_SIZE", &value)?);
        }
        if let Some(value) = lookup("ATTN_LMA_Q_CHUNK") {
            self.strategy.q_chunk_size = Some(parse_size("ATTN_LMA_Q_CHUNK", &value)?);
        }
        if let Some(value) = lookup("ATTN_LMA_KV_CHUNK") {
            self.strategy.kv_chunk_size = Some(parse_size("ATTN_LMA_KV_CHUNK", &value)?);
        }
        if let Some(value) = lookup("ATTN_FORCE_F32") {
            self.precision = match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => Precision::ForceF32,
                "0" | "false" | "no" => Precision::Inherit,
                other => {
                    return Err(AttentionError::config(format!(
                        "ATTN_FORCE_F32 expects a boolean, got '{other}'"
                    )))
                }
            };
        }
        self.validate()
    }
}

fn parse_size(key: &str, value: &str) -> Result<usize, AttentionError> {
    value
        .trim()
        .parse::<usize>()
        .map_err(|err| AttentionError::config(format!("{key}='{value}' is not a size: {err}")))
}
