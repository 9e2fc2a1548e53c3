//! Configuration loading from environment variables or TOML.
//!
//! Environment values are read from `SPECSYNC_*` variables with sensible
//! defaults. Invalid values fall back to defaults without crashing.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `SPECSYNC_VALIDATION_MODE` | false | Reconciliation never re-pauses requests |
//! | `SPECSYNC_MAX_MICRO_STEPS` | unset | Micro-step cap per multistep (0 = unlimited) |
//! | `SPECSYNC_BLOCK_SIZE` | 16 | Tokens per KV-cache block |
//! | `SPECSYNC_NUM_BLOCKS` | 1024 | Blocks in the reference block pool |
//! | `SPECSYNC_LOG_LEVEL` | info | `EnvFilter` directive |
//! | `SPECSYNC_LOG_FORMAT` | json | `json` or `pretty` |

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::engine::{PipelineConfig, SyncError};
use crate::memory::{BlockConfig, DEFAULT_BLOCK_SIZE};
use crate::telemetry::{LogConfig, LogFormat};

/// Effective configuration summary (serializable).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EffectiveConfig {
    pub validation_mode: bool,
    pub max_micro_steps: Option<usize>,
    pub block_size: usize,
    pub num_blocks: usize,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl EffectiveConfig {
    pub fn to_json(&self) -> Result<String, SyncError> {
        serde_json::to_string_pretty(self).map_err(|e| SyncError::Config(e.to_string()))
    }
}

/// All configuration for one synchronization core.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub pipeline: PipelineConfig,
    pub blocks: BlockConfig,
    pub log: LogConfig,
}

/// Parse a `usize` env var, returning `default` on missing or invalid.
fn parse_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a boolean env var, returning `default` on missing or invalid.
fn parse_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

fn load_pipeline_config() -> PipelineConfig {
    let validation_mode = parse_bool("SPECSYNC_VALIDATION_MODE", false);
    let max_micro_steps = match parse_usize("SPECSYNC_MAX_MICRO_STEPS", 0) {
        0 => None,
        cap => Some(cap),
    };
    PipelineConfig { validation_mode, max_micro_steps }
}

fn load_block_config() -> BlockConfig {
    let block_size = parse_usize("SPECSYNC_BLOCK_SIZE", DEFAULT_BLOCK_SIZE);
    let num_blocks = parse_usize("SPECSYNC_NUM_BLOCKS", 1024);
    let block_size = block_size.max(1);
    let num_blocks = num_blocks.max(1);
    BlockConfig { block_size, num_blocks }
}

fn load_log_config() -> LogConfig {
    let defaults = LogConfig::default();
    let level = std::env::var("SPECSYNC_LOG_LEVEL")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or(defaults.level);
    let format = std::env::var("SPECSYNC_LOG_FORMAT")
        .ok()
        .and_then(|v| v.parse::<LogFormat>().ok())
        .unwrap_or(defaults.format);
    LogConfig { format, level, output_path: None }
}

/// Load all configuration from environment variables.
///
/// Missing or invalid values fall back to safe defaults without panicking.
pub fn load() -> SyncConfig {
    SyncConfig {
        pipeline: load_pipeline_config(),
        blocks: load_block_config(),
        log: load_log_config(),
    }
}

/// Load configuration from a TOML file.
///
/// # Errors
///
/// Returns `SyncError::Config` if the file cannot be read or parsed.
pub fn load_file(path: impl AsRef<Path>) -> Result<SyncConfig, SyncError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .map_err(|e| SyncError::Config(format!("{}: {e}", path.display())))?;
    SyncConfig::from_toml_str(&text)
}

impl SyncConfig {
    /// Parse a TOML document. Missing sections take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, SyncError> {
        let mut config: Self = toml::from_str(text).map_err(|e| SyncError::Config(e.to_string()))?;
        config.blocks.block_size = config.blocks.block_size.max(1);
        Ok(config)
    }

    /// Return a serializable summary of all effective values.
    pub fn effective_config(&self) -> EffectiveConfig {
        EffectiveConfig {
            validation_mode: self.pipeline.validation_mode,
            max_micro_steps: self.pipeline.max_micro_steps,
            block_size: self.blocks.block_size,
            num_blocks: self.blocks.num_blocks,
            log_level: self.log.level.clone(),
            log_format: self.log.format,
        }
    }
}
