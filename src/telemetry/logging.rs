//! Subscriber setup for the synchronization core's tracing events.
//!
//! The core logs request admission and removal at `info`, each
//! reconciliation and draft micro-step at `debug`, pause transitions at
//! `trace`, and cancellation or the micro-step cap at `warn`. Reconcile and
//! multistep spans carry the request id and token counts, so JSON output
//! with the current span attached is the default.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per event, span fields included.
    #[default]
    Json,
    /// Multi-line human-readable output.
    Pretty,
}

impl FromStr for LogFormat {
    type Err = LogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            other => Err(LogError::UnknownFormat(other.to_string())),
        }
    }
}

/// `[log]` section of the sync configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub format: LogFormat,
    /// `EnvFilter` directive, e.g. `specsync_core::engine=debug` to see every
    /// reconciliation.
    pub level: String,
    /// Append to this file instead of stderr.
    pub output_path: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            level: "info".to_string(),
            output_path: None,
        }
    }
}

impl LogConfig {
    /// Parse the level directive without installing anything.
    pub fn env_filter(&self) -> Result<EnvFilter, LogError> {
        EnvFilter::try_new(&self.level).map_err(|e| LogError::InvalidFilter(e.to_string()))
    }
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("Invalid log filter: {0}")]
    InvalidFilter(String),
    #[error("Unknown log format: {0}")]
    UnknownFormat(String),
    #[error("Failed to open log file: {0}")]
    FileOpen(String),
    #[error("Subscriber already initialized")]
    AlreadyInitialized,
}

/// Install the global subscriber. The library never calls this itself;
/// the embedding process does, once.
///
/// # Errors
///
/// Returns error if the level directive does not parse, the log file cannot
/// be opened, or a global subscriber is already set.
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    let registry = tracing_subscriber::registry().with(config.env_filter()?);
    let file = config.output_path.as_deref().map(open_log_file).transpose()?;

    let installed = match (config.format, file) {
        (LogFormat::Json, None) => {
            registry.with(fmt::layer().json().with_current_span(true)).try_init()
        }
        (LogFormat::Json, Some(file)) => registry
            .with(fmt::layer().json().with_current_span(true).with_writer(file))
            .try_init(),
        (LogFormat::Pretty, None) => registry.with(fmt::layer().pretty()).try_init(),
        (LogFormat::Pretty, Some(file)) => registry
            .with(fmt::layer().pretty().with_ansi(false).with_writer(file))
            .try_init(),
    };
    installed.map_err(|_| LogError::AlreadyInitialized)
}

fn open_log_file(path: &Path) -> Result<Mutex<File>, LogError> {
    File::options()
        .create(true)
        .append(true)
        .open(path)
        .map(Mutex::new)
        .map_err(|e| LogError::FileOpen(format!("{}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_parses_case_insensitively() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!(" pretty ".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!(matches!("xml".parse::<LogFormat>(), Err(LogError::UnknownFormat(_))));
    }

    #[test]
    fn module_directive_parses() {
        let config = LogConfig {
            level: "specsync_core::engine=debug,info".to_string(),
            ..LogConfig::default()
        };
        assert!(config.env_filter().is_ok());
    }

    #[test]
    fn unopenable_log_file_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = open_log_file(&dir.path().join("missing").join("sync.log")).unwrap_err();
        assert!(matches!(err, LogError::FileOpen(msg) if msg.contains("sync.log")));
    }

    #[test]
    fn invalid_filter_rejected_before_install() {
        let config = LogConfig { level: "specsync_core=notalevel".to_string(), ..LogConfig::default() };
        assert!(matches!(init_logging(&config), Err(LogError::InvalidFilter(_))));
    }
}
