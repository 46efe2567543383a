//! Subscriber setup for kernel diagnostics.
//!
//! Kernels log through `tracing` only; nothing is printed unless the host
//! process installs a subscriber, either its own or the one built here.

use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per event.
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub format: LogFormat,
    /// Filter directive, e.g. `"info"` or `"gg_compute::backend::cl=debug"`.
    pub level: String,
    /// Log file; stderr when unset.
    pub output_path: Option<PathBuf>,
    /// Emit an event with the busy/idle time whenever a kernel span closes.
    pub span_timing: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            level: "info".to_string(),
            output_path: None,
            span_timing: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("Invalid log filter: {0}")]
    InvalidFilter(String),
    #[error("Failed to open log file {path}: {reason}")]
    FileOpen { path: PathBuf, reason: String },
    #[error("A global subscriber is already installed")]
    AlreadyInitialized,
}

impl LogConfig {
    fn filter(&self) -> Result<EnvFilter, LogError> {
        EnvFilter::try_new(&self.level).map_err(|e| LogError::InvalidFilter(e.to_string()))
    }

    fn writer(&self) -> Result<BoxMakeWriter, LogError> {
        match &self.output_path {
            Some(path) => {
                let file = std::fs::File::create(path).map_err(|e| LogError::FileOpen {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
                Ok(BoxMakeWriter::new(Mutex::new(file)))
            }
            None => Ok(BoxMakeWriter::new(std::io::stderr)),
        }
    }

    fn span_events(&self) -> FmtSpan {
        if self.span_timing {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }
}

/// Install the global subscriber described by `config`.
///
/// Fails without side effects when the filter is malformed or the log
/// file cannot be created.
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    let filter = config.filter()?;
    let writer = config.writer()?;
    let layer = fmt::layer()
        .with_writer(writer)
        .with_span_events(config.span_events());

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match config.format {
        LogFormat::Json => registry.with(layer.json()).try_init(),
        LogFormat::Pretty => registry.with(layer.pretty()).try_init(),
    };
    installed.map_err(|_| LogError::AlreadyInitialized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_filter_is_rejected() {
        let config = LogConfig {
            level: "gg_compute=verbose".to_string(),
            ..LogConfig::default()
        };
        assert!(matches!(init_logging(&config), Err(LogError::InvalidFilter(_))));
    }

    #[test]
    fn test_unwritable_log_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig {
            output_path: Some(dir.path().join("missing").join("kernels.log")),
            ..LogConfig::default()
        };
        let err = init_logging(&config).unwrap_err();
        assert!(matches!(err, LogError::FileOpen { .. }));
        assert!(err.to_string().contains("kernels.log"));
    }

    #[test]
    fn test_format_deserializes_lowercase() {
        let config: LogConfig = toml::from_str("format = \"pretty\"\nlevel = \"debug\"").unwrap();
        assert_eq!(config.format, LogFormat::Pretty);
        assert_eq!(config.level, "debug");
        assert!(config.output_path.is_none());
        assert!(!config.span_timing);
        assert_eq!(config.span_events(), FmtSpan::NONE);
    }
}
