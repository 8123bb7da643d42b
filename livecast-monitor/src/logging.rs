// Logging bootstrap.
//
// Output format and destination come from config; an explicit `RUST_LOG`
// always wins over the configured level.

use std::fs::OpenOptions;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "json" for machine-readable output, anything else logs pretty.
    pub format: String,
    /// Append to this file instead of stdout.
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("unknown log level: {0}")]
    UnknownLevel(String),

    #[error("failed to open log file: {0}")]
    OpenLogFile(#[from] std::io::Error),
}

/// Install the process-wide tracing subscriber.
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingError> {
    let subscriber = tracing_subscriber::registry().with(level_filter(config)?);
    let layer = fmt::layer()
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_writer(log_writer(config)?);

    if config.format == "json" {
        subscriber
            .with(
                layer
                    .json()
                    .with_current_span(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .init();
    } else {
        subscriber.with(layer.pretty().with_line_number(true)).init();
    }
    Ok(())
}

/// Filter from `RUST_LOG` when set, otherwise from the configured level.
/// The configured level is validated either way so a typo in config does
/// not go unnoticed just because the env var happens to be set.
fn level_filter(config: &LoggingConfig) -> Result<EnvFilter, LoggingError> {
    let level = match config.level.to_lowercase().as_str() {
        "warning" => Level::WARN,
        other => other
            .parse::<Level>()
            .map_err(|_| LoggingError::UnknownLevel(config.level.clone()))?,
    };
    Ok(EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string())))
}

fn log_writer(config: &LoggingConfig) -> Result<BoxMakeWriter, LoggingError> {
    Ok(match &config.file_path {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            BoxMakeWriter::new(Arc::new(file))
        }
        None => BoxMakeWriter::new(std::io::stdout),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_filter_accepts_known_levels() {
        for level in ["trace", "debug", "info", "warn", "warning", "error", "INFO"] {
            let config = LoggingConfig {
                level: level.to_string(),
                ..LoggingConfig::default()
            };
            assert!(level_filter(&config).is_ok(), "level {level} rejected");
        }
    }

    #[test]
    fn test_level_filter_rejects_unknown_level() {
        let config = LoggingConfig {
            level: "verbose".to_string(),
            ..LoggingConfig::default()
        };
        assert!(matches!(
            level_filter(&config),
            Err(LoggingError::UnknownLevel(_))
        ));
    }

    #[test]
    fn test_default_config() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, "info");
        assert_eq!(config.format, "pretty");
        assert!(config.file_path.is_none());
    }
}
