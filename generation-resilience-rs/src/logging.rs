//! # Structured Logging
//!
//! Subscriber setup for binaries embedding the crate, and severity-aware
//! logging of classified faults.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

use crate::types::{Error, FaultInfo, FaultSeverity, Result};

// Flag to track if logging has been initialized
static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

// Flushes the file writer on drop; lives for the rest of the process
static FILE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

/// Configuration for the logging system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// The log level to use (trace, debug, info, warn, error)
    pub level: String,
    /// Identifies the process in log output and file names
    pub service_name: String,
    /// Whether to also write logs to a daily-rolling file
    pub file_output: bool,
    /// The directory to store log files in
    pub log_dir: Option<PathBuf>,
    /// Whether to use JSON formatting
    pub json_format: bool,
    /// Whether to include file and line information
    pub include_source_code: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            service_name: "generation-resilience".to_string(),
            file_output: false,
            log_dir: None,
            json_format: false,
            include_source_code: false,
        }
    }
}

/// Installs the global subscriber. Later calls are no-ops.
pub fn init_logging(config: Option<LoggingConfig>) -> Result<()> {
    if LOGGING_INITIALIZED.load(Ordering::SeqCst) {
        return Ok(());
    }

    let config = config.unwrap_or_default();

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| Error::Logging(format!("invalid log level {:?}: {}", config.level, e)))?;

    let json_layer = config.json_format.then(|| {
        fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_target(true)
            .with_file(config.include_source_code)
            .with_line_number(config.include_source_code)
    });

    let text_layer = (!config.json_format).then(|| {
        fmt::layer()
            .with_target(true)
            .with_file(config.include_source_code)
            .with_line_number(config.include_source_code)
    });

    let file_layer = match (config.file_output, &config.log_dir) {
        (true, Some(log_dir)) => {
            let appender = RollingFileAppender::new(
                Rotation::DAILY,
                log_dir,
                format!("{}.log", config.service_name),
            );
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = FILE_GUARD.set(guard);
            Some(fmt::layer().with_writer(writer).with_ansi(false))
        }
        _ => None,
    };

    let subscriber = Registry::default()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer);

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Error::Logging(format!("Failed to set global subscriber: {}", e)))?;

    LOGGING_INITIALIZED.store(true, Ordering::SeqCst);

    tracing::info!(
        service = %config.service_name,
        level = %config.level,
        json = config.json_format,
        "Structured logging initialized"
    );

    Ok(())
}

/// Logs a fault at the level matching its severity
pub fn log_fault(fault: &FaultInfo, context: &str) {
    let retry_after_ms = fault.retry_after_hint().map(|d| d.as_millis() as u64);

    match fault.severity() {
        FaultSeverity::Critical | FaultSeverity::Fatal => tracing::error!(
            context = %context,
            category = %fault.category(),
            severity = %fault.severity(),
            retryable = fault.is_retryable(),
            message = %fault.message(),
            "Fault recorded"
        ),
        FaultSeverity::Recoverable => tracing::warn!(
            context = %context,
            category = %fault.category(),
            severity = %fault.severity(),
            retry_after_ms = ?retry_after_ms,
            message = %fault.message(),
            "Fault recorded"
        ),
        FaultSeverity::Warning => tracing::info!(
            context = %context,
            category = %fault.category(),
            message = %fault.message(),
            "Fault recorded"
        ),
    }
}

impl TryFrom<config::Config> for LoggingConfig {
    type Error = config::ConfigError;

    fn try_from(cfg: config::Config) -> std::result::Result<Self, Self::Error> {
        // Start from defaults and selectively override from the provided config.
        let mut base = LoggingConfig::default();

        if let Ok(level) = cfg.get::<String>("logging.level") {
            base.level = level;
        }
        if let Ok(service_name) = cfg.get::<String>("logging.service_name") {
            base.service_name = service_name;
        }
        if let Ok(file_output) = cfg.get::<bool>("logging.file_output") {
            base.file_output = file_output;
        }
        if let Ok(log_dir) = cfg.get::<String>("logging.log_dir") {
            base.log_dir = Some(PathBuf::from(log_dir));
        }
        if let Ok(json_format) = cfg.get::<bool>("logging.json_format") {
            base.json_format = json_format;
        }
        if let Ok(include_source_code) = cfg.get::<bool>("logging.include_source_code") {
            base.include_source_code = include_source_code;
        }

        Ok(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FaultCategory;

    #[test]
    fn test_init_is_idempotent() {
        assert!(init_logging(Some(LoggingConfig {
            level: "debug".to_string(),
            ..LoggingConfig::default()
        }))
        .is_ok());
        assert!(init_logging(None).is_ok());

        log_fault(
            &FaultInfo::new(FaultCategory::Auth, FaultSeverity::Fatal, "Authentication failed - check API key"),
            "test",
        );
    }

    #[test]
    fn test_config_overrides() {
        let cfg = config::Config::builder()
            .set_override("logging.level", "warn")
            .unwrap()
            .set_override("logging.json_format", true)
            .unwrap()
            .set_override("logging.log_dir", "/tmp/resilience-logs")
            .unwrap()
            .build()
            .unwrap();

        let logging = LoggingConfig::try_from(cfg).unwrap();
        assert_eq!(logging.level, "warn");
        assert!(logging.json_format);
        assert_eq!(logging.log_dir, Some(PathBuf::from("/tmp/resilience-logs")));
        assert_eq!(logging.service_name, "generation-resilience");
    }
}
