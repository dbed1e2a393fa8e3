//! # Settings
//!
//! Layered configuration: an optional file, then `RESILIENCE__*`
//! environment variables (after loading `.env`).

use std::path::Path;

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use crate::diagnostics::{DiagnosticLogger, DiagnosticsConfig};
use crate::logging::LoggingConfig;
use crate::retry::{RetryConfig, RetryPolicy};
use crate::types::Result;

/// Prefix of environment overrides, e.g. `RESILIENCE__RETRY__MAX_RETRIES`
pub const ENV_PREFIX: &str = "RESILIENCE";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceSettings {
    pub retry: RetryConfig,
    pub logging: LoggingConfig,
    pub diagnostics: DiagnosticsConfig,
}

impl ResilienceSettings {
    /// Loads settings from `path` (if given) and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenv::dotenv().ok();

        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        let cfg = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(Self::try_from(cfg)?)
    }

    /// Validated retry policy for these settings
    pub fn retry_policy(&self) -> Result<RetryPolicy> {
        RetryPolicy::new(self.retry.clone())
    }

    pub fn diagnostic_logger(&self) -> Result<DiagnosticLogger> {
        DiagnosticLogger::from_config(&self.diagnostics)
    }
}

impl TryFrom<Config> for ResilienceSettings {
    type Error = ConfigError;

    fn try_from(cfg: Config) -> std::result::Result<Self, Self::Error> {
        cfg.try_deserialize()
    }
}
