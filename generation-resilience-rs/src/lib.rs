//! # Generation Resilience
//!
//! Resilient invocation core for external image-generation backends.
//!
//! ## Features
//!
//! - Rule-table classification of raised faults and error text into [`FaultInfo`]
//! - [`OperationResult`] as the fallible-call contract, with warnings and metadata
//! - Retry with capped exponential backoff that honours server-declared cooldowns
//! - Image payload validation by magic bytes, with one-shot re-encoding repair
//! - Ordered backend fallback on recognised unavailability
//! - Numbered per-session diagnostic records
//!

pub mod types;
pub mod sanitization;
pub mod classifier;
pub mod result;
pub mod payload;
pub mod retry;
pub mod fallback;
pub mod diagnostics;
pub mod logging;
pub mod settings;

// Re-export commonly used types
pub use types::{Error, FaultCategory, FaultInfo, FaultSeverity, Result};
pub use classifier::{classify_error, classify_http, classify_message, ClassificationRule, Classifier};
pub use result::{safe_execute, IntoOperationResult, OperationResult};
pub use payload::{decode_response, prepare_for_upload, repair, validate, ImageFormat, ResponsePart};
pub use retry::{cancellation, retry, CancellationSignal, Cancelled, RetryConfig, RetryPolicy};
pub use fallback::{BackendChain, FallbackSelector};
pub use diagnostics::DiagnosticLogger;
pub use logging::init_logging;
pub use settings::ResilienceSettings;

/// Initializes logging with default settings
pub fn init() -> Result<()> {
    init_logging(None)
}

/// Loads settings from `path` and the environment and initializes logging
pub fn init_with_config(path: Option<&std::path::Path>) -> Result<ResilienceSettings> {
    let settings = ResilienceSettings::load(path)?;
    init_logging(Some(settings.logging.clone()))?;
    Ok(settings)
}
