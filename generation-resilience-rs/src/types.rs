//! # Fault Types
//!
//! Structured descriptions of failures observed while talking to external
//! generation backends, plus the crate-level error type used for
//! programmer and configuration errors.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

use crate::sanitization::sanitize_message;

/// A type alias for Result with the error type defaulting to our Error
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Ordered diagnostic values attached to a fault
pub type Details = serde_json::Map<String, serde_json::Value>;

/// Errors raised for misuse of the crate rather than for failed operations.
///
/// Failed remote operations never surface as `Error`; they are returned as
/// [`crate::OperationResult::Failure`].
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid retry policy: {0}")]
    InvalidPolicy(String),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("failed to initialize logging: {0}")]
    Logging(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Categorizes faults; drives the default retry behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultCategory {
    /// Connection, DNS or other connectivity issues
    #[serde(rename = "network")]
    Network,
    /// The remote service is throttling us
    #[serde(rename = "rate_limit")]
    RateLimit,
    /// Local data validation failures
    #[serde(rename = "validation")]
    Validation,
    /// The remote API rejected the request
    #[serde(rename = "api_error")]
    RemoteApi,
    /// Image payload is corrupt or unreadable
    #[serde(rename = "image_corrupt")]
    ImageCorrupt,
    /// Payload bytes disagree with the declared media type
    #[serde(rename = "media_type")]
    MediaTypeMismatch,
    /// The operation timed out
    #[serde(rename = "timeout")]
    Timeout,
    /// Authentication problems
    #[serde(rename = "auth")]
    Auth,
    /// Server-side (5xx) errors
    #[serde(rename = "server")]
    ServerSide,
    /// Nothing matched
    #[serde(rename = "unknown")]
    Unknown,
}

impl FaultCategory {
    /// The stable identifier used in diagnostic records
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultCategory::Network => "network",
            FaultCategory::RateLimit => "rate_limit",
            FaultCategory::Validation => "validation",
            FaultCategory::RemoteApi => "api_error",
            FaultCategory::ImageCorrupt => "image_corrupt",
            FaultCategory::MediaTypeMismatch => "media_type",
            FaultCategory::Timeout => "timeout",
            FaultCategory::Auth => "auth",
            FaultCategory::ServerSide => "server",
            FaultCategory::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FaultCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultCategory::Network => write!(f, "Network Error"),
            FaultCategory::RateLimit => write!(f, "Rate Limit Error"),
            FaultCategory::Validation => write!(f, "Validation Error"),
            FaultCategory::RemoteApi => write!(f, "Remote API Error"),
            FaultCategory::ImageCorrupt => write!(f, "Corrupt Image"),
            FaultCategory::MediaTypeMismatch => write!(f, "Media Type Mismatch"),
            FaultCategory::Timeout => write!(f, "Timeout Error"),
            FaultCategory::Auth => write!(f, "Authentication Error"),
            FaultCategory::ServerSide => write!(f, "Server Error"),
            FaultCategory::Unknown => write!(f, "Unknown Error"),
        }
    }
}

/// How bad a fault is. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FaultSeverity {
    /// Something was off but the operation can continue
    Warning,
    /// Failed, but a retry may succeed
    Recoverable,
    /// This operation must stop
    Fatal,
    /// The whole batch should consider stopping
    Critical,
}

impl FaultSeverity {
    /// Fatal and Critical faults must never be retried
    pub fn is_terminal(&self) -> bool {
        matches!(self, FaultSeverity::Fatal | FaultSeverity::Critical)
    }

    /// Critical faults signal that the caller should halt the entire batch
    pub fn halts_batch(&self) -> bool {
        matches!(self, FaultSeverity::Critical)
    }
}

impl fmt::Display for FaultSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultSeverity::Warning => write!(f, "WARNING"),
            FaultSeverity::Recoverable => write!(f, "RECOVERABLE"),
            FaultSeverity::Fatal => write!(f, "FATAL"),
            FaultSeverity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Structured description of one observed fault.
///
/// Fields are private so that `is_retryable` can never be `true` alongside
/// a Fatal or Critical severity. The underlying fault is kept for logging
/// only and serializes as a textual `traceback`.
#[derive(Debug, Clone, Serialize)]
pub struct FaultInfo {
    category: FaultCategory,
    severity: FaultSeverity,
    message: String,
    details: Details,
    timestamp: DateTime<Utc>,
    #[serde(serialize_with = "serialize_retry_after")]
    retry_after: Option<Duration>,
    is_retryable: bool,
    #[serde(rename = "traceback", serialize_with = "serialize_traceback")]
    source: Option<Arc<dyn StdError + Send + Sync>>,
}

impl FaultInfo {
    /// Creates a new fault. Retryability defaults from the severity.
    pub fn new<S: Into<String>>(category: FaultCategory, severity: FaultSeverity, message: S) -> Self {
        Self {
            category,
            severity,
            message: message.into(),
            details: Details::new(),
            timestamp: Utc::now(),
            retry_after: None,
            is_retryable: !severity.is_terminal(),
            source: None,
        }
    }

    /// Sets the server-declared or rule-defined cooldown before a retry
    pub fn retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    /// Marks the fault retryable or not. Terminal severities stay non-retryable.
    pub fn retryable(mut self, retryable: bool) -> Self {
        self.is_retryable = retryable && !self.severity.is_terminal();
        self
    }

    /// Adds a diagnostic value
    pub fn detail<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Serialize,
    {
        if let Ok(value) = serde_json::to_value(value) {
            self.details.insert(key.into(), value);
        }
        self
    }

    /// Chains the fault with the error that caused it
    pub fn source<E>(mut self, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        self.source = Some(Arc::new(source));
        self
    }

    /// Chains the fault with an already boxed error
    pub fn boxed_source(mut self, source: Box<dyn StdError + Send + Sync>) -> Self {
        self.source = Some(Arc::from(source));
        self
    }

    /// Overrides the category after classification.
    ///
    /// This is the only sanctioned mutation of a fault once built.
    pub fn with_category(mut self, category: FaultCategory) -> Self {
        self.category = category;
        self
    }

    pub fn category(&self) -> FaultCategory {
        self.category
    }

    pub fn severity(&self) -> FaultSeverity {
        self.severity
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> &Details {
        &self.details
    }

    /// Looks up a single diagnostic value
    pub fn detail_value(&self, key: &str) -> Option<&serde_json::Value> {
        self.details.get(key)
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn retry_after_hint(&self) -> Option<Duration> {
        self.retry_after
    }

    pub fn is_retryable(&self) -> bool {
        self.is_retryable
    }

    /// The underlying fault, if one was observed
    pub fn underlying(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    /// Renders the underlying fault and its cause chain, one entry per level
    pub fn traceback(&self) -> Option<Vec<String>> {
        self.source.as_deref().map(|err| cause_chain(err))
    }

    /// Serializes the fault into the diagnostic record representation
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl fmt::Display for FaultInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.category, self.message)?;

        if let Some(delay) = self.retry_after {
            write!(f, " (retry after {:.1}s)", delay.as_secs_f64())?;
        }

        Ok(())
    }
}

impl StdError for FaultInfo {}

fn cause_chain(err: &(dyn StdError + 'static)) -> Vec<String> {
    let mut lines = vec![sanitize_message(&err.to_string())];
    let mut current = err.source();
    while let Some(cause) = current {
        lines.push(format!("Caused by: {}", sanitize_message(&cause.to_string())));
        current = cause.source();
    }
    lines
}

fn serialize_retry_after<S>(value: &Option<Duration>, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match value {
        Some(delay) => serializer.serialize_f64(delay.as_secs_f64()),
        None => serializer.serialize_none(),
    }
}

fn serialize_traceback<S>(
    value: &Option<Arc<dyn StdError + Send + Sync>>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match value {
        Some(err) => serializer.collect_seq(cause_chain(err.as_ref())),
        None => serializer.serialize_none(),
    }
}
