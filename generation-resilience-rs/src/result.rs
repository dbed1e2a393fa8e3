//! # Operation Results
//!
//! [`OperationResult`] is the contract every fallible step in this crate
//! uses instead of propagating raw errors: either a value or a classified
//! [`FaultInfo`], each carrying warnings and free-form metadata.

use std::error::Error as StdError;

use serde::Serialize;

use crate::classifier::classify_boxed;
use crate::types::{FaultCategory, FaultInfo};

/// Free-form metadata attached to a result
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Success or failure of one operation
#[derive(Debug, Clone)]
pub enum OperationResult<T> {
    /// The operation produced a value
    Success {
        value: T,
        warnings: Vec<String>,
        metadata: Metadata,
    },
    /// The operation failed with a classified fault
    Failure {
        error: FaultInfo,
        warnings: Vec<String>,
        metadata: Metadata,
    },
}

impl<T> OperationResult<T> {
    /// Creates a successful result
    pub fn ok(value: T) -> Self {
        OperationResult::Success {
            value,
            warnings: Vec::new(),
            metadata: Metadata::new(),
        }
    }

    /// Creates a failed result
    pub fn fail(error: FaultInfo) -> Self {
        OperationResult::Failure {
            error,
            warnings: Vec::new(),
            metadata: Metadata::new(),
        }
    }

    /// Classifies a raised fault into a failed result, optionally
    /// overriding the classified category.
    pub fn from_fault<E>(fault: E, category: Option<FaultCategory>) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        let info = classify_boxed(fault.into());
        let info = match category {
            Some(category) => info.with_category(category),
            None => info,
        };
        Self::fail(info)
    }

    /// Returns the result with an extra warning appended
    pub fn with_warning<S: Into<String>>(mut self, warning: S) -> Self {
        self.warnings_mut().push(warning.into());
        self
    }

    /// Returns the result with the given warnings appended
    pub fn with_warnings<I, S>(mut self, warnings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.warnings_mut().extend(warnings.into_iter().map(Into::into));
        self
    }

    /// Returns the result with one metadata entry set
    pub fn with_metadata<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Serialize,
    {
        if let Ok(value) = serde_json::to_value(value) {
            self.metadata_mut().insert(key.into(), value);
        }
        self
    }

    pub fn is_success(&self) -> bool {
        matches!(self, OperationResult::Success { .. })
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, OperationResult::Failure { .. })
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            OperationResult::Success { value, .. } => Some(value),
            OperationResult::Failure { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&FaultInfo> {
        match self {
            OperationResult::Success { .. } => None,
            OperationResult::Failure { error, .. } => Some(error),
        }
    }

    pub fn warnings(&self) -> &[String] {
        match self {
            OperationResult::Success { warnings, .. } | OperationResult::Failure { warnings, .. } => warnings,
        }
    }

    pub fn metadata(&self) -> &Metadata {
        match self {
            OperationResult::Success { metadata, .. } | OperationResult::Failure { metadata, .. } => metadata,
        }
    }

    /// Transforms the value of a success, keeping warnings and metadata
    pub fn map<U, F>(self, f: F) -> OperationResult<U>
    where
        F: FnOnce(T) -> U,
    {
        match self {
            OperationResult::Success { value, warnings, metadata } => OperationResult::Success {
                value: f(value),
                warnings,
                metadata,
            },
            OperationResult::Failure { error, warnings, metadata } => {
                OperationResult::Failure { error, warnings, metadata }
            }
        }
    }

    /// Transforms the value with a fallible function; its error is classified
    pub fn try_map<U, E, F>(self, f: F) -> OperationResult<U>
    where
        F: FnOnce(T) -> std::result::Result<U, E>,
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        match self {
            OperationResult::Success { value, warnings, metadata } => match f(value) {
                Ok(value) => OperationResult::Success { value, warnings, metadata },
                Err(err) => OperationResult::Failure {
                    error: classify_boxed(err.into()),
                    warnings,
                    metadata,
                },
            },
            OperationResult::Failure { error, warnings, metadata } => {
                OperationResult::Failure { error, warnings, metadata }
            }
        }
    }

    /// Returns the value or the given default
    pub fn unwrap_or(self, default: T) -> T {
        match self {
            OperationResult::Success { value, .. } => value,
            OperationResult::Failure { .. } => default,
        }
    }

    /// Returns the value or computes one from the fault
    pub fn unwrap_or_else<F>(self, f: F) -> T
    where
        F: FnOnce(FaultInfo) -> T,
    {
        match self {
            OperationResult::Success { value, .. } => value,
            OperationResult::Failure { error, .. } => f(error),
        }
    }

    /// Converts to a standard Result, dropping warnings and metadata
    pub fn into_result(self) -> std::result::Result<T, FaultInfo> {
        match self {
            OperationResult::Success { value, .. } => Ok(value),
            OperationResult::Failure { error, .. } => Err(error),
        }
    }

    fn warnings_mut(&mut self) -> &mut Vec<String> {
        match self {
            OperationResult::Success { warnings, .. } | OperationResult::Failure { warnings, .. } => warnings,
        }
    }

    fn metadata_mut(&mut self) -> &mut Metadata {
        match self {
            OperationResult::Success { metadata, .. } | OperationResult::Failure { metadata, .. } => metadata,
        }
    }
}

/// Anything an attempt may hand back: an [`OperationResult`] or a plain
/// `Result` whose error is classified on the way in.
pub trait IntoOperationResult<T> {
    fn into_operation_result(self) -> OperationResult<T>;
}

impl<T> IntoOperationResult<T> for OperationResult<T> {
    fn into_operation_result(self) -> OperationResult<T> {
        self
    }
}

impl<T, E> IntoOperationResult<T> for std::result::Result<T, E>
where
    E: Into<Box<dyn StdError + Send + Sync>>,
{
    fn into_operation_result(self) -> OperationResult<T> {
        match self {
            Ok(value) => OperationResult::ok(value),
            Err(err) => OperationResult::from_fault(err, None),
        }
    }
}

/// Runs a synchronous fallible function, classifying any error under the
/// given category.
pub fn safe_execute<T, E, F>(f: F, category: FaultCategory) -> OperationResult<T>
where
    F: FnOnce() -> std::result::Result<T, E>,
    E: Into<Box<dyn StdError + Send + Sync>>,
{
    match f() {
        Ok(value) => OperationResult::ok(value),
        Err(err) => OperationResult::from_fault(err, Some(category)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FaultSeverity;

    fn timeout_fault() -> FaultInfo {
        FaultInfo::new(FaultCategory::Timeout, FaultSeverity::Recoverable, "timed out")
    }

    #[test]
    fn test_ok_and_fail() {
        let ok = OperationResult::ok(42).with_warning("slow").with_metadata("source", "inline_data");
        assert!(ok.is_success());
        assert_eq!(ok.value(), Some(&42));
        assert!(ok.error().is_none());
        assert_eq!(ok.warnings(), ["slow".to_string()]);
        assert_eq!(ok.metadata()["source"], "inline_data");

        let failed: OperationResult<i32> = OperationResult::fail(timeout_fault()).with_warning("first try");
        assert!(failed.is_failure());
        assert!(failed.value().is_none());
        assert_eq!(failed.error().map(|e| e.category()), Some(FaultCategory::Timeout));
        assert_eq!(failed.warnings().len(), 1);
    }

    #[test]
    fn test_from_fault_classifies_and_overrides() {
        let result: OperationResult<()> = OperationResult::from_fault("503 Service Unavailable", None);
        assert_eq!(result.error().map(|e| e.category()), Some(FaultCategory::ServerSide));

        let result: OperationResult<()> =
            OperationResult::from_fault("503 Service Unavailable", Some(FaultCategory::Validation));
        let error = result.error().unwrap();
        assert_eq!(error.category(), FaultCategory::Validation);
        assert!(error.underlying().is_some());
    }

    #[test]
    fn test_map_preserves_warnings_and_metadata() {
        let mapped = OperationResult::ok(2).with_warning("w").with_metadata("k", 1).map(|v| v * 10);
        assert_eq!(mapped.value(), Some(&20));
        assert_eq!(mapped.warnings(), ["w".to_string()]);
        assert_eq!(mapped.metadata()["k"], 1);

        let failed: OperationResult<i32> = OperationResult::fail(timeout_fault());
        let mapped = failed.map(|v| v.to_string());
        assert!(mapped.is_failure());
    }

    #[test]
    fn test_try_map_classifies_errors() {
        let result = OperationResult::ok("abc").try_map(|s| s.parse::<u32>());
        assert!(result.is_failure());
        assert_eq!(result.error().map(|e| e.category()), Some(FaultCategory::Unknown));
    }

    #[test]
    fn test_default_extraction() {
        let failed: OperationResult<i32> = OperationResult::fail(timeout_fault());
        assert_eq!(failed.clone().unwrap_or(7), 7);
        assert_eq!(failed.unwrap_or_else(|e| e.message().len() as i32), 9);
        assert_eq!(OperationResult::ok(1).unwrap_or(7), 1);
    }

    #[test]
    fn test_into_operation_result() {
        let ok: std::result::Result<u8, String> = Ok(1);
        assert!(ok.into_operation_result().is_success());

        let err: std::result::Result<u8, String> = Err("401 Unauthorized".to_string());
        let result = err.into_operation_result();
        assert_eq!(result.error().map(|e| e.category()), Some(FaultCategory::Auth));
    }

    #[test]
    fn test_safe_execute() {
        let result = safe_execute(|| std::fs::read("/definitely/not/here.png"), FaultCategory::Validation);
        assert_eq!(result.error().map(|e| e.category()), Some(FaultCategory::Validation));

        let result = safe_execute(|| Ok::<_, std::io::Error>(5), FaultCategory::Validation);
        assert_eq!(result.value(), Some(&5));
    }
}
