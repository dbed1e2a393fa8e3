//! # Backend Fallback
//!
//! Tries an ordered chain of backends, moving on only when a backend
//! reports that it is unavailable to this caller (regional blocking,
//! permanent precondition failures). Any other failure propagates
//! unchanged: a different backend would not fix a caller-side problem.
//!
//! Backends run strictly in order, never concurrently. Each backend owns
//! its own retry budget, usually by wrapping its call in
//! [`RetryPolicy::execute`](crate::retry::RetryPolicy::execute).

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use metrics::counter;
use tracing::{debug, info, warn};

use crate::classifier::ClassificationRule;
use crate::result::{IntoOperationResult, OperationResult};
use crate::retry::run_attempt;
use crate::types::{FaultCategory, FaultInfo, FaultSeverity};

/// Phrases backends use when they refuse service to a caller
pub const UNAVAILABILITY_MARKERS: [&str; 4] = [
    "user location is not supported",
    "failed_precondition",
    "not available in your country",
    "not available in your region",
];

/// Default unavailability predicate over fault text
pub fn is_backend_unavailable(text: &str) -> bool {
    let lowered = text.to_lowercase();
    UNAVAILABILITY_MARKERS.iter().any(|marker| lowered.contains(marker))
}

/// A classification rule that marks unavailability faults as terminal so
/// a backend's retry budget is not spent on them
pub fn unavailability_rule() -> ClassificationRule {
    ClassificationRule::new(
        "backend_unavailable",
        FaultCategory::RemoteApi,
        FaultSeverity::Fatal,
        "Backend is not available for this caller",
    )
    .matching(is_backend_unavailable)
}

type Invoke<'a, T> = Box<dyn FnOnce() -> BoxFuture<'a, OperationResult<T>> + Send + 'a>;

/// One named candidate in a [`BackendChain`]
pub struct Backend<'a, T> {
    name: String,
    invoke: Invoke<'a, T>,
}

impl<'a, T: 'a> Backend<'a, T> {
    pub fn new<N, F, Fut, A>(name: N, invoke: F) -> Self
    where
        N: Into<String>,
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = A> + Send + 'a,
        A: IntoOperationResult<T> + 'a,
    {
        Self {
            name: name.into(),
            invoke: Box::new(move || run_attempt(invoke()).boxed()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T> fmt::Debug for Backend<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend").field("name", &self.name).finish()
    }
}

/// Backends in preference order, plus the ones left out for lack of
/// configuration
#[derive(Debug)]
pub struct BackendChain<'a, T> {
    backends: Vec<Backend<'a, T>>,
    unconfigured: Vec<(String, String)>,
}

impl<'a, T: 'a> BackendChain<'a, T> {
    pub fn new() -> Self {
        Self {
            backends: Vec::new(),
            unconfigured: Vec::new(),
        }
    }

    pub fn with_backend<N, F, Fut, A>(mut self, name: N, invoke: F) -> Self
    where
        N: Into<String>,
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = A> + Send + 'a,
        A: IntoOperationResult<T> + 'a,
    {
        self.backends.push(Backend::new(name, invoke));
        self
    }

    /// Adds the backend if it is configured, otherwise records why not
    pub fn with_optional_backend<N, R, F, Fut, A>(mut self, name: N, invoke: Option<F>, missing_reason: R) -> Self
    where
        N: Into<String>,
        R: Into<String>,
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = A> + Send + 'a,
        A: IntoOperationResult<T> + 'a,
    {
        let name = name.into();
        match invoke {
            Some(invoke) => self.backends.push(Backend::new(name, invoke)),
            None => {
                debug!(backend = %name, "Backend not configured, skipping");
                self.unconfigured.push((name, missing_reason.into()));
            }
        }
        self
    }

    pub fn push(&mut self, backend: Backend<'a, T>) {
        self.backends.push(backend);
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Names of configured backends, in order
    pub fn names(&self) -> Vec<&str> {
        self.backends.iter().map(Backend::name).collect()
    }

    /// `(name, reason)` for every backend left out of the chain
    pub fn unconfigured(&self) -> &[(String, String)] {
        &self.unconfigured
    }
}

impl<'a, T: 'a> Default for BackendChain<'a, T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Walks a [`BackendChain`] using an unavailability predicate
#[derive(Clone)]
pub struct FallbackSelector {
    predicate: Arc<dyn Fn(&str) -> bool + Send + Sync>,
    record_metrics: bool,
}

impl FallbackSelector {
    /// A selector with a custom predicate over fault text
    pub fn new<P>(predicate: P) -> Self
    where
        P: Fn(&str) -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Arc::new(predicate),
            record_metrics: true,
        }
    }

    pub fn with_metrics(mut self, record: bool) -> Self {
        self.record_metrics = record;
        self
    }

    /// Whether the fault signals that its backend is unavailable.
    ///
    /// Both the classified message and the raw fault text are checked.
    pub fn is_unavailable(&self, fault: &FaultInfo) -> bool {
        if (self.predicate)(fault.message()) {
            return true;
        }
        fault
            .detail_value("raw_error")
            .and_then(|raw| raw.as_str())
            .map_or(false, |raw| (self.predicate)(raw))
    }

    /// Invokes the chain, returning the first success, the first fault not
    /// recognised as unavailability, or the last backend's failure.
    pub async fn invoke<T>(&self, chain: BackendChain<'_, T>) -> OperationResult<T> {
        let BackendChain { backends, unconfigured } = chain;

        if backends.is_empty() {
            let missing = unconfigured
                .iter()
                .map(|(name, reason)| format!("{} ({})", name, reason))
                .collect::<Vec<_>>()
                .join(", ");
            let message = if missing.is_empty() {
                "No backends configured".to_string()
            } else {
                format!("No backends configured: {}", missing)
            };
            warn!(unconfigured = %missing, "Fallback chain is empty");
            let fault = FaultInfo::new(FaultCategory::Validation, FaultSeverity::Fatal, message).detail(
                "unconfigured",
                unconfigured
                    .iter()
                    .map(|(name, reason)| serde_json::json!({ "backend": name, "reason": reason }))
                    .collect::<Vec<_>>(),
            );
            return OperationResult::fail(fault);
        }

        let total = backends.len();
        let mut skipped: Vec<String> = Vec::new();

        for (index, backend) in backends.into_iter().enumerate() {
            let Backend { name, invoke } = backend;
            debug!(backend = %name, position = index + 1, total, "Invoking backend");
            let result = invoke().await;

            match result.error() {
                None => {
                    if skipped.is_empty() {
                        return result.with_metadata("backend", name);
                    }
                    info!(backend = %name, skipped = ?skipped, "Served by fallback backend");
                    if self.record_metrics {
                        counter!("resilience.fallback.served", 1, "backend" => name.clone());
                    }
                    let warning = format!("{} unavailable, served by {}", skipped.join(", "), name);
                    return result
                        .with_warning(warning)
                        .with_metadata("backend", name)
                        .with_metadata("failed_over_from", skipped);
                }
                Some(fault) if index + 1 < total && self.is_unavailable(fault) => {
                    warn!(
                        backend = %name,
                        category = %fault.category(),
                        error = %fault.message(),
                        "Backend unavailable, failing over"
                    );
                    if self.record_metrics {
                        counter!("resilience.fallback.failovers", 1, "backend" => name.clone());
                    }
                    skipped.push(name);
                }
                Some(fault) => {
                    debug!(backend = %name, category = %fault.category(), "Backend failed, propagating");
                    let result = result.with_metadata("backend", name);
                    return if skipped.is_empty() {
                        result
                    } else {
                        result.with_metadata("failed_over_from", skipped)
                    };
                }
            }
        }

        // Every iteration returns except a failover, and the last backend never fails over
        OperationResult::fail(FaultInfo::new(
            FaultCategory::Unknown,
            FaultSeverity::Fatal,
            "Fallback chain ended without a result",
        ))
    }
}

impl Default for FallbackSelector {
    fn default() -> Self {
        Self::new(is_backend_unavailable)
    }
}

impl fmt::Debug for FallbackSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackSelector")
            .field("record_metrics", &self.record_metrics)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::classifier::Classifier;

    fn region_blocked() -> FaultInfo {
        FaultInfo::new(
            FaultCategory::RemoteApi,
            FaultSeverity::Fatal,
            "400 FAILED_PRECONDITION: User location is not supported for the API use.",
        )
    }

    fn selector() -> FallbackSelector {
        FallbackSelector::default().with_metrics(false)
    }

    #[tokio::test]
    async fn test_primary_success_skips_rest() {
        let secondary_calls = AtomicU32::new(0);
        let counter = &secondary_calls;
        let chain = BackendChain::new()
            .with_backend("primary", || async { OperationResult::ok("a") })
            .with_backend("secondary", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                OperationResult::ok("b")
            });

        let result = selector().invoke(chain).await;
        assert_eq!(result.value(), Some(&"a"));
        assert_eq!(result.metadata()["backend"], "primary");
        assert!(result.warnings().is_empty());
        assert_eq!(secondary_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fails_over_on_unavailability() {
        let chain = BackendChain::new()
            .with_backend("gemini", || async { OperationResult::<&str>::fail(region_blocked()) })
            .with_backend("openai", || async { OperationResult::ok("image") });

        let result = selector().invoke(chain).await;
        assert_eq!(result.value(), Some(&"image"));
        assert_eq!(result.metadata()["backend"], "openai");
        assert_eq!(result.metadata()["failed_over_from"], serde_json::json!(["gemini"]));
        assert_eq!(result.warnings().len(), 1);
    }

    #[tokio::test]
    async fn test_other_faults_propagate_unchanged() {
        let third_calls = AtomicU32::new(0);
        let counter = &third_calls;
        let chain = BackendChain::new()
            .with_backend("first", || async { OperationResult::<()>::fail(region_blocked()) })
            .with_backend("second", || async {
                OperationResult::<()>::fail(
                    FaultInfo::new(FaultCategory::Validation, FaultSeverity::Fatal, "prompt rejected")
                        .detail("field", "prompt"),
                )
            })
            .with_backend("third", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                OperationResult::ok(())
            });

        let result = selector().invoke(chain).await;
        let error = result.error().unwrap();
        assert_eq!(error.category(), FaultCategory::Validation);
        assert_eq!(error.message(), "prompt rejected");
        assert_eq!(error.detail_value("field").and_then(|v| v.as_str()), Some("prompt"));
        assert_eq!(result.metadata()["backend"], "second");
        assert_eq!(third_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_last_backend_failure_is_returned() {
        let chain = BackendChain::new()
            .with_backend("first", || async { OperationResult::<()>::fail(region_blocked()) })
            .with_backend("second", || async { Err::<(), _>("User location is not supported") });

        let result = selector().invoke(chain).await;
        assert!(result.is_failure());
        assert_eq!(result.metadata()["backend"], "second");
        assert_eq!(result.metadata()["failed_over_from"], serde_json::json!(["first"]));
    }

    #[test]
    fn test_empty_chain_names_missing_configuration() {
        let chain: BackendChain<'_, ()> = BackendChain::new().with_optional_backend(
            "openai",
            None::<fn() -> futures::future::Ready<OperationResult<()>>>,
            "OPENAI_API_KEY not set",
        );
        assert!(chain.is_empty());

        let result = tokio_test::block_on(selector().invoke(chain));
        let error = result.error().unwrap();
        assert_eq!(error.category(), FaultCategory::Validation);
        assert_eq!(error.severity(), FaultSeverity::Fatal);
        assert!(error.message().contains("openai (OPENAI_API_KEY not set)"));
    }

    #[tokio::test]
    async fn test_raw_error_is_checked() {
        let classifier = Classifier::new();
        let fault = classifier.classify_message("400 Bad Request: model not available in your region");
        assert_eq!(fault.category(), FaultCategory::RemoteApi);
        assert!(selector().is_unavailable(&fault));

        let strict = Classifier::new().with_rule(unavailability_rule());
        let fault = strict.classify_message("FAILED_PRECONDITION: User location is not supported");
        assert!(!fault.is_retryable());
        assert!(selector().is_unavailable(&fault));
    }

    #[tokio::test]
    async fn test_custom_predicate() {
        let selector = FallbackSelector::new(|text| text.contains("quota exhausted")).with_metrics(false);
        let chain = BackendChain::new()
            .with_backend("a", || async { Err::<u8, _>("quota exhausted for project") })
            .with_backend("b", || async { Ok::<u8, std::io::Error>(2) });

        assert_eq!(chain.names(), vec!["a", "b"]);
        let result = selector.invoke(chain).await;
        assert_eq!(result.value(), Some(&2));
    }
}
