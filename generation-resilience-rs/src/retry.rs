//! # Retry Orchestration
//!
//! Re-invokes a failing operation with exponential backoff. A
//! server-declared `retry_after` on the fault takes precedence over the
//! computed delay, and every wait is bounded by the policy's maximum.
//!
//! Attempts are strictly sequential. The only suspension point between
//! attempts is the backoff wait, which can be aborted through a
//! [`CancellationSignal`].

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use metrics::counter;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::classifier::{classify_message, REQUIRES_INPUT_CHANGE};
use crate::result::{IntoOperationResult, OperationResult};
use crate::types::{Error, FaultCategory, FaultInfo, FaultSeverity, Result};

/// Callback invoked before each backoff wait with
/// `(attempt_number, fault, wait)`; attempt numbers start at 1.
pub type RetryObserver = Arc<dyn Fn(u32, &FaultInfo, Duration) + Send + Sync>;

/// Serializable retry configuration, in seconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,

    /// Delay before the first retry
    pub initial_delay_secs: f64,

    /// Upper bound for any single wait
    pub max_delay_secs: f64,

    /// Growth factor applied after each wait
    pub backoff_factor: f64,

    /// Random extra fraction (0.0 - 1.0) added to computed delays
    pub jitter_factor: f64,

    /// Whether bad-request faults are retried
    pub retry_bad_requests: bool,

    /// Whether to record metrics
    pub record_metrics: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_secs: 1.0,
            max_delay_secs: 60.0,
            backoff_factor: 2.0,
            jitter_factor: 0.0,
            retry_bad_requests: true,
            record_metrics: true,
        }
    }
}

fn seconds(field: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| Error::InvalidPolicy(format!("{} must be a finite, non-negative number of seconds, got {}", field, value)))
}

/// How an operation is retried
#[derive(Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    initial_delay: Duration,
    max_delay: Duration,
    backoff_factor: f64,
    jitter_factor: f64,
    retry_bad_requests: bool,
    record_metrics: bool,
    observer: Option<RetryObserver>,
}

impl RetryPolicy {
    /// Builds a policy from configuration, rejecting malformed values
    pub fn new(config: RetryConfig) -> Result<Self> {
        let initial_delay = seconds("initial_delay_secs", config.initial_delay_secs)?;
        let max_delay = seconds("max_delay_secs", config.max_delay_secs)?;

        if !config.backoff_factor.is_finite() || config.backoff_factor < 1.0 {
            return Err(Error::InvalidPolicy(format!(
                "backoff_factor must be at least 1.0, got {}",
                config.backoff_factor
            )));
        }
        if !(0.0..=1.0).contains(&config.jitter_factor) {
            return Err(Error::InvalidPolicy(format!(
                "jitter_factor must be within [0, 1], got {}",
                config.jitter_factor
            )));
        }
        if initial_delay > max_delay {
            return Err(Error::InvalidPolicy(format!(
                "initial delay {:?} exceeds max delay {:?}",
                initial_delay, max_delay
            )));
        }

        Ok(Self {
            max_retries: config.max_retries,
            initial_delay,
            max_delay,
            backoff_factor: config.backoff_factor,
            jitter_factor: config.jitter_factor,
            retry_bad_requests: config.retry_bad_requests,
            record_metrics: config.record_metrics,
            observer: None,
        })
    }

    /// The policy used by the generation scripts: 3 retries from 2s
    pub fn generation() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            ..Self::default()
        }
    }

    /// A single attempt, never retried
    pub fn never() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// A constant delay between attempts
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay: delay,
            max_delay: delay,
            backoff_factor: 1.0,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the growth factor; values below 1.0 are clamped to 1.0
    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = if factor.is_finite() { factor.max(1.0) } else { 1.0 };
        self
    }

    pub fn with_retry_bad_requests(mut self, retry: bool) -> Self {
        self.retry_bad_requests = retry;
        self
    }

    pub fn with_metrics(mut self, record: bool) -> Self {
        self.record_metrics = record;
        self
    }

    /// Registers a callback run before each backoff wait.
    ///
    /// The callback must not panic; panics are not caught.
    pub fn with_observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(u32, &FaultInfo, Duration) + Send + Sync + 'static,
    {
        self.observer = Some(Arc::new(observer));
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn backoff_factor(&self) -> f64 {
        self.backoff_factor
    }

    /// Computed backoff before retry `attempt` (starting at 1), ignoring
    /// server-declared delays and jitter
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::try_from_secs_f64(delay.as_secs_f64() * self.backoff_factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter_factor <= 0.0 {
            return delay;
        }
        let extra = delay.mul_f64(self.jitter_factor * rand::thread_rng().gen::<f64>());
        delay + extra
    }

    fn wait_for(&self, fault: &FaultInfo, delay: Duration) -> Duration {
        fault
            .retry_after_hint()
            .unwrap_or_else(|| self.jittered(delay))
            .min(self.max_delay)
    }

    fn should_retry(&self, fault: &FaultInfo) -> bool {
        if !fault.is_retryable() {
            return false;
        }
        let needs_new_input = fault
            .detail_value(REQUIRES_INPUT_CHANGE)
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        self.retry_bad_requests || !needs_new_input
    }

    /// Runs the operation until it succeeds, fails terminally, or the
    /// retry budget is spent.
    ///
    /// The operation may return an [`OperationResult`] or a plain `Result`;
    /// errors and panics are classified and treated as returned failures.
    pub async fn execute<T, F, Fut, A>(&self, operation_name: &str, operation: F) -> OperationResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = A>,
        A: IntoOperationResult<T>,
    {
        match self.run(operation_name, operation, None).await {
            Ok(result) => result,
            // Unreachable without a signal
            Err(cancelled) => OperationResult::fail(FaultInfo::new(
                FaultCategory::Unknown,
                FaultSeverity::Fatal,
                cancelled.to_string(),
            )),
        }
    }

    /// Like [`execute`](Self::execute), but aborts as soon as the signal
    /// fires, whether an attempt or a backoff wait is in progress.
    pub async fn execute_cancellable<T, F, Fut, A>(
        &self,
        operation_name: &str,
        operation: F,
        signal: &mut CancellationSignal,
    ) -> std::result::Result<OperationResult<T>, Cancelled>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = A>,
        A: IntoOperationResult<T>,
    {
        self.run(operation_name, operation, Some(signal)).await
    }

    async fn run<T, F, Fut, A>(
        &self,
        operation_name: &str,
        mut operation: F,
        mut signal: Option<&mut CancellationSignal>,
    ) -> std::result::Result<OperationResult<T>, Cancelled>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = A>,
        A: IntoOperationResult<T>,
    {
        let mut delay = self.initial_delay.min(self.max_delay);
        let mut exhausted = None;

        let max_attempts = u64::from(self.max_retries) + 1;

        for attempt in 0..=self.max_retries {
            let attempt_number = attempt.saturating_add(1);
            if signal.as_ref().map_or(false, |s| s.is_cancelled()) {
                return Err(self.cancelled(operation_name, attempt));
            }

            let result = tokio::select! {
                biased;
                _ = wait_cancelled(&mut signal) => return Err(self.cancelled(operation_name, attempt_number)),
                result = run_attempt(operation()) => result,
            };

            let fault = match result.error() {
                None => {
                    if attempt > 0 {
                        info!(operation = %operation_name, attempts = attempt_number, "Operation succeeded after retry");
                        return Ok(result.with_metadata("attempts", attempt_number));
                    }
                    return Ok(result);
                }
                Some(fault) => fault,
            };

            if self.record_metrics {
                counter!("resilience.retry.failed_attempts", 1, "operation" => operation_name.to_string(), "category" => fault.category().as_str());
            }

            if !self.should_retry(fault) {
                debug!(
                    operation = %operation_name,
                    attempt = attempt_number,
                    category = %fault.category(),
                    severity = %fault.severity(),
                    "Terminal failure, not retrying"
                );
                return Ok(result);
            }

            if attempt == self.max_retries {
                exhausted = Some(result);
                break;
            }

            let wait = self.wait_for(fault, delay);
            warn!(
                operation = %operation_name,
                attempt = attempt_number,
                max_attempts,
                delay_ms = wait.as_millis() as u64,
                category = %fault.category(),
                error = %fault.message(),
                "Attempt failed, retrying"
            );
            if let Some(observer) = &self.observer {
                observer(attempt_number, fault, wait);
            }
            if self.record_metrics {
                counter!("resilience.retry.retries", 1, "operation" => operation_name.to_string());
            }

            tokio::select! {
                biased;
                _ = wait_cancelled(&mut signal) => return Err(self.cancelled(operation_name, attempt_number)),
                _ = sleep(wait) => {}
            }

            delay = self.next_delay(delay);
        }

        let total_attempts = max_attempts;
        if self.record_metrics {
            counter!("resilience.retry.exhausted", 1, "operation" => operation_name.to_string());
        }

        let result = match exhausted {
            Some(result) => {
                warn!(operation = %operation_name, total_attempts, "Retries exhausted");
                result
            }
            None => OperationResult::fail(FaultInfo::new(
                FaultCategory::Unknown,
                FaultSeverity::Fatal,
                format!("{} ran no attempts", operation_name),
            )),
        };

        Ok(result
            .with_metadata("retries_exhausted", true)
            .with_metadata("total_attempts", total_attempts))
    }

    fn cancelled(&self, operation_name: &str, attempts_started: u32) -> Cancelled {
        info!(operation = %operation_name, attempts_started, "Operation cancelled");
        if self.record_metrics {
            counter!("resilience.retry.cancelled", 1, "operation" => operation_name.to_string());
        }
        Cancelled { attempts_started }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        let config = RetryConfig::default();
        Self {
            max_retries: config.max_retries,
            initial_delay: Duration::from_secs_f64(config.initial_delay_secs),
            max_delay: Duration::from_secs_f64(config.max_delay_secs),
            backoff_factor: config.backoff_factor,
            jitter_factor: config.jitter_factor,
            retry_bad_requests: config.retry_bad_requests,
            record_metrics: config.record_metrics,
            observer: None,
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_factor", &self.backoff_factor)
            .field("jitter_factor", &self.jitter_factor)
            .field("retry_bad_requests", &self.retry_bad_requests)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

impl TryFrom<RetryConfig> for RetryPolicy {
    type Error = Error;

    fn try_from(config: RetryConfig) -> Result<Self> {
        Self::new(config)
    }
}

/// Retries an operation with the default backoff
pub async fn retry<T, F, Fut, A>(operation_name: &str, max_retries: u32, operation: F) -> OperationResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = A>,
    A: IntoOperationResult<T>,
{
    RetryPolicy::default()
        .with_max_retries(max_retries)
        .execute(operation_name, operation)
        .await
}

pub(crate) async fn run_attempt<T, Fut, A>(attempt: Fut) -> OperationResult<T>
where
    Fut: Future<Output = A>,
    A: IntoOperationResult<T>,
{
    match AssertUnwindSafe(attempt).catch_unwind().await {
        Ok(outcome) => outcome.into_operation_result(),
        Err(payload) => {
            let fault = classify_message(&format!("operation panicked: {}", panic_message(payload.as_ref())));
            OperationResult::fail(fault)
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

async fn wait_cancelled(signal: &mut Option<&mut CancellationSignal>) {
    match signal {
        Some(signal) => signal.cancelled().await,
        None => futures::future::pending().await,
    }
}

/// The operation was cancelled before it completed
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation cancelled after {attempts_started} attempt(s) started")]
pub struct Cancelled {
    pub attempts_started: u32,
}

/// Triggers cancellation of every paired [`CancellationSignal`]
#[derive(Debug, Clone)]
pub struct CancellationHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl CancellationHandle {
    pub fn cancel(&self) {
        let _ = self.sender.send(true);
    }
}

/// Observes cancellation requested through a [`CancellationHandle`]
#[derive(Debug, Clone)]
pub struct CancellationSignal {
    receiver: watch::Receiver<bool>,
}

impl CancellationSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once cancellation is requested; never resolves if every
    /// handle is dropped first.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.receiver.borrow() {
                return;
            }
            if self.receiver.changed().await.is_err() {
                futures::future::pending::<()>().await;
            }
        }
    }
}

/// Creates a connected handle and signal
pub fn cancellation() -> (CancellationHandle, CancellationSignal) {
    let (sender, receiver) = watch::channel(false);
    (
        CancellationHandle {
            sender: Arc::new(sender),
        },
        CancellationSignal { receiver },
    )
}

/// A signal that fires on Ctrl-C. Must be called inside a Tokio runtime.
pub fn interrupt_signal() -> CancellationSignal {
    let (handle, signal) = cancellation();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, cancelling pending operations");
                handle.cancel();
            }
            Err(err) => warn!(error = %err, "Could not listen for interrupt"),
        }
    });
    signal
}
