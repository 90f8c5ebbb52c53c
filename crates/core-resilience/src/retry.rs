//! Retry with exponential backoff, jitter and cancellation
//!
//! The policy itself knows nothing about backends. Each call supplies a
//! classifier that maps the backend's error type to [`ErrorClass`]; only
//! `Transient` errors are retried.
//!
//! Waits between attempts are async sleeps raced against a
//! [`CancellationToken`]. Cancellation aborts the wait immediately and
//! surfaces as [`RetryError::Cancelled`], distinct from exhaustion. An
//! in-flight attempt is never aborted.
//!
//! # Example
//!
//! ```no_run
//! use busguard_core_resilience::retry::{ErrorClass, RetryConfig, RetryPolicy};
//! use busguard_core_resilience::{ResilienceError, RetryError};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), RetryError<ResilienceError>> {
//! let policy = RetryPolicy::new(RetryConfig::default());
//! let cancel = CancellationToken::new();
//!
//! let value = policy
//!     .execute(
//!         "orders/order-created",
//!         &cancel,
//!         |_ctx| async { Ok::<_, ResilienceError>(42) },
//!         &|e: &ResilienceError| {
//!             if e.is_transient() {
//!                 ErrorClass::Transient
//!             } else {
//!                 ErrorClass::Fatal
//!             }
//!         },
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

use crate::error::RetryError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Outcome of classifying an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    /// Expected to clear up on retry
    Transient,
    /// Retrying cannot help
    Fatal,
}

impl Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::Fatal => write!(f, "fatal"),
        }
    }
}

/// Maps a backend error to retryable or not
pub trait Classify<E>: Send + Sync {
    fn classify(&self, error: &E) -> ErrorClass;
}

impl<E, F> Classify<E> for F
where
    F: Fn(&E) -> ErrorClass + Send + Sync,
{
    fn classify(&self, error: &E) -> ErrorClass {
        self(error)
    }
}

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries after the initial attempt (total attempts = max_retries + 1)
    pub max_retries: u32,

    /// Delay before the first retry
    pub initial_delay: Duration,

    /// Ceiling for any single wait, jitter included
    pub max_delay: Duration,

    /// Growth factor applied per attempt
    pub backoff_multiplier: f64,

    /// Jitter factor (0.0-1.0), as a fraction of the computed delay
    pub jitter_factor: f64,

    /// Kill switch: a disabled policy makes exactly one attempt
    pub is_disabled: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.3,
            is_disabled: false,
        }
    }
}

impl RetryConfig {
    /// Create a policy for fast retries (in-process or loopback backends)
    pub fn fast() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            ..Default::default()
        }
    }

    /// Create a policy for network-flaky scenarios
    pub fn network() -> Self {
        Self {
            max_retries: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.5,
            ..Default::default()
        }
    }

    /// Total attempts this configuration allows
    pub fn max_attempts(&self) -> u32 {
        if self.is_disabled {
            1
        } else {
            self.max_retries.saturating_add(1)
        }
    }
}

/// Correlates the attempts belonging to one logical operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryContext {
    pub operation_key: String,
    /// 1-based attempt number
    pub attempt: u32,
}

impl RetryContext {
    pub fn new(operation_key: impl Into<String>, attempt: u32) -> Self {
        Self {
            operation_key: operation_key.into(),
            attempt,
        }
    }
}

/// Telemetry sink notified before every retry wait
pub trait RetryObserver: Send + Sync {
    fn on_retry(&self, error: &dyn Display, delay: Duration, context: &RetryContext);
}

/// Default observer: one structured `warn!` per retry
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRetryObserver;

impl RetryObserver for TracingRetryObserver {
    fn on_retry(&self, error: &dyn Display, delay: Duration, context: &RetryContext) {
        warn!(
            operation = %context.operation_key,
            attempt = context.attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "transient failure, retrying"
        );
    }
}

/// Retry executor: backoff schedule plus telemetry sink
#[derive(Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    observer: Arc<dyn RetryObserver>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            observer: Arc::new(TracingRetryObserver),
        }
    }

    /// A policy that never retries
    pub fn disabled() -> Self {
        Self::new(RetryConfig {
            is_disabled: true,
            ..Default::default()
        })
    }

    /// Replace the telemetry sink
    pub fn with_observer(mut self, observer: Arc<dyn RetryObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Calculate the wait before retry number `attempt` (1-based)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.config.initial_delay.as_secs_f64()
            * self.config.backoff_multiplier.max(1.0).powi(exponent);
        let max = self.config.max_delay.as_secs_f64();
        let capped = if base.is_finite() { base.min(max) } else { max };

        let jittered = if self.config.jitter_factor > 0.0 {
            let jitter = rand::rng().random_range(0.0..self.config.jitter_factor);
            capped + capped * jitter
        } else {
            capped
        };

        Duration::from_secs_f64(jittered.min(max))
    }

    /// Run `operation` until it succeeds, fails fatally, runs out of
    /// attempts, or `cancel` fires.
    pub async fn execute<T, E, F, Fut, C>(
        &self,
        operation_key: &str,
        cancel: &CancellationToken,
        mut operation: F,
        classifier: &C,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(RetryContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        C: Classify<E> + ?Sized,
    {
        let max_attempts = self.config.max_attempts();
        let mut last_error: Option<E> = None;
        let mut attempt = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled {
                    attempts: attempt,
                    last: last_error,
                });
            }

            attempt += 1;
            let context = RetryContext::new(operation_key, attempt);

            let error = match operation(context.clone()).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            match classifier.classify(&error) {
                ErrorClass::Fatal => {
                    return Err(RetryError::Fatal {
                        attempts: attempt,
                        error,
                    })
                }
                ErrorClass::Transient if attempt >= max_attempts => {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: error,
                    })
                }
                ErrorClass::Transient => {
                    let delay = self.calculate_delay(attempt);
                    self.observer.on_retry(&error, delay, &context);
                    last_error = Some(error);

                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(RetryError::Cancelled {
                                attempts: attempt,
                                last: last_error,
                            });
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
