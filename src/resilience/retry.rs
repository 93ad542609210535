//! Retry logic with exponential backoff, jitter and a per-attempt timeout.

use crate::errors::{AttemptError, ConfigurationError};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    pub max_attempts: u32,
    /// Delay before the second attempt
    #[serde(rename = "base_delay_ms", with = "crate::config::duration_format::millis")]
    pub base_delay: Duration,
    /// Upper bound on the nominal delay
    #[serde(rename = "max_delay_ms", with = "crate::config::duration_format::millis")]
    pub max_delay: Duration,
    /// Growth factor between consecutive delays
    pub backoff_multiplier: f64,
    /// Fraction of the delay that is randomized (0.0 to 1.0)
    pub jitter_factor: f64,
    /// Time allowed for each attempt
    #[serde(rename = "timeout_ms", with = "crate::config::duration_format::millis")]
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum attempts
    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    /// Set base delay
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set maximum delay
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier
    pub fn backoff_multiplier(mut self, m: f64) -> Self {
        self.backoff_multiplier = m;
        self
    }

    /// Set jitter factor
    pub fn jitter_factor(mut self, jitter: f64) -> Self {
        self.jitter_factor = jitter;
        self
    }

    /// Set per-attempt timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Managed database: fast, many attempts
    pub fn database() -> Self {
        Self::new()
            .max_attempts(5)
            .base_delay(Duration::from_millis(500))
            .max_delay(Duration::from_secs(15))
            .timeout(Duration::from_secs(8))
    }

    /// Legacy document service: slow responses, few attempts
    pub fn document_service() -> Self {
        Self::new()
            .max_attempts(3)
            .base_delay(Duration::from_secs(1))
            .max_delay(Duration::from_secs(10))
            .timeout(Duration::from_secs(15))
    }

    /// Messaging API
    pub fn messaging() -> Self {
        Self::new()
            .max_attempts(3)
            .base_delay(Duration::from_secs(2))
            .max_delay(Duration::from_secs(20))
            .timeout(Duration::from_secs(12))
    }

    /// Validate the policy
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_attempts == 0 {
            return Err(ConfigurationError::invalid(
                "retry max_attempts must be at least 1",
            ));
        }
        if !(self.backoff_multiplier >= 1.0) {
            return Err(ConfigurationError::invalid(
                "retry backoff_multiplier must be at least 1.0",
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigurationError::invalid(
                "retry jitter_factor must be within 0.0..=1.0",
            ));
        }
        if self.timeout.is_zero() {
            return Err(ConfigurationError::invalid("retry timeout must be positive"));
        }
        Ok(())
    }

    /// Delay before the attempt following `attempt`, without jitter
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let delay_ms = self.base_delay.as_secs_f64()
            * 1000.0
            * self.backoff_multiplier.powi(exponent);
        let capped_ms = delay_ms.min(self.max_delay.as_secs_f64() * 1000.0);
        Duration::try_from_secs_f64(capped_ms.max(0.0) / 1000.0).unwrap_or(self.max_delay)
    }

    /// Delay before the attempt following `attempt`, with symmetric jitter
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        let nominal_ms = nominal.as_secs_f64() * 1000.0;
        let jitter_ms = nominal_ms * self.jitter_factor * (rand::random::<f64>() - 0.5);
        Duration::try_from_secs_f64((nominal_ms + jitter_ms).max(0.0) / 1000.0).unwrap_or(nominal)
    }
}

/// Outcome of a retried operation
#[derive(Debug)]
pub struct RetryResult<T, E> {
    /// Value of the successful attempt, or the last attempt's error
    pub outcome: Result<T, AttemptError<E>>,
    /// Attempts made
    pub attempts: u32,
    /// Time from the first attempt to the outcome
    pub total_time: Duration,
}

impl<T, E> RetryResult<T, E> {
    /// Whether an attempt succeeded
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// Discard the attempt bookkeeping
    pub fn into_result(self) -> Result<T, AttemptError<E>> {
        self.outcome
    }
}

/// Decides whether a failed attempt is worth repeating
pub trait RetryPredicate<E>: Send + Sync {
    /// Whether to retry after `error`
    fn should_retry(&self, error: &AttemptError<E>) -> bool;
}

impl<E, F> RetryPredicate<E> for F
where
    F: Fn(&AttemptError<E>) -> bool + Send + Sync,
{
    fn should_retry(&self, error: &AttemptError<E>) -> bool {
        self(error)
    }
}

/// Retry every failure
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysRetry;

impl<E> RetryPredicate<E> for AlwaysRetry {
    fn should_retry(&self, _error: &AttemptError<E>) -> bool {
        true
    }
}

/// Markers matched by [`TransientNetworkErrors::default`]
pub const DEFAULT_TRANSIENT_MARKERS: &[&str] = &[
    "ECONNRESET",
    "ECONNREFUSED",
    "ETIMEDOUT",
    "ENOTFOUND",
    "ENETUNREACH",
    "ECONNABORTED",
    "Operation timeout",
];

/// Retry errors whose message names a transient network condition.
///
/// Attempt timeouts always qualify.
#[derive(Debug, Clone)]
pub struct TransientNetworkErrors {
    markers: Vec<String>,
}

impl TransientNetworkErrors {
    /// Match against a custom set of markers
    pub fn with_markers<I, S>(markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            markers: markers.into_iter().map(Into::into).collect(),
        }
    }

    /// Markers in use
    pub fn markers(&self) -> &[String] {
        &self.markers
    }
}

impl Default for TransientNetworkErrors {
    fn default() -> Self {
        Self::with_markers(DEFAULT_TRANSIENT_MARKERS.iter().copied())
    }
}

impl<E: Display> RetryPredicate<E> for TransientNetworkErrors {
    fn should_retry(&self, error: &AttemptError<E>) -> bool {
        match error {
            AttemptError::Timeout(_) => true,
            AttemptError::Operation(error) => {
                let message = error.to_string();
                self.markers.iter().any(|marker| message.contains(marker.as_str()))
            }
        }
    }
}

/// Retry I/O errors of selected kinds.
///
/// Attempt timeouts always qualify.
#[derive(Debug, Clone)]
pub struct IoErrorKinds {
    kinds: Vec<io::ErrorKind>,
}

impl IoErrorKinds {
    /// Retry the given kinds
    pub fn new(kinds: impl IntoIterator<Item = io::ErrorKind>) -> Self {
        Self {
            kinds: kinds.into_iter().collect(),
        }
    }
}

impl Default for IoErrorKinds {
    fn default() -> Self {
        Self::new([
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionRefused,
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::NotConnected,
            io::ErrorKind::AddrNotAvailable,
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::TimedOut,
        ])
    }
}

impl RetryPredicate<io::Error> for IoErrorKinds {
    fn should_retry(&self, error: &AttemptError<io::Error>) -> bool {
        match error {
            AttemptError::Timeout(_) => true,
            AttemptError::Operation(error) => self.kinds.contains(&error.kind()),
        }
    }
}

/// Run `operation` under `policy`, retrying every failure
pub async fn execute_with_retry<F, Fut, T, E>(
    operation: F,
    policy: &RetryPolicy,
) -> RetryResult<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    execute_with_retry_on_error(operation, policy, &AlwaysRetry).await
}

/// Run `operation` under `policy`, stopping early when `predicate` rejects
/// an error
pub async fn execute_with_retry_on_error<F, Fut, T, E, P>(
    mut operation: F,
    policy: &RetryPolicy,
    predicate: &P,
) -> RetryResult<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    P: RetryPredicate<E> + ?Sized,
{
    let started = Instant::now();
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        let error = match tokio::time::timeout(policy.timeout, operation()).await {
            Ok(Ok(value)) => {
                if attempt > 1 {
                    debug!(attempt, "Operation succeeded after retry");
                }
                return RetryResult {
                    outcome: Ok(value),
                    attempts: attempt,
                    total_time: started.elapsed(),
                };
            }
            Ok(Err(error)) => AttemptError::Operation(error),
            Err(_) => AttemptError::Timeout(policy.timeout),
        };

        let retryable = predicate.should_retry(&error);
        if attempt >= max_attempts || !retryable {
            warn!(
                attempts = attempt,
                max_attempts,
                retryable,
                error = %error,
                "Operation failed permanently"
            );
            return RetryResult {
                outcome: Err(error),
                attempts: attempt,
                total_time: started.elapsed(),
            };
        }

        let delay = policy.delay_for_attempt(attempt);
        debug!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Retrying after failed attempt"
        );
        tokio::time::sleep(delay).await;
    }
}

/// Retry executor bound to one validated policy
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    /// Create an executor
    pub fn new(policy: RetryPolicy) -> Result<Self, ConfigurationError> {
        policy.validate()?;
        Ok(Self { policy })
    }

    /// Policy in effect
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run with retries on every failure
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> RetryResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        execute_with_retry(operation, &self.policy).await
    }

    /// Run with retries filtered by `predicate`
    pub async fn execute_on_error<F, Fut, T, E, P>(
        &self,
        operation: F,
        predicate: &P,
    ) -> RetryResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        P: RetryPredicate<E> + ?Sized,
    {
        execute_with_retry_on_error(operation, &self.policy, predicate).await
    }
}
