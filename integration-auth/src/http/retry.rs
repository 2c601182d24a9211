//! Bounded retry with exponential backoff around a single logical call.
//!
//! The executor knows nothing about brokers or AI providers. It only asks the
//! error whether it is transient: 429 and 5xx responses (and transport
//! failures) are retried, every other client error is returned immediately.

use std::fmt::Display;
use std::future::Future;
use std::time::{Duration, SystemTime};

use reqwest_retry::{RetryDecision, RetryPolicy, Retryable};
use tracing::{debug, warn};

/// Classification hook for errors passed through [`RetryExecutor`].
pub trait ClassifyRetry {
    fn classify(&self) -> Retryable;

    /// Delay requested by the server (`Retry-After`), if any.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Status-code rule: too-many-requests and server errors are transient.
pub fn classify_status(status: u16) -> Retryable {
    match status {
        429 | 500..=599 => Retryable::Transient,
        _ => Retryable::Fatal,
    }
}

/// Exponential backoff: attempt `n` waits `base_delay * 2^(n-1)` before the
/// next attempt, optionally capped.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Option<Duration>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Some(Duration::from_secs(30)),
        }
    }
}

impl BackoffPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: None,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Delay after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        self.cap(delay)
    }

    fn cap(&self, delay: Duration) -> Duration {
        match self.max_delay {
            Some(max) => delay.min(max),
            None => delay,
        }
    }
}

impl RetryPolicy for BackoffPolicy {
    fn should_retry(&self, _request_start_time: SystemTime, n_past_retries: u32) -> RetryDecision {
        let failed_attempt = n_past_retries + 1;
        if failed_attempt >= self.max_attempts {
            RetryDecision::DoNotRetry
        } else {
            RetryDecision::Retry {
                execute_after: SystemTime::now() + self.delay_after(failed_attempt),
            }
        }
    }
}

/// Runs one logical call with bounded retries.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: BackoffPolicy,
}

impl RetryExecutor {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Call `operation` with the 1-based attempt number until it succeeds,
    /// fails with a fatal error, or attempts run out. The last error is
    /// returned unchanged.
    pub async fn run<T, E, F, Fut>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ClassifyRetry + Display,
    {
        let started = SystemTime::now();
        let mut attempt = 1;

        loop {
            let err = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if err.classify() == Retryable::Fatal {
                debug!("Attempt {} failed with non-retryable error: {}", attempt, err);
                return Err(err);
            }

            let execute_after = match self.policy.should_retry(started, attempt - 1) {
                RetryDecision::Retry { execute_after } => execute_after,
                RetryDecision::DoNotRetry => {
                    warn!("Giving up after {} attempts: {}", attempt, err);
                    return Err(err);
                }
            };

            let backoff = execute_after
                .duration_since(SystemTime::now())
                .unwrap_or_default();
            let delay = match err.retry_after() {
                Some(requested) if requested > backoff => self.policy.cap(requested),
                _ => backoff,
            };

            debug!(
                "Attempt {} failed with transient error ({}), retrying in {:?}",
                attempt, err, delay
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
