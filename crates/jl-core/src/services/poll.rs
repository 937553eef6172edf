use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{ClusterError, Result};
use crate::models::config::RetryConfig;

/// Exponential delay schedule: `initial`, `initial * factor`, ... capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub factor: u32,
}

impl Backoff {
    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            factor: 2,
        }
    }

    pub fn fixed(interval: Duration) -> Self {
        Self {
            initial: interval,
            max: interval,
            factor: 1,
        }
    }

    /// Delay before retry number `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let multiplier = self.factor.saturating_pow(attempt.min(31));
        self.initial.saturating_mul(multiplier).min(self.max)
    }
}

/// How long and how often to probe for a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub backoff: Backoff,
    pub timeout: Duration,
}

impl PollPolicy {
    pub fn new(backoff: Backoff, timeout: Duration) -> Self {
        Self { backoff, timeout }
    }

    /// 1s, 2s, 4s, ... capped at 8s.
    pub fn readiness(timeout: Duration) -> Self {
        Self::new(
            Backoff::exponential(Duration::from_secs(1), Duration::from_secs(8)),
            timeout,
        )
    }
}

/// Run `probe` until it yields `Some`, or give up with `None` once the policy
/// timeout has elapsed. The probe always runs at least once.
pub async fn poll_until<T, F, Fut>(policy: PollPolicy, mut probe: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = Instant::now() + policy.timeout;
    let mut attempt = 0u32;
    loop {
        if let Some(value) = probe().await {
            return Some(value);
        }
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        let delay = policy.backoff.delay(attempt).min(deadline - now);
        tokio::time::sleep(delay).await;
        attempt = attempt.saturating_add(1);
    }
}

/// Bounded retry for calls whose failures may be transient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: Backoff::exponential(
                Duration::from_millis(config.initial_backoff_ms),
                Duration::from_secs(config.max_backoff_secs),
            ),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

/// Retry `op` while it fails transiently. Non-transient errors return
/// immediately; exhausting the attempts escalates to `OperationFailed`.
pub async fn retry_transient<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => {
                if attempt >= policy.max_attempts {
                    tracing::warn!(operation, attempt, error = %e, "giving up after transient failures");
                    return Err(ClusterError::OperationFailed {
                        operation: operation.to_string(),
                        attempts: attempt,
                        last_error: e.to_string(),
                    });
                }
                let delay = policy.backoff.delay(attempt - 1);
                tracing::debug!(operation, attempt, ?delay, error = %e, "transient failure, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
