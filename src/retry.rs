//! Retry, backoff, and timeout utilities.
//!
//! The helpers in this module are transport-agnostic. `RetryPolicy` drives
//! bounded retries for one-shot REST requests, and `ReconnectBackoff` computes
//! the delay schedule used by long-lived stream connections.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;

/// Policy controlling retry attempts and exponential backoff behavior.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Maximum number of attempts including the first attempt.
    pub max_attempts: usize,
    /// Delay used before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for exponential backoff delay growth.
    pub max_backoff: Duration,
    /// Maximum random jitter added to each retry delay.
    pub jitter: Duration,
}

impl RetryPolicy {
    /// Returns a low-latency default suitable for short-lived API requests.
    pub fn low_latency() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(800),
            jitter: Duration::from_millis(50),
        }
    }

    /// Computes the delay to apply before the given retry attempt.
    ///
    /// `attempt` is 1-based and should correspond to the current attempt index.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        exponential_delay(self.initial_backoff, self.max_backoff, attempt)
            + jitter_duration(self.jitter, attempt as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::low_latency()
    }
}

/// Reconnect delay schedule for stream connections.
///
/// The delay doubles per attempt from `base` and is capped at `max`. Jitter is
/// bounded by `base` so the schedule stays non-decreasing across attempts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectBackoff {
    /// Delay before the first reconnect attempt.
    pub base: Duration,
    /// Upper bound for any reconnect delay, jitter included.
    pub max: Duration,
    /// Maximum random jitter added to each delay.
    pub jitter: Duration,
}

impl ReconnectBackoff {
    /// Delay for the given zero-based reconnect attempt, without jitter.
    pub fn base_delay(&self, reconnect_attempt: u32) -> Duration {
        exponential_delay(self.base, self.max, reconnect_attempt as usize + 1)
    }

    /// Delay for the given zero-based reconnect attempt, jitter included.
    pub fn delay(&self, reconnect_attempt: u32) -> Duration {
        let jitter = jitter_duration(self.jitter.min(self.base), u64::from(reconnect_attempt));
        std::cmp::min(self.base_delay(reconnect_attempt) + jitter, self.max)
    }

    /// Delay honoring a backend supplied retry-after hint.
    pub fn delay_with_hint(&self, reconnect_attempt: u32, retry_after: Option<Duration>) -> Duration {
        let delay = self.delay(reconnect_attempt);
        match retry_after {
            Some(hint) => delay.max(hint),
            None => delay,
        }
    }
}

/// Executes an async operation with retry behavior controlled by `policy`.
///
/// `op` receives the 1-based attempt number and must return a future that
/// resolves to the operation result. `should_retry` determines whether each
/// error is retryable. `retry_after` may supply a backend hint that extends
/// the computed delay.
pub async fn retry_async<T, E, Op, Fut, ShouldRetry, RetryAfter>(
    policy: &RetryPolicy,
    mut op: Op,
    mut should_retry: ShouldRetry,
    mut retry_after: RetryAfter,
) -> Result<T, E>
where
    Op: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    ShouldRetry: FnMut(&E) -> bool,
    RetryAfter: FnMut(&E) -> Option<Duration>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt >= max_attempts || !should_retry(&error) {
                    return Err(error);
                }

                let mut delay = policy.delay_for_attempt(attempt);
                if let Some(hint) = retry_after(&error) {
                    delay = delay.max(hint);
                }
                debug!(
                    event = "retry_attempt_failed",
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}

/// Applies a timeout to an async computation.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}

fn exponential_delay(initial: Duration, max: Duration, attempt: usize) -> Duration {
    let mut delay = std::cmp::min(initial, max);
    for _ in 1..attempt {
        if delay >= max {
            break;
        }
        delay = std::cmp::min(delay.saturating_mul(2), max);
    }
    delay
}

fn jitter_duration(max_jitter: Duration, salt: u64) -> Duration {
    if max_jitter.is_zero() {
        return Duration::ZERO;
    }

    let limit_nanos = max_jitter.as_nanos().min(u64::MAX as u128) as u64;
    if limit_nanos == 0 {
        return Duration::ZERO;
    }

    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let mixed = now_nanos ^ salt.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    Duration::from_nanos(mixed % (limit_nanos + 1))
}
