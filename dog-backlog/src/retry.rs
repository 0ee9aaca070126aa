//! Bounded backoff schedules and transient-error retry.
//!
//! Two schedules are used: the replenisher backs off exponentially between
//! attempts, the worker backs off linearly between empty pulls. Both are
//! capped. Store calls are wrapped in [`retry_transient`], which retries only
//! errors classified as transient and gives up after a fixed attempt count.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::CoordResult;

/// `delay(n) = min(base * 2^n, cap)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub cap: Duration,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Delay after the zero-based `attempt`
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.cap)
            .min(self.cap)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

/// `delay(n) = min(step * n, cap)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearBackoff {
    pub step: Duration,
    pub cap: Duration,
}

impl LinearBackoff {
    pub fn new(step: Duration, cap: Duration) -> Self {
        Self { step, cap }
    }

    /// Delay after the `attempt`-th consecutive failure (one-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        self.step
            .checked_mul(attempt)
            .unwrap_or(self.cap)
            .min(self.cap)
    }
}

impl Default for LinearBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(10), Duration::from_secs(30))
    }
}

/// Attempt budget for transient store failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: ExponentialBackoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: ExponentialBackoff) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// Single attempt, no retry
    pub fn none() -> Self {
        Self::new(1, ExponentialBackoff::new(Duration::ZERO, Duration::ZERO))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            3,
            ExponentialBackoff::new(Duration::from_millis(500), Duration::from_secs(5)),
        )
    }
}

/// Run `op`, retrying transient failures up to the policy's attempt budget.
///
/// Non-transient errors and the last transient error are returned unchanged.
pub async fn retry_transient<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> CoordResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CoordResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt + 1 < max_attempts => {
                let delay = policy.backoff.delay(attempt);
                warn!(
                    operation = what,
                    attempt = attempt + 1,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "transient failure, retrying: {}",
                    err
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
