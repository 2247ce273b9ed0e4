//! Bounded exponential backoff for rate-limited and transient provider failures.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::ProviderError;

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
        }
    }
}

/// Wait before retry number `attempt + 1`.
///
/// The exponential step `base * 2^attempt` is capped at `max_delay_ms`; half of it is
/// fixed and the other half scaled by `jitter` (expected in `[0, 1)`), so the delay grows
/// strictly with `attempt` until the cap is reached.
pub fn backoff_delay(attempt: u32, policy: &RetryPolicy, jitter: f64) -> Duration {
    let step = policy
        .base_delay_ms
        .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX))
        .min(policy.max_delay_ms);
    let jitter = jitter.clamp(0.0, 1.0);
    let half = step / 2;
    let spread = ((step - half) as f64 * jitter) as u64;
    Duration::from_millis(half + spread)
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the policy's
/// attempts are used up. The last error is returned unchanged.
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt + 1 < max_attempts => {
                let delay = backoff_delay(attempt, policy, rand::random::<f64>());
                warn!(
                    "{} failed ({}), attempt {}/{}, retrying in {:.1}s",
                    what,
                    e,
                    attempt + 1,
                    max_attempts,
                    delay.as_secs_f64()
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
