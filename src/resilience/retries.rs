//! Retry decorator for upstream dials.
//!
//! # Responsibilities
//! - Repeat a failed dial up to a bounded number of attempts
//! - Sleep with exponential backoff + jitter between attempts
//!
//! # Design Decisions
//! - Disabled policy means a single attempt
//! - Only dial-stage errors are retried; the request has not left the proxy yet
//! - Jittered backoff prevents thundering herd

use std::future::Future;

use crate::config::RetryConfig;
use crate::error::ProxyError;
use crate::resilience::backoff::calculate_backoff;

/// How many times, and how patiently, to repeat a failed dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    /// One attempt, no retries.
    pub const fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        if !config.enabled {
            return Self::single_attempt();
        }
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay_ms: config.base_delay_ms,
            max_delay_ms: config.max_delay_ms,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::single_attempt()
    }
}

/// Run `op` until it succeeds, fails with a non-dial error, or the policy is exhausted.
pub async fn with_retries<T, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, ProxyError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ProxyError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_dial_failure() && attempt < policy.max_attempts => {
                let delay = calculate_backoff(attempt, policy.base_delay_ms, policy.max_delay_ms);
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "Retrying dial");
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
