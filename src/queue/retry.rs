// Exponential backoff for failed publish attempts
//
// - delay = min(backoff_base * 2^attempts, backoff_max)
// - give up once attempts reaches max_retries
// - optional ±20% jitter, off by default so schedules stay predictable

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Retry policy for the dispatcher
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Failed attempts after which an item is marked failed (default 5)
    pub max_retries: u32,
    /// Delay unit doubled per attempt (default 15s)
    pub backoff_base: Duration,
    /// Upper bound on a single delay (default 30min)
    pub backoff_max: Duration,
    /// Add ±20% jitter to each delay (default false)
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_base: Duration::from_secs(15),
            backoff_max: Duration::from_secs(30 * 60),
            jitter: false,
        }
    }
}

/// What to do after a failed attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue and try again after this delay
    Retry(Duration),
    /// Mark the item failed
    GiveUp,
}

/// Decide the follow-up for an item that has now failed `attempts` times
pub fn calculate_retry_delay(attempts: u32, config: &RetryConfig) -> RetryDecision {
    if attempts >= config.max_retries {
        debug!(attempts, max_retries = config.max_retries, "Retry budget exhausted");
        return RetryDecision::GiveUp;
    }

    let base_ms = config.backoff_base.as_millis() as u64;
    let max_ms = config.backoff_max.as_millis() as u64;

    let delay_ms = 2_u64
        .checked_pow(attempts)
        .map_or(u64::MAX, |factor| base_ms.saturating_mul(factor))
        .min(max_ms);

    let delay_ms = if config.jitter && delay_ms > 0 {
        let jitter = (delay_ms as f64 * 0.2) as u64;
        let mut rng = rand::rng();
        let offset = rng.random_range(0..=jitter);
        if rng.random_bool(0.5) {
            delay_ms.saturating_add(offset)
        } else {
            delay_ms.saturating_sub(offset)
        }
    } else {
        delay_ms
    };

    RetryDecision::Retry(Duration::from_millis(delay_ms))
}
