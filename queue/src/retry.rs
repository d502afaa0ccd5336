//! Retry scheduling: exponential backoff with jitter, the 4xx non-retry
//! policy and the low-battery gate.

use chrono::{DateTime, Duration, Utc};
use config::RetryConfig;
use rand::Rng;

/// Client-error codes that never retry. Every code in `[400, 500)` is
/// non-retryable; these are the ones the server is known to emit.
pub const NON_RETRYABLE_CODES: [u16; 6] = [400, 401, 403, 404, 409, 422];

/// What the scheduler decided for a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry later; `failed` with a deadline.
    Schedule { next_retry_at: DateTime<Utc> },
    /// Terminal failure; `failed` with no deadline.
    Terminal,
    /// Battery below the floor; parked until a later sync cycle finds
    /// the device charged.
    PausedLowBattery,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Whether an error code allows another attempt. Transport-level
    /// failures arrive as `None` and always retry.
    #[must_use]
    pub fn is_retryable(code: Option<u16>) -> bool {
        match code {
            Some(code) => !(400..500).contains(&code) && !NON_RETRYABLE_CODES.contains(&code),
            None => true,
        }
    }

    /// Backoff for attempt `n` (0-based): `min(base * 2^n, max)` with
    /// symmetric ±10% jitter.
    #[must_use]
    pub fn delay_for_attempt(&self, retry_count: u32) -> Duration {
        let exp = self
            .config
            .base_retry_delay_ms
            .saturating_mul(2u64.saturating_pow(retry_count));
        let capped = exp.min(self.config.max_retry_delay_ms) as f64;
        let jitter = rand::thread_rng().gen_range(0.9..=1.1);
        Duration::milliseconds((capped * jitter).round() as i64)
    }

    /// Decision for a just-failed attempt. `retry_count` is the value
    /// after counting this attempt.
    #[must_use]
    pub fn decide(
        &self,
        retry_count: u32,
        error_code: Option<u16>,
        battery_percent: Option<u8>,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        if !Self::is_retryable(error_code) {
            return RetryDecision::Terminal;
        }
        if retry_count >= self.config.max_retries {
            return RetryDecision::Terminal;
        }
        if let Some(battery) = battery_percent
            && battery < self.config.min_battery_for_retry
        {
            return RetryDecision::PausedLowBattery;
        }
        RetryDecision::Schedule {
            next_retry_at: now + self.delay_for_attempt(retry_count),
        }
    }
}
