//! Engine configuration.
//!
//! Every engine tunable lives here, with its documented default. Values can be overridden from the environment
//! (`CT_SYNC_*` variables) or deserialized from a JSON blob shipped with
//! the app bundle.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry scheduling knobs for the operation queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Backoff base (milliseconds); delay is `base * 2^n` capped below.
    #[serde(default = "default_base_retry_delay_ms")]
    pub base_retry_delay_ms: u64,
    /// Backoff ceiling (milliseconds).
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    /// Attempts before an op fails terminally.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Below this battery percent, retries pause instead of scheduling.
    #[serde(default = "default_min_battery_for_retry")]
    pub min_battery_for_retry: u8,
}

fn default_base_retry_delay_ms() -> u64 {
    1000
}
fn default_max_retry_delay_ms() -> u64 {
    60_000
}
fn default_max_retries() -> u32 {
    5
}
fn default_min_battery_for_retry() -> u8 {
    15
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_retry_delay_ms: default_base_retry_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            max_retries: default_max_retries(),
            min_battery_for_retry: default_min_battery_for_retry(),
        }
    }
}

/// Delta-sync pagination and staleness knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaConfig {
    #[serde(default = "default_delta_batch_size")]
    pub default_batch_size: usize,
    /// Hard cap; requests above this are clamped.
    #[serde(default = "default_delta_max_batch_size")]
    pub max_batch_size: usize,
    /// Cursors older than this trigger a background resync.
    #[serde(default = "default_cursor_staleness_hours")]
    pub cursor_staleness_hours: u64,
}

fn default_delta_batch_size() -> usize {
    100
}
fn default_delta_max_batch_size() -> usize {
    500
}
fn default_cursor_staleness_hours() -> u64 {
    24
}

impl Default for DeltaConfig {
    fn default() -> Self {
        Self {
            default_batch_size: default_delta_batch_size(),
            max_batch_size: default_delta_max_batch_size(),
            cursor_staleness_hours: default_cursor_staleness_hours(),
        }
    }
}

impl DeltaConfig {
    #[must_use]
    pub fn staleness_window(&self) -> Duration {
        Duration::from_secs(self.cursor_staleness_hours * 3600)
    }

    /// Effective page size for a caller-requested limit.
    #[must_use]
    pub fn clamp_batch(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_batch_size)
            .min(self.max_batch_size)
            .max(1)
    }
}

/// Storage manager thresholds (quota percents) and cache TTLs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_warning_percent")]
    pub warning_percent: f64,
    #[serde(default = "default_purging_percent")]
    pub purging_percent: f64,
    /// Above this, Tier 2 is purged as well.
    #[serde(default = "default_tier2_purge_percent")]
    pub tier2_purge_percent: f64,
    #[serde(default = "default_emergency_percent")]
    pub emergency_percent: f64,
    /// Budget assumed when the platform quota API is unavailable.
    #[serde(default = "default_fallback_quota_bytes")]
    pub fallback_quota_bytes: u64,
    /// Metrics cache TTL (seconds).
    #[serde(default = "default_metrics_ttl_secs")]
    pub metrics_ttl_secs: u64,
}

fn default_warning_percent() -> f64 {
    80.0
}
fn default_purging_percent() -> f64 {
    90.0
}
fn default_tier2_purge_percent() -> f64 {
    95.0
}
fn default_emergency_percent() -> f64 {
    98.0
}
fn default_fallback_quota_bytes() -> u64 {
    50 * 1024 * 1024
}
fn default_metrics_ttl_secs() -> u64 {
    5
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            warning_percent: default_warning_percent(),
            purging_percent: default_purging_percent(),
            tier2_purge_percent: default_tier2_purge_percent(),
            emergency_percent: default_emergency_percent(),
            fallback_quota_bytes: default_fallback_quota_bytes(),
            metrics_ttl_secs: default_metrics_ttl_secs(),
        }
    }
}

/// Degraded-mode composition knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DegradedConfig {
    /// Queue depth at which the pressure warning fires.
    #[serde(default = "default_queue_pressure_threshold")]
    pub queue_pressure_threshold: u64,
    /// Composed-mode cache TTL (seconds).
    #[serde(default = "default_degraded_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Subscription poll cadence (seconds).
    #[serde(default = "default_degraded_poll_secs")]
    pub poll_interval_secs: u64,
}

fn default_queue_pressure_threshold() -> u64 {
    50
}
fn default_degraded_cache_ttl_secs() -> u64 {
    2
}
fn default_degraded_poll_secs() -> u64 {
    3
}

impl Default for DegradedConfig {
    fn default() -> Self {
        Self {
            queue_pressure_threshold: default_queue_pressure_threshold(),
            cache_ttl_secs: default_degraded_cache_ttl_secs(),
            poll_interval_secs: default_degraded_poll_secs(),
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub delta: DeltaConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub degraded: DegradedConfig,
    /// Ops drained per `sync()` invocation.
    #[serde(default = "default_sync_batch_size")]
    pub max_batch_size: usize,
    /// Background sync cadence (seconds).
    #[serde(default = "default_periodic_sync_secs")]
    pub periodic_sync_secs: u64,
    /// Error-log ring capacity.
    #[serde(default = "default_max_error_logs")]
    pub max_error_logs: usize,
}

fn default_sync_batch_size() -> usize {
    20
}
fn default_periodic_sync_secs() -> u64 {
    30
}
fn default_max_error_logs() -> usize {
    100
}

impl EngineConfig {
    /// Defaults with environment overrides applied. Unset or malformed
    /// variables fall back silently to the documented defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_u64("CT_SYNC_BASE_RETRY_DELAY_MS") {
            config.retry.base_retry_delay_ms = v;
        }
        if let Some(v) = env_u64("CT_SYNC_MAX_RETRY_DELAY_MS") {
            config.retry.max_retry_delay_ms = v;
        }
        if let Some(v) = env_u64("CT_SYNC_MAX_RETRIES") {
            config.retry.max_retries = v as u32;
        }
        if let Some(v) = env_u64("CT_SYNC_MIN_BATTERY_FOR_RETRY") {
            config.retry.min_battery_for_retry = v.min(100) as u8;
        }
        if let Some(v) = env_u64("CT_SYNC_MAX_BATCH_SIZE") {
            config.max_batch_size = v as usize;
        }
        if let Some(v) = env_u64("CT_SYNC_DELTA_BATCH_SIZE") {
            config.delta.default_batch_size = v as usize;
        }
        if let Some(v) = env_u64("CT_SYNC_PERIODIC_SECS") {
            config.periodic_sync_secs = v;
        }
        config
    }

    #[must_use]
    pub fn periodic_interval(&self) -> Duration {
        Duration::from_secs(self.periodic_sync_secs)
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_documented_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.retry.base_retry_delay_ms, 1000);
        assert_eq!(config.retry.max_retry_delay_ms, 60_000);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.min_battery_for_retry, 15);
        assert_eq!(config.max_batch_size, 20);
        assert_eq!(config.delta.default_batch_size, 100);
        assert_eq!(config.delta.max_batch_size, 500);
        assert_eq!(config.delta.cursor_staleness_hours, 24);
        assert_eq!(config.storage.warning_percent, 80.0);
        assert_eq!(config.storage.purging_percent, 90.0);
        assert_eq!(config.storage.tier2_purge_percent, 95.0);
        assert_eq!(config.storage.emergency_percent, 98.0);
        assert_eq!(config.storage.fallback_quota_bytes, 50 * 1024 * 1024);
        assert_eq!(config.storage.metrics_ttl_secs, 5);
        assert_eq!(config.degraded.queue_pressure_threshold, 50);
        assert_eq!(config.degraded.cache_ttl_secs, 2);
        assert_eq!(config.degraded.poll_interval_secs, 3);
        assert_eq!(config.periodic_sync_secs, 30);
        assert_eq!(config.max_error_logs, 100);
    }

    #[test]
    fn test_empty_json_uses_defaults() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.max_batch_size, 20);
    }

    #[test]
    fn test_clamp_batch() {
        let delta = DeltaConfig::default();
        assert_eq!(delta.clamp_batch(None), 100);
        assert_eq!(delta.clamp_batch(Some(50)), 50);
        assert_eq!(delta.clamp_batch(Some(10_000)), 500);
        assert_eq!(delta.clamp_batch(Some(0)), 1);
    }

    #[test]
    fn test_partial_json_override() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"retry": {"maxRetries": 2}}"#).unwrap_or_default();
        // Field names are snake_case in config JSON; the camelCase key is
        // ignored and the default survives.
        assert_eq!(config.retry.max_retries, 5);

        let config: EngineConfig =
            serde_json::from_str(r#"{"retry": {"max_retries": 2}}"#).unwrap();
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.retry.base_retry_delay_ms, 1000);
    }
}
