//! Quota observation: the storage state machine driven by used percent,
//! with a short-lived metrics cache and a conservative fallback when the
//! platform exposes no quota API.

use std::sync::Arc;
use std::time::{Duration, Instant};

use config::StorageConfig;
use ct_core::traits::QuotaProbe;
use ct_core::types::StorageState;
use serde::{Deserialize, Serialize};
use store::OfflineStore;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::StorageResult;

/// Which download tiers the current band admits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllowedDownloads {
    All,
    Tier1And2,
    Tier1Only,
}

/// One observation of storage usage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageMetrics {
    pub used_bytes: u64,
    pub total_bytes: u64,
    pub percent: f64,
    pub state: StorageState,
    /// True when the platform quota API was unavailable and the figures
    /// come from the fallback estimator.
    pub estimated: bool,
}

impl StorageMetrics {
    #[must_use]
    pub fn writes_allowed(&self) -> bool {
        self.state.writes_allowed()
    }
}

pub struct StorageMonitor {
    store: OfflineStore,
    probe: Option<Arc<dyn QuotaProbe>>,
    config: StorageConfig,
    cache: RwLock<Option<(StorageMetrics, Instant)>>,
}

impl StorageMonitor {
    #[must_use]
    pub fn new(
        store: OfflineStore,
        probe: Option<Arc<dyn QuotaProbe>>,
        config: StorageConfig,
    ) -> Self {
        Self {
            store,
            probe,
            config,
            cache: RwLock::new(None),
        }
    }

    #[must_use]
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Current metrics, cached for the configured TTL.
    pub async fn metrics(&self) -> StorageResult<StorageMetrics> {
        let ttl = Duration::from_secs(self.config.metrics_ttl_secs);
        {
            let cache = self.cache.read().await;
            if let Some((metrics, measured_at)) = cache.as_ref()
                && measured_at.elapsed() < ttl
            {
                return Ok(*metrics);
            }
        }

        let metrics = self.measure().await?;
        *self.cache.write().await = Some((metrics, Instant::now()));
        Ok(metrics)
    }

    /// Drop the cached observation so the next read re-measures.
    pub async fn invalidate(&self) {
        *self.cache.write().await = None;
    }

    pub async fn state(&self) -> StorageResult<StorageState> {
        Ok(self.metrics().await?.state)
    }

    /// Download admission for the current band.
    pub async fn allowed_downloads(&self) -> StorageResult<AllowedDownloads> {
        let metrics = self.metrics().await?;
        Ok(self.downloads_for_percent(metrics.percent))
    }

    #[must_use]
    pub fn downloads_for_percent(&self, percent: f64) -> AllowedDownloads {
        if percent >= self.config.tier2_purge_percent {
            AllowedDownloads::Tier1Only
        } else if percent >= self.config.purging_percent {
            AllowedDownloads::Tier1And2
        } else {
            AllowedDownloads::All
        }
    }

    /// Band for a percent, using the configured thresholds.
    #[must_use]
    pub fn state_for_percent(&self, percent: f64) -> StorageState {
        if percent >= self.config.emergency_percent {
            StorageState::Emergency
        } else if percent >= self.config.purging_percent {
            StorageState::Purging
        } else if percent >= self.config.warning_percent {
            StorageState::Warning
        } else {
            StorageState::Normal
        }
    }

    async fn measure(&self) -> StorageResult<StorageMetrics> {
        if let Some(probe) = &self.probe
            && let Some(estimate) = probe.estimate().await
        {
            let percent = estimate.percent();
            return Ok(StorageMetrics {
                used_bytes: estimate.used_bytes,
                total_bytes: estimate.total_bytes,
                percent,
                state: self.state_for_percent(percent),
                estimated: false,
            });
        }

        // No platform quota API: walk the store against the conservative
        // fallback budget.
        let used = self.store.estimated_size_bytes().await?;
        let total = self.config.fallback_quota_bytes;
        let percent = if total == 0 {
            0.0
        } else {
            (used as f64 / total as f64) * 100.0
        };
        debug!(used, total, percent, "Storage measured via fallback estimator");
        Ok(StorageMetrics {
            used_bytes: used,
            total_bytes: total,
            percent,
            state: self.state_for_percent(percent),
            estimated: true,
        })
    }
}
