//! Tier eviction under storage pressure.
//!
//! Three invariants hold on every path: the operation queue is never
//! touched, Tier-1 data is never cleared, and a `pending_sync` delivery
//! is never deleted. `validate_eviction_safety` enforces them pre-flight
//! and every purge entry point consults it before deleting anything.

use chrono::Utc;
use ct_core::types::{DeliveryTier, RecordSyncStatus, StorageState};
use serde::{Deserialize, Serialize};
use store::OfflineStore;
use tracing::{info, warn};

use crate::error::{StorageError, StorageResult};
use crate::quota::StorageMonitor;

/// Stores that no eviction plan may clear.
pub const PROTECTED_STORES: [&str; 5] = [
    "ops_queue",
    "planteurs",
    "chef_planteurs",
    "warehouses",
    "sync_metadata",
];

/// A proposed eviction, validated before execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvictionPlan {
    pub stores_to_clear: Vec<String>,
    pub deliveries_to_delete: Vec<String>,
}

/// Pre-flight verdict on an eviction plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SafetyReport {
    pub safe: bool,
    pub violations: Vec<String>,
}

/// Check a plan against the eviction invariants.
pub async fn validate_eviction_safety(
    store: &OfflineStore,
    plan: &EvictionPlan,
) -> StorageResult<SafetyReport> {
    let mut violations = Vec::new();

    for name in &plan.stores_to_clear {
        if PROTECTED_STORES.contains(&name.as_str()) {
            violations.push(format!("store '{name}' is protected from eviction"));
        }
    }

    let deliveries = store.deliveries();
    for id in &plan.deliveries_to_delete {
        match deliveries.get(id).await? {
            Some(record) => {
                if record.status == RecordSyncStatus::PendingSync {
                    violations.push(format!("delivery '{id}' has unsynced local changes"));
                } else if record.tier == DeliveryTier::Tier1 {
                    violations.push(format!("delivery '{id}' is Tier 1 (delivered recently)"));
                }
            }
            None => {}
        }
    }

    Ok(SafetyReport {
        safe: violations.is_empty(),
        violations,
    })
}

/// Outcome of one cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupOutcome {
    pub deliveries_deleted: u64,
    pub error_logs_cleared: u64,
    pub bytes_freed: u64,
}

pub struct StorageManager {
    store: OfflineStore,
}

impl StorageManager {
    #[must_use]
    pub fn new(store: OfflineStore) -> Self {
        Self { store }
    }

    /// Purge evictable Tier-3 deliveries. Returns bytes freed.
    pub async fn purge_tier3(&self) -> StorageResult<CleanupOutcome> {
        self.purge_tier(DeliveryTier::Tier3).await
    }

    /// Purge evictable Tier-2 deliveries. Returns bytes freed.
    pub async fn purge_tier2(&self) -> StorageResult<CleanupOutcome> {
        self.purge_tier(DeliveryTier::Tier2).await
    }

    async fn purge_tier(&self, tier: DeliveryTier) -> StorageResult<CleanupOutcome> {
        let now = Utc::now();
        let deliveries = self.store.deliveries();
        deliveries.recompute_tiers(now).await?;

        let candidates = deliveries.evictable_ids(tier, now).await?;
        if candidates.is_empty() {
            return Ok(CleanupOutcome::default());
        }
        let plan = EvictionPlan {
            stores_to_clear: Vec::new(),
            deliveries_to_delete: candidates,
        };
        let report = validate_eviction_safety(&self.store, &plan).await?;
        if !report.safe {
            warn!(?report.violations, "Eviction plan rejected");
            return Err(StorageError::UnsafeEviction {
                violations: report.violations,
            });
        }

        let outcome = deliveries.purge_tier(tier, now).await?;
        Ok(CleanupOutcome {
            deliveries_deleted: outcome.rows_deleted,
            error_logs_cleared: 0,
            bytes_freed: outcome.bytes_freed,
        })
    }

    /// Tier 3, then Tier 2, then non-essential diagnostics data.
    pub async fn force_cleanup(&self) -> StorageResult<CleanupOutcome> {
        let tier3 = self.purge_tier3().await?;
        let tier2 = self.purge_tier2().await?;

        // Non-essential: drop the diagnostics ring (ops_queue and every
        // Tier-1 store stay untouched).
        let error_logs = self.store.error_log().clear().await?;

        let outcome = CleanupOutcome {
            deliveries_deleted: tier3.deliveries_deleted + tier2.deliveries_deleted,
            error_logs_cleared: error_logs,
            bytes_freed: tier3.bytes_freed + tier2.bytes_freed + error_logs * 256,
        };
        info!(
            deliveries = outcome.deliveries_deleted,
            bytes = outcome.bytes_freed,
            "Force cleanup completed"
        );
        Ok(outcome)
    }

    /// React to the current quota band: purge what the band calls for.
    pub async fn enforce(&self, monitor: &StorageMonitor) -> StorageResult<CleanupOutcome> {
        let metrics = monitor.metrics().await?;
        let outcome = match metrics.state {
            StorageState::Normal | StorageState::Warning => CleanupOutcome::default(),
            StorageState::Purging => {
                if metrics.percent >= monitor.config().tier2_purge_percent {
                    let tier3 = self.purge_tier3().await?;
                    let tier2 = self.purge_tier2().await?;
                    CleanupOutcome {
                        deliveries_deleted: tier3.deliveries_deleted + tier2.deliveries_deleted,
                        error_logs_cleared: 0,
                        bytes_freed: tier3.bytes_freed + tier2.bytes_freed,
                    }
                } else {
                    self.purge_tier3().await?
                }
            }
            StorageState::Emergency => self.force_cleanup().await?,
        };
        if outcome.bytes_freed > 0 {
            monitor.invalidate().await;
        }
        Ok(outcome)
    }
}
