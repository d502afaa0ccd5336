//! Diagnostics snapshot: the one serializable report the support screen
//! renders and agents export when something looks wrong in the field.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use ct_core::types::{DegradedMode, ErrorLogEntry, SyncCursor, SyncDisplayState};
use queue::OperationQueue;
use serde::{Deserialize, Serialize};
use store::{MigrationErrorRecord, OfflineStore, QueueStats, TableCounts};

use crate::degraded::DegradedModeManager;
use crate::error::StorageResult;
use crate::quota::{StorageMetrics, StorageMonitor};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub generated_at: DateTime<Utc>,
    pub queue: QueueStats,
    pub display_state: SyncDisplayState,
    pub storage: StorageMetrics,
    pub degraded_mode: DegradedMode,
    pub counts: TableCounts,
    pub cursors: Vec<SyncCursor>,
    pub migration_error: Option<MigrationErrorRecord>,
    pub recent_errors: Vec<ErrorLogEntry>,
}

pub struct DiagnosticsService {
    store: OfflineStore,
    queue: OperationQueue,
    monitor: Arc<StorageMonitor>,
    degraded: Arc<DegradedModeManager>,
}

impl DiagnosticsService {
    #[must_use]
    pub fn new(
        store: OfflineStore,
        queue: OperationQueue,
        monitor: Arc<StorageMonitor>,
        degraded: Arc<DegradedModeManager>,
    ) -> Self {
        Self {
            store,
            queue,
            monitor,
            degraded,
        }
    }

    pub async fn snapshot(&self) -> StorageResult<DiagnosticsSnapshot> {
        let queue_stats = self.queue.stats().await?;
        let display_state = SyncDisplayState::compose(
            queue_stats.pending + queue_stats.syncing,
            queue_stats.failed + queue_stats.needs_review,
        );
        Ok(DiagnosticsSnapshot {
            generated_at: Utc::now(),
            display_state,
            queue: queue_stats,
            storage: self.monitor.metrics().await?,
            degraded_mode: self.degraded.current().await?,
            counts: self.store.counts().await?,
            cursors: self.store.cursors().all().await?,
            migration_error: self.store.sidecar().load_migration_error().await?,
            recent_errors: self.store.error_log().recent(20).await?,
        })
    }

    /// Compact JSON for export from the diagnostics screen.
    pub async fn export_json(&self) -> StorageResult<String> {
        let snapshot = self.snapshot().await?;
        Ok(serde_json::to_string(&snapshot).unwrap_or_else(|_| "{}".to_string()))
    }
}
