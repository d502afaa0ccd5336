//! The sync drain: pulls the queue in priority-then-FIFO batches, runs
//! pre-flight conflict detection for updates, invokes the server RPC and
//! feeds failures to the retry scheduler.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use ct_core::traits::{BatteryMonitor, SyncOperationRequest, SyncResponse, SyncTransport};
use ct_core::types::{
    EntityTable, ErrorKind, OperationError, OperationType, QueuedOperation, RecordSyncStatus,
};
use queue::{OperationQueue, RetryDecision, RetryPolicy};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use store::OfflineStore;
use tracing::{debug, info, warn};

use crate::conflict::{self, ConflictPolicy, ConflictType};
use crate::error::{SyncError, SyncResult};

/// One classified failure surfaced by a sync cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCycleError {
    pub op_id: Option<String>,
    pub code: Option<u16>,
    pub message: String,
}

/// Result of one `sync()` cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub synced: u64,
    pub failed: u64,
    pub conflicts: u64,
    pub errors: Vec<SyncCycleError>,
}

pub struct SyncEngine {
    queue: OperationQueue,
    store: OfflineStore,
    transport: Arc<dyn SyncTransport>,
    battery: Arc<dyn BatteryMonitor>,
    conflict_policy: ConflictPolicy,
    retry_policy: RetryPolicy,
    max_batch_size: usize,
    min_battery_for_retry: u8,
    is_syncing: AtomicBool,
}

impl SyncEngine {
    #[must_use]
    pub fn new(
        queue: OperationQueue,
        transport: Arc<dyn SyncTransport>,
        battery: Arc<dyn BatteryMonitor>,
        config: &config::EngineConfig,
    ) -> Self {
        let store = queue.store().clone();
        Self {
            queue,
            store,
            transport,
            battery,
            conflict_policy: ConflictPolicy::default(),
            retry_policy: RetryPolicy::new(config.retry.clone()),
            max_batch_size: config.max_batch_size,
            min_battery_for_retry: config.retry.min_battery_for_retry,
            is_syncing: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn queue(&self) -> &OperationQueue {
        &self.queue
    }

    #[must_use]
    pub fn transport(&self) -> &Arc<dyn SyncTransport> {
        &self.transport
    }

    #[must_use]
    pub fn conflict_policy(&self) -> &ConflictPolicy {
        &self.conflict_policy
    }

    /// Whether a cycle is currently draining.
    #[must_use]
    pub fn is_syncing(&self) -> bool {
        self.is_syncing.load(Ordering::SeqCst)
    }

    /// Drain one batch. At most one cycle runs per process; overlapping
    /// callers fail fast with [`SyncError::SyncInProgress`].
    pub async fn sync(&self) -> SyncResult<SyncReport> {
        if self.is_syncing.swap(true, Ordering::SeqCst) {
            debug!("Sync already in progress, caller fails fast");
            return Err(SyncError::SyncInProgress);
        }
        let started = std::time::Instant::now();
        let result = self.drain().await;
        self.is_syncing.store(false, Ordering::SeqCst);

        metrics::counter!("sync.cycles.total").increment(1);
        metrics::histogram!("sync.cycle.duration_ms").record(started.elapsed().as_millis() as f64);
        if let Ok(report) = &result {
            metrics::counter!("sync.ops.synced").increment(report.synced);
            metrics::counter!("sync.ops.failed").increment(report.failed);
            metrics::counter!("sync.ops.conflicts").increment(report.conflicts);
            info!(
                synced = report.synced,
                failed = report.failed,
                conflicts = report.conflicts,
                errors = report.errors.len(),
                "Sync cycle completed"
            );
        }
        result
    }

    async fn drain(&self) -> SyncResult<SyncReport> {
        let mut report = SyncReport::default();
        let now = Utc::now();

        // Battery recovered since ops were parked: put them back in play
        // before selecting the batch.
        let battery = self.battery.battery_percent().await;
        if battery.is_none_or(|level| level >= self.min_battery_for_retry) {
            self.queue.resume_battery_paused().await?;
        }

        let batch = self.queue.next_batch(self.max_batch_size, now).await?;
        if batch.is_empty() {
            return Ok(report);
        }
        debug!(batch = batch.len(), "Draining operation batch");

        for op in batch {
            // Recoverable per-op errors annotate the op and keep the batch
            // moving; store-level failures abort the cycle.
            match self.sync_one(&op, &mut report).await {
                Ok(()) => {}
                Err(SyncError::Queue(queue::QueueError::Store(e))) => {
                    report.errors.push(SyncCycleError {
                        op_id: Some(op.id.clone()),
                        code: None,
                        message: e.to_string(),
                    });
                    return Ok(report);
                }
                Err(e) => {
                    report.errors.push(SyncCycleError {
                        op_id: Some(op.id.clone()),
                        code: None,
                        message: e.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }

    async fn sync_one(&self, op: &QueuedOperation, report: &mut SyncReport) -> SyncResult<()> {
        let op = self.queue.mark_syncing(&op.id).await?;

        // Pre-flight three-way detection for updates carrying a base.
        if op.op_type == OperationType::Update && op.base_snapshot.is_some() {
            if let Some(remote) = self.fetch_remote_state(&op).await {
                let detection = conflict::detect(
                    &self.conflict_policy,
                    op.table,
                    op.op_type,
                    op.base_snapshot.as_ref(),
                    &remote,
                    &op.data,
                );
                if detection.kind == ConflictType::Critical {
                    let info =
                        conflict::conflict_info_from_detection(&detection, &remote, op.row_version);
                    self.queue.mark_needs_review(&op.id, info).await?;
                    self.log_conflict(&op).await;
                    report.conflicts += 1;
                    return Ok(());
                }
            }
        }

        let request = self.outbound_request(&op);
        match self.transport.sync_operation(request).await {
            Ok(SyncResponse::Success { server_id, .. }) => {
                self.complete(&op, server_id, report).await
            }
            Ok(SyncResponse::AlreadyProcessed) => {
                debug!(op_id = %op.id, "Server already processed, treating as success");
                self.complete(&op, None, report).await
            }
            Ok(SyncResponse::Conflict { conflict }) => {
                let info = conflict::conflict_info_from_server(
                    &self.conflict_policy,
                    op.table,
                    &op.data,
                    &conflict,
                );
                self.queue.mark_needs_review(&op.id, info).await?;
                self.log_conflict(&op).await;
                report.conflicts += 1;
                Ok(())
            }
            Ok(SyncResponse::Error { code, message }) => {
                self.handle_failure(&op, Some(code), message, report).await
            }
            Err(transport_err) => {
                let code = transport_err.status();
                self.handle_failure(&op, code, transport_err.to_string(), report)
                    .await
            }
        }
    }

    /// Optimistic fetch of current server state; any transport failure
    /// skips pre-flight and lets the RPC decide.
    async fn fetch_remote_state(&self, op: &QueuedOperation) -> Option<Value> {
        let record_id = self.store.id_map().resolve_to_server_id(&op.record_id);
        match self.transport.fetch_current(op.table, &record_id).await {
            Ok(state) => state,
            Err(e) => {
                debug!(op_id = %op.id, error = %e, "Pre-flight fetch failed, deferring to RPC");
                None
            }
        }
    }

    /// Outbound request with foreign keys resolved through the id map.
    fn outbound_request(&self, op: &QueuedOperation) -> SyncOperationRequest {
        let id_map = self.store.id_map();
        let mut data = op.data.clone();
        if let Some(object) = data.as_object_mut() {
            for (key, value) in object.iter_mut() {
                if !key.ends_with("_id") {
                    continue;
                }
                let Some(id) = value.as_str().map(str::to_string) else {
                    continue;
                };
                let resolved = id_map.resolve_to_server_id(&id);
                if resolved != id {
                    *value = Value::String(resolved);
                }
            }
        }
        SyncOperationRequest {
            idempotency_key: op.idempotency_key.clone(),
            table: op.table,
            op_type: op.op_type,
            record_id: id_map.resolve_to_server_id(&op.record_id),
            data,
        }
    }

    async fn complete(
        &self,
        op: &QueuedOperation,
        server_id: Option<String>,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        if let Some(server_id) = &server_id
            && op.op_type == OperationType::Create
            && *server_id != op.client_id
        {
            self.store
                .id_map()
                .record(&op.client_id, server_id, op.table)
                .await?;
        }
        if op.table == EntityTable::Deliveries {
            // Best effort: the cached row may have been evicted or wiped.
            if let Err(e) = self
                .store
                .deliveries()
                .set_status(&op.record_id, RecordSyncStatus::Synced)
                .await
            {
                debug!(op_id = %op.id, error = %e, "Delivery status not updated after sync");
            }
        }
        self.queue.dequeue(&op.id).await?;
        report.synced += 1;
        Ok(())
    }

    async fn handle_failure(
        &self,
        op: &QueuedOperation,
        code: Option<u16>,
        message: String,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        let now = Utc::now();
        let battery = self.battery.battery_percent().await;
        let error = OperationError::new(code, message.clone());
        let decision = self
            .retry_policy
            .decide(op.retry_count + 1, code, battery, now);

        match decision {
            RetryDecision::Schedule { next_retry_at } => {
                warn!(op_id = %op.id, ?code, %next_retry_at, "Attempt failed, retry scheduled");
                self.queue
                    .fail_retryable(&op.id, error, next_retry_at)
                    .await?;
            }
            RetryDecision::Terminal => {
                warn!(op_id = %op.id, ?code, "Attempt failed terminally");
                self.queue.fail_terminal(&op.id, error).await?;
            }
            RetryDecision::PausedLowBattery => {
                info!(op_id = %op.id, ?battery, "Retry paused on low battery");
                self.queue.pause_low_battery(&op.id).await?;
            }
        }

        let kind = if code.is_none() {
            ErrorKind::Network
        } else {
            ErrorKind::Sync
        };
        if let Err(e) = self
            .store
            .error_log()
            .append(
                kind,
                &code.map_or_else(|| "TRANSPORT".to_string(), |c| c.to_string()),
                &message,
                Some(serde_json::json!({"opId": op.id, "table": op.table.as_str()})),
            )
            .await
        {
            debug!(error = %e, "Error log append failed");
        }

        report.failed += 1;
        report.errors.push(SyncCycleError {
            op_id: Some(op.id.clone()),
            code,
            message,
        });
        Ok(())
    }

    async fn log_conflict(&self, op: &QueuedOperation) {
        if let Err(e) = self
            .store
            .error_log()
            .append(
                ErrorKind::Sync,
                "CONFLICT",
                "Operation escalated to review",
                Some(serde_json::json!({"opId": op.id, "table": op.table.as_str()})),
            )
            .await
        {
            debug!(error = %e, "Error log append failed");
        }
    }
}
