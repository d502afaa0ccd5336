//! The operation queue: idempotent enqueue, the op status machine and the
//! conflict-resolution commands.

use chrono::{DateTime, SecondsFormat, Utc};
use ct_core::types::{
    ConflictInfo, CooperativeId, EntityTable, OperationError, OperationStatus, OperationType,
    Priority, QueuedOperation, SyncDisplayState, UserId,
};
use store::{OfflineStore, QueueStats};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{QueueError, QueueResult};

/// Input for [`OperationQueue::create_operation`].
#[derive(Debug, Clone)]
pub struct NewOperation {
    pub op_type: OperationType,
    pub table: EntityTable,
    pub record_id: String,
    pub data: serde_json::Value,
    pub user_id: UserId,
    pub cooperative_id: CooperativeId,
    pub base_snapshot: Option<serde_json::Value>,
    pub base_updated_at: Option<DateTime<Utc>>,
    pub row_version: Option<i64>,
    pub priority: Option<Priority>,
    /// When the mutation was made; defaults to now. Part of the
    /// idempotency fingerprint, so re-enqueuing the same mutation with
    /// the same timestamp dedupes.
    pub created_at: Option<DateTime<Utc>>,
}

impl NewOperation {
    #[must_use]
    pub fn new(
        op_type: OperationType,
        table: EntityTable,
        record_id: impl Into<String>,
        data: serde_json::Value,
        user_id: UserId,
        cooperative_id: CooperativeId,
    ) -> Self {
        Self {
            op_type,
            table,
            record_id: record_id.into(),
            data,
            user_id,
            cooperative_id,
            base_snapshot: None,
            base_updated_at: None,
            row_version: None,
            priority: None,
            created_at: None,
        }
    }

    #[must_use]
    pub fn with_base(
        mut self,
        snapshot: serde_json::Value,
        updated_at: DateTime<Utc>,
        row_version: Option<i64>,
    ) -> Self {
        self.base_snapshot = Some(snapshot);
        self.base_updated_at = Some(updated_at);
        self.row_version = row_version;
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Error annotation marking ops parked by the low-battery gate. The next
/// sync cycle with enough battery re-queues them.
pub const BATTERY_PAUSE_MESSAGE: &str = "Retry paused: battery below threshold";

/// Conflict resolution chosen by the user.
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictResolution {
    /// Keep the local edit: drop the merge base and retry as-is.
    Local,
    /// Accept the server state: drop the op.
    Remote,
    /// Retry with user-merged data.
    Merge { merged_data: serde_json::Value },
}

#[derive(Clone)]
pub struct OperationQueue {
    store: OfflineStore,
}

impl OperationQueue {
    #[must_use]
    pub fn new(store: OfflineStore) -> Self {
        Self { store }
    }

    #[must_use]
    pub fn store(&self) -> &OfflineStore {
        &self.store
    }

    /// Enqueue a mutation. If an op with the same idempotency fingerprint
    /// already exists it is returned unchanged, with no new insert.
    pub async fn create_operation(&self, input: NewOperation) -> QueueResult<QueuedOperation> {
        let created_at = input.created_at.unwrap_or_else(Utc::now);
        let client_id = input.record_id.clone();
        let idempotency_key = utils::compute_idempotency_key(
            input.user_id.as_str(),
            input.table.as_str(),
            input.op_type.as_str(),
            &client_id,
            &created_at.to_rfc3339_opts(SecondsFormat::Micros, true),
        );

        let ops = self.store.ops();
        if let Some(existing) = ops.find_by_idempotency_key(&idempotency_key).await? {
            debug!(op_id = %existing.id, "Duplicate enqueue deduped by idempotency key");
            return Ok(existing);
        }

        let op = QueuedOperation {
            id: Uuid::new_v4().to_string(),
            idempotency_key,
            op_type: input.op_type,
            table: input.table,
            record_id: input.record_id,
            client_id,
            server_id: None,
            user_id: input.user_id,
            cooperative_id: input.cooperative_id,
            data: input.data,
            base_snapshot: input.base_snapshot,
            base_updated_at: input.base_updated_at,
            row_version: input.row_version,
            priority: input.priority.unwrap_or_else(|| input.table.default_priority()),
            status: OperationStatus::Pending,
            retry_count: 0,
            last_attempt_at: None,
            next_retry_at: None,
            created_at,
            queued_at: Utc::now(),
            error: None,
            conflict_info: None,
        };
        ops.insert(&op).await?;
        debug!(
            op_id = %op.id,
            table = op.table.as_str(),
            op_type = op.op_type.as_str(),
            priority = op.priority.as_str(),
            "Operation queued"
        );
        Ok(op)
    }

    pub async fn get(&self, op_id: &str) -> QueueResult<QueuedOperation> {
        self.store
            .ops()
            .get(op_id)
            .await?
            .ok_or_else(|| QueueError::OperationNotFound(op_id.to_string()))
    }

    /// Drain candidates in priority-then-FIFO order.
    pub async fn next_batch(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> QueueResult<Vec<QueuedOperation>> {
        Ok(self.store.ops().next_batch(limit, now).await?)
    }

    async fn transition(
        &self,
        op: &mut QueuedOperation,
        next: OperationStatus,
    ) -> QueueResult<()> {
        if !op.status.can_transition_to(next) {
            return Err(QueueError::IllegalTransition {
                from: op.status,
                to: next,
            });
        }
        op.status = next;
        self.store.ops().update(op).await?;
        Ok(())
    }

    /// `pending|failed -> syncing`, stamping the attempt.
    pub async fn mark_syncing(&self, op_id: &str) -> QueueResult<QueuedOperation> {
        let mut op = self.get(op_id).await?;
        // A retryable failed op re-enters through pending.
        if op.status == OperationStatus::Failed {
            self.transition(&mut op, OperationStatus::Pending).await?;
        }
        op.last_attempt_at = Some(Utc::now());
        self.transition(&mut op, OperationStatus::Syncing).await?;
        Ok(op)
    }

    /// Successful server apply: the op leaves the queue.
    pub async fn dequeue(&self, op_id: &str) -> QueueResult<bool> {
        Ok(self.store.ops().delete(op_id).await?)
    }

    /// `syncing -> failed` with a retry deadline.
    pub async fn fail_retryable(
        &self,
        op_id: &str,
        error: OperationError,
        next_retry_at: DateTime<Utc>,
    ) -> QueueResult<QueuedOperation> {
        let mut op = self.get(op_id).await?;
        op.retry_count += 1;
        op.error = Some(error);
        op.next_retry_at = Some(next_retry_at);
        self.transition(&mut op, OperationStatus::Failed).await?;
        Ok(op)
    }

    /// `syncing -> failed`, no deadline: terminal until a user retries.
    pub async fn fail_terminal(
        &self,
        op_id: &str,
        error: OperationError,
    ) -> QueueResult<QueuedOperation> {
        let mut op = self.get(op_id).await?;
        op.retry_count += 1;
        op.error = Some(error);
        op.next_retry_at = None;
        self.transition(&mut op, OperationStatus::Failed).await?;
        Ok(op)
    }

    /// Battery gate: parked as `failed` with no deadline and an
    /// explanatory error; the next sync cycle re-evaluates.
    pub async fn pause_low_battery(&self, op_id: &str) -> QueueResult<QueuedOperation> {
        let mut op = self.get(op_id).await?;
        op.error = Some(OperationError::new(None, BATTERY_PAUSE_MESSAGE));
        op.next_retry_at = None;
        self.transition(&mut op, OperationStatus::Failed).await?;
        Ok(op)
    }

    /// Re-queue every battery-paused op; called when a cycle starts with
    /// sufficient battery.
    pub async fn resume_battery_paused(&self) -> QueueResult<u64> {
        let resumed = self.store.ops().resume_paused(BATTERY_PAUSE_MESSAGE).await?;
        if resumed > 0 {
            info!(resumed, "Battery recovered, paused ops re-queued");
        }
        Ok(resumed)
    }

    /// `syncing -> needs_review` with the conflict payload attached.
    pub async fn mark_needs_review(
        &self,
        op_id: &str,
        conflict_info: ConflictInfo,
    ) -> QueueResult<QueuedOperation> {
        let mut op = self.get(op_id).await?;
        op.conflict_info = Some(conflict_info);
        self.transition(&mut op, OperationStatus::NeedsReview).await?;
        info!(op_id = %op.id, "Operation escalated to review");
        Ok(op)
    }

    /// Apply the user's conflict decision.
    pub async fn resolve_conflict(
        &self,
        op_id: &str,
        resolution: ConflictResolution,
    ) -> QueueResult<Option<QueuedOperation>> {
        let mut op = self.get(op_id).await?;
        match resolution {
            ConflictResolution::Local => {
                op.base_snapshot = None;
                op.base_updated_at = None;
                op.conflict_info = None;
                op.error = None;
                op.next_retry_at = None;
                self.transition(&mut op, OperationStatus::Pending).await?;
                Ok(Some(op))
            }
            ConflictResolution::Remote => {
                if op.status != OperationStatus::NeedsReview {
                    return Err(QueueError::IllegalTransition {
                        from: op.status,
                        to: OperationStatus::NeedsReview,
                    });
                }
                self.dequeue(op_id).await?;
                Ok(None)
            }
            ConflictResolution::Merge { merged_data } => {
                if merged_data.as_object().is_none() {
                    return Err(QueueError::MissingMergedData);
                }
                op.data = merged_data;
                op.base_snapshot = None;
                op.base_updated_at = None;
                op.conflict_info = None;
                op.error = None;
                op.next_retry_at = None;
                self.transition(&mut op, OperationStatus::Pending).await?;
                Ok(Some(op))
            }
        }
    }

    /// Force a failed op straight back to `pending` with a fresh retry
    /// budget.
    pub async fn retry_operation(&self, op_id: &str) -> QueueResult<QueuedOperation> {
        let mut op = self.get(op_id).await?;
        op.retry_count = 0;
        op.next_retry_at = None;
        op.error = None;
        self.transition(&mut op, OperationStatus::Pending).await?;
        Ok(op)
    }

    /// Drop an op regardless of its state.
    pub async fn cancel_operation(&self, op_id: &str) -> QueueResult<bool> {
        self.dequeue(op_id).await
    }

    pub async fn stats(&self) -> QueueResult<QueueStats> {
        Ok(self.store.ops().stats().await?)
    }

    pub async fn count(&self) -> QueueResult<u64> {
        Ok(self.store.ops().count().await?)
    }

    /// Aggregate display state: errors dominate, then pending work.
    pub async fn display_state(&self) -> QueueResult<SyncDisplayState> {
        let stats = self.stats().await?;
        Ok(SyncDisplayState::compose(
            stats.pending + stats.syncing,
            stats.failed + stats.needs_review,
        ))
    }
}
