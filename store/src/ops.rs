//! Operation-queue persistence.
//!
//! Row-level CRUD and the ordered batch selection used by the sync drain.
//! Status-machine enforcement lives in the `queue` crate; this module only
//! moves rows.

use chrono::{DateTime, Utc};
use ct_core::types::{
    EntityTable, OperationError, OperationStatus, OperationType, Priority, QueuedOperation,
};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::time::{fmt_ts, parse_opt_ts, parse_ts};

/// Per-status queue counts plus the oldest pending timestamp.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pending: u64,
    pub syncing: u64,
    pub failed: u64,
    pub needs_review: u64,
    pub pending_auth: u64,
    pub oldest_pending_at: Option<DateTime<Utc>>,
}

impl QueueStats {
    #[must_use]
    pub fn total(&self) -> u64 {
        self.pending + self.syncing + self.failed + self.needs_review + self.pending_auth
    }
}

#[derive(Debug, Clone)]
pub struct OpsTable {
    pool: SqlitePool,
}

impl OpsTable {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, op: &QueuedOperation) -> StoreResult<()> {
        bind_op(
            sqlx::query(
                "INSERT INTO ops_queue (id, idempotency_key, op_type, entity_table, record_id,
                     client_id, server_id, user_id, cooperative_id, data, base_snapshot,
                     base_updated_at, row_version, priority, status, retry_count,
                     last_attempt_at, next_retry_at, created_at, queued_at, error, conflict_info)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                     ?17, ?18, ?19, ?20, ?21, ?22)",
            ),
            op,
        )?
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Full-row update keyed by `id`. Ownership columns are deliberately
    /// not rewritten.
    pub async fn update(&self, op: &QueuedOperation) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE ops_queue SET
                 server_id = ?1, data = ?2, base_snapshot = ?3, base_updated_at = ?4,
                 row_version = ?5, priority = ?6, status = ?7, retry_count = ?8,
                 last_attempt_at = ?9, next_retry_at = ?10, error = ?11, conflict_info = ?12
             WHERE id = ?13",
        )
        .bind(&op.server_id)
        .bind(op.data.to_string())
        .bind(op.base_snapshot.as_ref().map(ToString::to_string))
        .bind(op.base_updated_at.map(fmt_ts))
        .bind(op.row_version)
        .bind(op.priority.rank())
        .bind(op.status.as_str())
        .bind(i64::from(op.retry_count))
        .bind(op.last_attempt_at.map(fmt_ts))
        .bind(op.next_retry_at.map(fmt_ts))
        .bind(op.error.as_ref().map(serde_json::to_string).transpose()?)
        .bind(
            op.conflict_info
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(&op.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                table: "ops_queue",
                id: op.id.clone(),
            });
        }
        Ok(())
    }

    pub async fn get(&self, id: &str) -> StoreResult<Option<QueuedOperation>> {
        let row = sqlx::query("SELECT * FROM ops_queue WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| map_row(&r)).transpose()
    }

    pub async fn find_by_idempotency_key(&self, key: &str) -> StoreResult<Option<QueuedOperation>> {
        let row = sqlx::query("SELECT * FROM ops_queue WHERE idempotency_key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| map_row(&r)).transpose()
    }

    /// Remove one op (dequeue). Returns whether a row existed.
    pub async fn delete(&self, id: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM ops_queue WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Drain candidates: `pending`, plus retryable `failed` whose deadline
    /// has passed. Priority rank ascending, then FIFO on `created_at`,
    /// with `id` as the final deterministic tiebreak.
    pub async fn next_batch(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<QueuedOperation>> {
        let rows = sqlx::query(
            "SELECT * FROM ops_queue
             WHERE status = 'pending'
                OR (status = 'failed' AND next_retry_at IS NOT NULL AND next_retry_at <= ?1)
             ORDER BY priority ASC, created_at ASC, id ASC
             LIMIT ?2",
        )
        .bind(fmt_ts(now))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_row).collect()
    }

    pub async fn all(&self) -> StoreResult<Vec<QueuedOperation>> {
        let rows = sqlx::query("SELECT * FROM ops_queue ORDER BY created_at ASC, id ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_row).collect()
    }

    pub async fn by_status(&self, status: OperationStatus) -> StoreResult<Vec<QueuedOperation>> {
        let rows = sqlx::query(
            "SELECT * FROM ops_queue WHERE status = ?1 ORDER BY created_at ASC, id ASC",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_row).collect()
    }

    pub async fn count(&self) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ops_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    pub async fn count_by_status(&self, status: OperationStatus) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ops_queue WHERE status = ?1")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    pub async fn stats(&self) -> StoreResult<QueueStats> {
        let mut stats = QueueStats::default();
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM ops_queue GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let status: String = row.get("status");
            let n: i64 = row.get("n");
            match OperationStatus::from_str(&status) {
                Ok(OperationStatus::Pending) => stats.pending = n as u64,
                Ok(OperationStatus::Syncing) => stats.syncing = n as u64,
                Ok(OperationStatus::Failed) => stats.failed = n as u64,
                Ok(OperationStatus::NeedsReview) => stats.needs_review = n as u64,
                Ok(OperationStatus::PendingAuth) => stats.pending_auth = n as u64,
                Err(_) => return Err(StoreError::corrupt("ops_queue", "status", status)),
            }
        }
        let oldest: Option<String> = sqlx::query_scalar(
            "SELECT MIN(created_at) FROM ops_queue WHERE status = 'pending'",
        )
        .fetch_one(&self.pool)
        .await?;
        stats.oldest_pending_at = parse_opt_ts("ops_queue", "created_at", oldest)?;
        Ok(stats)
    }

    /// Re-queue ops parked with the given error marker (battery pause).
    pub async fn resume_paused(&self, marker: &str) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE ops_queue SET status = 'pending', error = NULL
             WHERE status = 'failed' AND next_retry_at IS NULL
               AND error LIKE '%' || ?1 || '%'",
        )
        .bind(marker)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Logout: park this user's live ops under `pending_auth`.
    pub async fn park_for_user(&self, user_id: &str) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE ops_queue SET status = 'pending_auth'
             WHERE user_id = ?1 AND status IN ('pending', 'failed')",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        debug!(user_id, parked = result.rows_affected(), "Parked ops on logout");
        Ok(result.rows_affected())
    }

    /// Same-user login: restore parked ops to `pending`.
    pub async fn restore_for_user(&self, user_id: &str) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE ops_queue SET status = 'pending', next_retry_at = NULL
             WHERE user_id = ?1 AND status = 'pending_auth'",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Distinct owners of `pending_auth` ops with their counts.
    pub async fn pending_auth_owners(&self) -> StoreResult<Vec<(String, u64)>> {
        let rows = sqlx::query(
            "SELECT user_id, COUNT(*) AS n FROM ops_queue
             WHERE status = 'pending_auth' GROUP BY user_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| (r.get::<String, _>("user_id"), r.get::<i64, _>("n") as u64))
            .collect())
    }

    /// Ops owned by someone else that are not parked: cross-user leakage.
    pub async fn orphans_for(&self, user_id: &str) -> StoreResult<Vec<QueuedOperation>> {
        let rows = sqlx::query(
            "SELECT * FROM ops_queue WHERE user_id != ?1 AND status != 'pending_auth'
             ORDER BY created_at ASC, id ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_row).collect()
    }

    /// Explicit wipe of every queue entry (admin/user confirmed).
    pub async fn clear_all(&self) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM ops_queue").execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Restore ops from a sidecar backup. Existing idempotency keys are
    /// left untouched.
    pub async fn restore(&self, ops: &[QueuedOperation]) -> StoreResult<u64> {
        let mut tx = self.pool.begin().await?;
        let mut restored = 0;
        for op in ops {
            let result = bind_op(
                sqlx::query(
                    "INSERT OR IGNORE INTO ops_queue (id, idempotency_key, op_type, entity_table,
                         record_id, client_id, server_id, user_id, cooperative_id, data,
                         base_snapshot, base_updated_at, row_version, priority, status,
                         retry_count, last_attempt_at, next_retry_at, created_at, queued_at,
                         error, conflict_info)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                         ?16, ?17, ?18, ?19, ?20, ?21, ?22)",
                ),
                op,
            )?
            .execute(&mut *tx)
            .await?;
            restored += result.rows_affected();
        }
        tx.commit().await?;
        Ok(restored)
    }
}

type SqliteQuery<'q> =
    sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>;

fn bind_op<'q>(query: SqliteQuery<'q>, op: &'q QueuedOperation) -> StoreResult<SqliteQuery<'q>> {
    Ok(query
        .bind(&op.id)
        .bind(&op.idempotency_key)
        .bind(op.op_type.as_str())
        .bind(op.table.as_str())
        .bind(&op.record_id)
        .bind(&op.client_id)
        .bind(&op.server_id)
        .bind(op.user_id.as_str())
        .bind(op.cooperative_id.as_str())
        .bind(op.data.to_string())
        .bind(op.base_snapshot.as_ref().map(ToString::to_string))
        .bind(op.base_updated_at.map(fmt_ts))
        .bind(op.row_version)
        .bind(op.priority.rank())
        .bind(op.status.as_str())
        .bind(i64::from(op.retry_count))
        .bind(op.last_attempt_at.map(fmt_ts))
        .bind(op.next_retry_at.map(fmt_ts))
        .bind(fmt_ts(op.created_at))
        .bind(fmt_ts(op.queued_at))
        .bind(op.error.as_ref().map(serde_json::to_string).transpose()?)
        .bind(
            op.conflict_info
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        ))
}

fn map_row(row: &SqliteRow) -> StoreResult<QueuedOperation> {
    let op_type: String = row.get("op_type");
    let table: String = row.get("entity_table");
    let status: String = row.get("status");
    let user_id: String = row.get("user_id");
    let cooperative_id: String = row.get("cooperative_id");
    let data: String = row.get("data");
    let priority: i64 = row.get("priority");

    Ok(QueuedOperation {
        id: row.get("id"),
        idempotency_key: row.get("idempotency_key"),
        op_type: OperationType::from_str(&op_type)
            .map_err(|_| StoreError::corrupt("ops_queue", "op_type", op_type.clone()))?,
        table: EntityTable::from_str(&table)
            .map_err(|_| StoreError::corrupt("ops_queue", "entity_table", table.clone()))?,
        record_id: row.get("record_id"),
        client_id: row.get("client_id"),
        server_id: row.get("server_id"),
        user_id: user_id
            .parse()
            .map_err(|_| StoreError::corrupt("ops_queue", "user_id", user_id.clone()))?,
        cooperative_id: cooperative_id
            .parse()
            .map_err(|_| StoreError::corrupt("ops_queue", "cooperative_id", cooperative_id.clone()))?,
        data: serde_json::from_str(&data)?,
        base_snapshot: row
            .get::<Option<String>, _>("base_snapshot")
            .map(|s| serde_json::from_str(&s))
            .transpose()?,
        base_updated_at: parse_opt_ts(
            "ops_queue",
            "base_updated_at",
            row.get("base_updated_at"),
        )?,
        row_version: row.get("row_version"),
        priority: Priority::from_rank(priority)
            .ok_or_else(|| StoreError::corrupt("ops_queue", "priority", priority.to_string()))?,
        status: OperationStatus::from_str(&status)
            .map_err(|_| StoreError::corrupt("ops_queue", "status", status.clone()))?,
        retry_count: row.get::<i64, _>("retry_count") as u32,
        last_attempt_at: parse_opt_ts("ops_queue", "last_attempt_at", row.get("last_attempt_at"))?,
        next_retry_at: parse_opt_ts("ops_queue", "next_retry_at", row.get("next_retry_at"))?,
        created_at: parse_ts("ops_queue", "created_at", &row.get::<String, _>("created_at"))?,
        queued_at: parse_ts("ops_queue", "queued_at", &row.get::<String, _>("queued_at"))?,
        error: row
            .get::<Option<String>, _>("error")
            .map(|s| serde_json::from_str::<OperationError>(&s))
            .transpose()?,
        conflict_info: row
            .get::<Option<String>, _>("conflict_info")
            .map(|s| serde_json::from_str(&s))
            .transpose()?,
    })
}

/// Version-tolerant reader used for the pre-migration backup: columns
/// added in later schema versions fall back to their defaults.
pub(crate) async fn read_all_tolerant(pool: &SqlitePool) -> StoreResult<Vec<QueuedOperation>> {
    let rows = sqlx::query("SELECT * FROM ops_queue ORDER BY created_at ASC, id ASC")
        .fetch_all(pool)
        .await?;

    let mut ops = Vec::with_capacity(rows.len());
    for row in &rows {
        let op_type: String = row.get("op_type");
        let table_str: String = row.get("entity_table");
        let status: String = row.get("status");
        let user_id: String = row.get("user_id");
        let cooperative_id: String = row.get("cooperative_id");
        let data: String = row.get("data");

        let table = EntityTable::from_str(&table_str)
            .map_err(|_| StoreError::corrupt("ops_queue", "entity_table", table_str.clone()))?;
        let priority = row
            .try_get::<i64, _>("priority")
            .ok()
            .and_then(Priority::from_rank)
            .unwrap_or_else(|| table.default_priority());

        ops.push(QueuedOperation {
            id: row.get("id"),
            idempotency_key: row.get("idempotency_key"),
            op_type: OperationType::from_str(&op_type)
                .map_err(|_| StoreError::corrupt("ops_queue", "op_type", op_type.clone()))?,
            table,
            record_id: row.get("record_id"),
            client_id: row.get("client_id"),
            server_id: row.get("server_id"),
            user_id: user_id
                .parse()
                .map_err(|_| StoreError::corrupt("ops_queue", "user_id", user_id.clone()))?,
            cooperative_id: cooperative_id.parse().map_err(|_| {
                StoreError::corrupt("ops_queue", "cooperative_id", cooperative_id.clone())
            })?,
            data: serde_json::from_str(&data)?,
            base_snapshot: row
                .try_get::<Option<String>, _>("base_snapshot")
                .ok()
                .flatten()
                .map(|s| serde_json::from_str(&s))
                .transpose()?,
            base_updated_at: parse_opt_ts(
                "ops_queue",
                "base_updated_at",
                row.try_get("base_updated_at").ok().flatten(),
            )?,
            row_version: row.try_get("row_version").ok().flatten(),
            priority,
            status: OperationStatus::from_str(&status)
                .map_err(|_| StoreError::corrupt("ops_queue", "status", status.clone()))?,
            retry_count: row.get::<i64, _>("retry_count") as u32,
            last_attempt_at: parse_opt_ts(
                "ops_queue",
                "last_attempt_at",
                row.get("last_attempt_at"),
            )?,
            next_retry_at: parse_opt_ts("ops_queue", "next_retry_at", row.get("next_retry_at"))?,
            created_at: parse_ts("ops_queue", "created_at", &row.get::<String, _>("created_at"))?,
            queued_at: parse_ts("ops_queue", "queued_at", &row.get::<String, _>("queued_at"))?,
            error: row
                .get::<Option<String>, _>("error")
                .map(|s| serde_json::from_str::<OperationError>(&s))
                .transpose()?,
            conflict_info: row
                .try_get::<Option<String>, _>("conflict_info")
                .ok()
                .flatten()
                .map(|s| serde_json::from_str(&s))
                .transpose()?,
        });
    }
    Ok(ops)
}
