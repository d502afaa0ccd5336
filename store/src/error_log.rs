//! Bounded error log: a FIFO ring persisted in the store, capped at the
//! configured maximum (oldest entries evicted on append).

use chrono::Utc;
use ct_core::types::{ErrorKind, ErrorLogEntry};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::time::{fmt_ts, parse_ts};

#[derive(Debug, Clone)]
pub struct ErrorLog {
    pool: SqlitePool,
    cap: usize,
}

impl ErrorLog {
    #[must_use]
    pub fn new(pool: SqlitePool, cap: usize) -> Self {
        Self { pool, cap }
    }

    /// Append one entry and evict beyond capacity, atomically.
    pub async fn append(
        &self,
        kind: ErrorKind,
        code: &str,
        message: &str,
        context: Option<serde_json::Value>,
    ) -> StoreResult<ErrorLogEntry> {
        let entry = ErrorLogEntry {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            kind,
            code: code.to_string(),
            message: message.to_string(),
            context,
            stack: None,
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO error_log (id, timestamp, kind, code, message, context, stack)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&entry.id)
        .bind(fmt_ts(entry.timestamp))
        .bind(entry.kind.as_str())
        .bind(&entry.code)
        .bind(&entry.message)
        .bind(entry.context.as_ref().map(ToString::to_string))
        .bind(&entry.stack)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "DELETE FROM error_log WHERE id NOT IN (
                 SELECT id FROM error_log ORDER BY timestamp DESC, id DESC LIMIT ?1
             )",
        )
        .bind(self.cap as i64)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(entry)
    }

    /// Newest first.
    pub async fn recent(&self, limit: usize) -> StoreResult<Vec<ErrorLogEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM error_log ORDER BY timestamp DESC, id DESC LIMIT ?1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_row).collect()
    }

    pub async fn by_kind(&self, kind: ErrorKind, limit: usize) -> StoreResult<Vec<ErrorLogEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM error_log WHERE kind = ?1 ORDER BY timestamp DESC, id DESC LIMIT ?2",
        )
        .bind(kind.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_row).collect()
    }

    pub async fn count(&self) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM error_log")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    pub async fn clear(&self) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM error_log").execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

fn map_row(row: &SqliteRow) -> StoreResult<ErrorLogEntry> {
    let kind: String = row.get("kind");
    Ok(ErrorLogEntry {
        id: row.get("id"),
        timestamp: parse_ts("error_log", "timestamp", &row.get::<String, _>("timestamp"))?,
        kind: ErrorKind::from_str(&kind)
            .map_err(|_| StoreError::corrupt("error_log", "kind", kind.clone()))?,
        code: row.get("code"),
        message: row.get("message"),
        context: row
            .get::<Option<String>, _>("context")
            .map(|s| serde_json::from_str(&s))
            .transpose()?,
        stack: row.get("stack"),
    })
}
