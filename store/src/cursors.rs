//! Per-table delta-sync cursors (the `sync_metadata` table).

use ct_core::types::{EntityTable, SyncCursor};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use tracing::info;

use crate::error::{StoreError, StoreResult};
use crate::time::{fmt_ts, parse_opt_ts, parse_ts};

#[derive(Debug, Clone)]
pub struct CursorTable {
    pool: SqlitePool,
}

impl CursorTable {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, table: EntityTable) -> StoreResult<Option<SyncCursor>> {
        let row = sqlx::query("SELECT * FROM sync_metadata WHERE entity_table = ?1")
            .bind(table.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| map_row(&r)).transpose()
    }

    /// Cursor for a table, created lazily at the epoch.
    pub async fn get_or_epoch(&self, table: EntityTable) -> StoreResult<SyncCursor> {
        Ok(self.get(table).await?.unwrap_or_else(|| SyncCursor::epoch(table)))
    }

    pub async fn put(&self, cursor: &SyncCursor) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        put_in_tx(&mut tx, cursor).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Force the next fetch to be a full sync.
    pub async fn reset(&self, table: EntityTable) -> StoreResult<()> {
        info!(table = table.as_str(), "Cursor reset to epoch");
        self.put(&SyncCursor::epoch(table)).await
    }

    pub async fn all(&self) -> StoreResult<Vec<SyncCursor>> {
        let rows = sqlx::query("SELECT * FROM sync_metadata ORDER BY entity_table ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_row).collect()
    }

    pub async fn clear_all(&self) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM sync_metadata").execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

pub(crate) async fn put_in_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    cursor: &SyncCursor,
) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO sync_metadata (entity_table, last_updated_at, last_id, record_count,
             last_sync_at, last_full_sync_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(entity_table) DO UPDATE SET
             last_updated_at = excluded.last_updated_at,
             last_id = excluded.last_id,
             record_count = excluded.record_count,
             last_sync_at = excluded.last_sync_at,
             last_full_sync_at = excluded.last_full_sync_at",
    )
    .bind(cursor.table.as_str())
    .bind(fmt_ts(cursor.last_updated_at))
    .bind(&cursor.last_id)
    .bind(cursor.record_count)
    .bind(cursor.last_sync_at.map(fmt_ts))
    .bind(cursor.last_full_sync_at.map(fmt_ts))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn map_row(row: &SqliteRow) -> StoreResult<SyncCursor> {
    let table: String = row.get("entity_table");
    Ok(SyncCursor {
        table: EntityTable::from_str(&table)
            .map_err(|_| StoreError::corrupt("sync_metadata", "entity_table", table.clone()))?,
        last_updated_at: parse_ts(
            "sync_metadata",
            "last_updated_at",
            &row.get::<String, _>("last_updated_at"),
        )?,
        last_id: row.get("last_id"),
        record_count: row.get("record_count"),
        last_sync_at: parse_opt_ts("sync_metadata", "last_sync_at", row.get("last_sync_at"))?,
        last_full_sync_at: parse_opt_ts(
            "sync_metadata",
            "last_full_sync_at",
            row.get("last_full_sync_at"),
        )?,
    })
}
