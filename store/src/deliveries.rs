//! Tiered delivery cache.
//!
//! Deliveries carry a retention tier recomputed from their age and a local
//! sync status. Purge paths are written so a `pending_sync` row can never
//! match their predicate, whatever the caller asks for.

use chrono::{DateTime, Utc};
use ct_core::types::{DeliveryRecord, DeliveryTier, RecordSyncStatus};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::time::{fmt_ts, parse_opt_ts, parse_ts};

/// Outcome of a purge pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeOutcome {
    pub rows_deleted: u64,
    pub bytes_freed: u64,
}

#[derive(Debug, Clone)]
pub struct DeliveryCache {
    pool: SqlitePool,
}

impl DeliveryCache {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn put(&self, record: &DeliveryRecord) -> StoreResult<()> {
        self.put_batch(std::slice::from_ref(record)).await
    }

    /// Atomic multi-put.
    pub async fn put_batch(&self, records: &[DeliveryRecord]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            put_in_tx(&mut tx, record).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> StoreResult<Option<DeliveryRecord>> {
        let row = sqlx::query("SELECT * FROM deliveries WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| map_row(&r)).transpose()
    }

    pub async fn delete(&self, id: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM deliveries WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count(&self) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM deliveries")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    pub async fn count_by_tier(&self, tier: DeliveryTier) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM deliveries WHERE tier = ?1")
            .bind(tier.as_i64())
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    pub async fn by_status(&self, status: RecordSyncStatus) -> StoreResult<Vec<DeliveryRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM deliveries WHERE status = ?1 ORDER BY delivered_at DESC, id ASC",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_row).collect()
    }

    pub async fn by_date_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<DeliveryRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM deliveries WHERE delivered_at >= ?1 AND delivered_at < ?2
             ORDER BY delivered_at DESC, id ASC",
        )
        .bind(fmt_ts(from))
        .bind(fmt_ts(to))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_row).collect()
    }

    pub async fn set_status(&self, id: &str, status: RecordSyncStatus) -> StoreResult<()> {
        let result = sqlx::query("UPDATE deliveries SET status = ?1 WHERE id = ?2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                table: "deliveries",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    /// Recompute every row's tier from its age. Returns rows whose tier
    /// changed.
    pub async fn recompute_tiers(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let tier2_cutoff = fmt_ts(now - chrono::Duration::days(8));
        let tier3_cutoff = fmt_ts(now - chrono::Duration::days(31));
        let result = sqlx::query(
            "UPDATE deliveries SET tier = CASE
                 WHEN delivered_at > ?1 THEN 1
                 WHEN delivered_at > ?2 THEN 2
                 ELSE 3
             END
             WHERE tier != CASE
                 WHEN delivered_at > ?1 THEN 1
                 WHEN delivered_at > ?2 THEN 2
                 ELSE 3
             END",
        )
        .bind(&tier2_cutoff)
        .bind(&tier3_cutoff)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() > 0 {
            debug!(changed = result.rows_affected(), "Delivery tiers recomputed");
        }
        Ok(result.rows_affected())
    }

    /// Delete evictable rows of one tier. Tier 1 and `pending_sync` rows
    /// never match; deliveries newer than 7 days are skipped as well,
    /// whatever tier the caller passes.
    pub async fn purge_tier(
        &self,
        tier: DeliveryTier,
        now: DateTime<Utc>,
    ) -> StoreResult<PurgeOutcome> {
        if tier == DeliveryTier::Tier1 {
            return Ok(PurgeOutcome::default());
        }
        let recent_cutoff = fmt_ts(now - chrono::Duration::days(8));

        let mut tx = self.pool.begin().await?;
        let bytes: Option<i64> = sqlx::query_scalar(
            "SELECT SUM(LENGTH(data) + LENGTH(id) + 64) FROM deliveries
             WHERE tier = ?1 AND status != 'pending_sync' AND delivered_at <= ?2",
        )
        .bind(tier.as_i64())
        .bind(&recent_cutoff)
        .fetch_one(&mut *tx)
        .await?;
        let result = sqlx::query(
            "DELETE FROM deliveries
             WHERE tier = ?1 AND status != 'pending_sync' AND delivered_at <= ?2",
        )
        .bind(tier.as_i64())
        .bind(&recent_cutoff)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        let outcome = PurgeOutcome {
            rows_deleted: result.rows_affected(),
            bytes_freed: bytes.unwrap_or(0).max(0) as u64,
        };
        if outcome.rows_deleted > 0 {
            info!(
                tier = tier.as_i64(),
                rows = outcome.rows_deleted,
                bytes = outcome.bytes_freed,
                "Delivery tier purged"
            );
        }
        Ok(outcome)
    }

    /// Ids that a purge of this tier would delete right now.
    pub async fn evictable_ids(
        &self,
        tier: DeliveryTier,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<String>> {
        if tier == DeliveryTier::Tier1 {
            return Ok(Vec::new());
        }
        let recent_cutoff = fmt_ts(now - chrono::Duration::days(8));
        let rows = sqlx::query(
            "SELECT id FROM deliveries
             WHERE tier = ?1 AND status != 'pending_sync' AND delivered_at <= ?2
             ORDER BY delivered_at ASC, id ASC",
        )
        .bind(tier.as_i64())
        .bind(&recent_cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get::<String, _>("id")).collect())
    }

    pub async fn count_pending_sync(&self) -> StoreResult<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM deliveries WHERE status = 'pending_sync'")
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }

    /// Unconditional wipe; only the logout path uses this (pending local
    /// edits live on in `ops_queue`).
    pub async fn clear_all(&self) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM deliveries").execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

pub(crate) async fn put_in_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    record: &DeliveryRecord,
) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO deliveries (id, cooperative_id, planteur_id, delivered_at, data, tier,
             status, updated_at, cached_at, synced_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(id) DO UPDATE SET
             cooperative_id = excluded.cooperative_id,
             planteur_id = excluded.planteur_id,
             delivered_at = excluded.delivered_at,
             data = excluded.data,
             tier = excluded.tier,
             status = excluded.status,
             updated_at = excluded.updated_at,
             cached_at = excluded.cached_at,
             synced_at = excluded.synced_at",
    )
    .bind(&record.id)
    .bind(record.cooperative_id.as_str())
    .bind(&record.planteur_id)
    .bind(fmt_ts(record.delivered_at))
    .bind(record.data.to_string())
    .bind(record.tier.as_i64())
    .bind(record.status.as_str())
    .bind(fmt_ts(record.updated_at))
    .bind(fmt_ts(record.cached_at))
    .bind(record.synced_at.map(fmt_ts))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn map_row(row: &SqliteRow) -> StoreResult<DeliveryRecord> {
    let cooperative_id: String = row.get("cooperative_id");
    let status: String = row.get("status");
    let tier: i64 = row.get("tier");
    let data: String = row.get("data");

    Ok(DeliveryRecord {
        id: row.get("id"),
        cooperative_id: cooperative_id.parse().map_err(|_| {
            StoreError::corrupt("deliveries", "cooperative_id", cooperative_id.clone())
        })?,
        planteur_id: row.get("planteur_id"),
        delivered_at: parse_ts(
            "deliveries",
            "delivered_at",
            &row.get::<String, _>("delivered_at"),
        )?,
        data: serde_json::from_str(&data)?,
        tier: DeliveryTier::from_i64(tier)
            .ok_or_else(|| StoreError::corrupt("deliveries", "tier", tier.to_string()))?,
        status: RecordSyncStatus::from_str(&status)
            .map_err(|_| StoreError::corrupt("deliveries", "status", status.clone()))?,
        updated_at: parse_ts("deliveries", "updated_at", &row.get::<String, _>("updated_at"))?,
        cached_at: parse_ts("deliveries", "cached_at", &row.get::<String, _>("cached_at"))?,
        synced_at: parse_opt_ts("deliveries", "synced_at", row.get("synced_at"))?,
    })
}
