//! Delta-sync cursor protocol: incremental server-to-client replication
//! with a `(updated_at, id)` total order and page-at-a-time cursor
//! advancement.
//!
//! The cursor only moves when a page has been fully persisted, so a crash
//! between fetch and write re-fetches the same page instead of skipping
//! it.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use config::DeltaConfig;
use ct_core::traits::{DeltaRecord, SyncTransport};
use ct_core::types::{
    CachedEntity, DeliveryRecord, DeliveryTier, EntityTable, RecordSyncStatus, SyncCursor,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use store::OfflineStore;
use tracing::{debug, info, warn};

use crate::error::SyncResult;

/// Tables always replicated (server-side sync Tier 1).
pub const TIER1_TABLES: [EntityTable; 3] = [
    EntityTable::Planteurs,
    EntityTable::ChefPlanteurs,
    EntityTable::Warehouses,
];

/// Outcome of replicating one table to the current server head.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaOutcome {
    pub table: EntityTable,
    pub fetched: u64,
    pub skipped: u64,
    pub pages: u64,
    pub cursor: SyncCursor,
}

pub struct DeltaSyncManager {
    store: OfflineStore,
    transport: Arc<dyn SyncTransport>,
    config: DeltaConfig,
}

impl DeltaSyncManager {
    #[must_use]
    pub fn new(store: OfflineStore, transport: Arc<dyn SyncTransport>, config: DeltaConfig) -> Self {
        Self {
            store,
            transport,
            config,
        }
    }

    /// Replicate one table until the server has no more pages. `batch`
    /// overrides the default page size, clamped to the hard cap.
    pub async fn sync_table(
        &self,
        table: EntityTable,
        batch: Option<usize>,
    ) -> SyncResult<DeltaOutcome> {
        let limit = self.config.clamp_batch(batch);
        let mut outcome = DeltaOutcome {
            table,
            fetched: 0,
            skipped: 0,
            pages: 0,
            cursor: self.store.cursors().get_or_epoch(table).await?,
        };
        let started_from_epoch = outcome.cursor.last_sync_at.is_none()
            || outcome.cursor.last_updated_at == DateTime::<Utc>::UNIX_EPOCH;

        loop {
            let cursor = &outcome.cursor;
            let page = self
                .transport
                .fetch_delta(table, cursor.last_updated_at, &cursor.last_id, limit)
                .await?;
            let returned = page.records.len();
            let now = Utc::now();

            if returned == 0 {
                // Nothing new: still stamp the sync time so staleness
                // tracking sees this pass.
                let mut cursor = outcome.cursor.clone();
                cursor.last_sync_at = Some(now);
                if started_from_epoch && outcome.pages == 0 {
                    cursor.last_full_sync_at = Some(now);
                }
                self.store.cursors().put(&cursor).await?;
                outcome.cursor = cursor;
                break;
            }

            let last = &page.records[returned - 1];
            let mut cursor = outcome.cursor.clone();
            cursor.last_updated_at = last.updated_at;
            cursor.last_id = last.id.clone();
            cursor.last_sync_at = Some(now);

            let persisted = match table {
                EntityTable::Deliveries => {
                    let (records, skipped) = self.map_deliveries(&page.records, now);
                    outcome.skipped += skipped;
                    cursor.record_count += records.len() as i64;
                    self.store.apply_delivery_delta(&records, &cursor).await?;
                    records.len()
                }
                _ => {
                    let (records, skipped) = self.map_entities(table, &page.records, now);
                    outcome.skipped += skipped;
                    cursor.record_count += records.len() as i64;
                    self.store.apply_entity_delta(table, &records, &cursor).await?;
                    records.len()
                }
            };
            outcome.cursor = cursor;
            outcome.fetched += persisted as u64;
            outcome.pages += 1;
            debug!(
                table = table.as_str(),
                page = outcome.pages,
                returned,
                persisted,
                "Delta page persisted"
            );

            let has_more = returned >= limit;
            if !has_more {
                if started_from_epoch {
                    let mut cursor = outcome.cursor.clone();
                    cursor.last_full_sync_at = Some(Utc::now());
                    self.store.cursors().put(&cursor).await?;
                    outcome.cursor = cursor;
                }
                break;
            }
        }

        info!(
            table = table.as_str(),
            fetched = outcome.fetched,
            pages = outcome.pages,
            skipped = outcome.skipped,
            "Delta sync completed"
        );
        Ok(outcome)
    }

    /// Replicate all Tier-1 tables.
    pub async fn sync_tier1(&self) -> SyncResult<Vec<DeltaOutcome>> {
        let mut outcomes = Vec::with_capacity(TIER1_TABLES.len());
        for table in TIER1_TABLES {
            outcomes.push(self.sync_table(table, None).await?);
        }
        Ok(outcomes)
    }

    /// Reset one table's cursor to the epoch, forcing a full resync.
    pub async fn reset(&self, table: EntityTable) -> SyncResult<()> {
        self.store.cursors().reset(table).await?;
        Ok(())
    }

    /// Tables whose cursor is older than the staleness window (or that
    /// never synced).
    pub async fn stale_tables(&self, now: DateTime<Utc>) -> SyncResult<Vec<EntityTable>> {
        let window = Duration::hours(self.config.cursor_staleness_hours as i64);
        let mut stale = Vec::new();
        for table in EntityTable::ALL {
            let cursor = self.store.cursors().get_or_epoch(table).await?;
            if cursor.is_stale(now, window) {
                stale.push(table);
            }
        }
        Ok(stale)
    }

    /// Background resync of every stale table.
    pub async fn resync_stale(&self) -> SyncResult<Vec<DeltaOutcome>> {
        let stale = self.stale_tables(Utc::now()).await?;
        let mut outcomes = Vec::with_capacity(stale.len());
        for table in stale {
            outcomes.push(self.sync_table(table, None).await?);
        }
        Ok(outcomes)
    }

    fn map_entities(
        &self,
        table: EntityTable,
        records: &[DeltaRecord],
        now: DateTime<Utc>,
    ) -> (Vec<CachedEntity>, u64) {
        let mut entities = Vec::with_capacity(records.len());
        let mut skipped = 0;
        for record in records {
            match entity_from_delta(record, now) {
                Some(entity) => entities.push(entity),
                None => {
                    warn!(
                        table = table.as_str(),
                        id = %record.id,
                        "Skipping malformed delta record"
                    );
                    skipped += 1;
                }
            }
        }
        (entities, skipped)
    }

    fn map_deliveries(
        &self,
        records: &[DeltaRecord],
        now: DateTime<Utc>,
    ) -> (Vec<DeliveryRecord>, u64) {
        let mut deliveries = Vec::with_capacity(records.len());
        let mut skipped = 0;
        for record in records {
            match delivery_from_delta(record, now) {
                Some(delivery) => deliveries.push(delivery),
                None => {
                    warn!(id = %record.id, "Skipping malformed delivery delta record");
                    skipped += 1;
                }
            }
        }
        (deliveries, skipped)
    }
}

fn string_field(data: &Value, key: &str) -> Option<String> {
    data.get(key).and_then(Value::as_str).map(str::to_string)
}

fn entity_from_delta(record: &DeltaRecord, now: DateTime<Utc>) -> Option<CachedEntity> {
    let data = &record.data;
    let cooperative_id = string_field(data, "cooperative_id")?.parse().ok()?;
    let name = string_field(data, "name")?;
    Some(CachedEntity {
        id: record.id.clone(),
        cooperative_id,
        code: string_field(data, "code"),
        name_norm: utils::normalize_name(&name),
        name,
        chef_planteur_id: string_field(data, "chef_planteur_id"),
        surface_ha: data.get("surface_ha").and_then(Value::as_f64),
        data: data.clone(),
        validation_warnings: Vec::new(),
        updated_at: record.updated_at,
        cached_at: now,
        synced_at: Some(now),
    })
}

fn delivery_from_delta(record: &DeltaRecord, now: DateTime<Utc>) -> Option<DeliveryRecord> {
    let data = &record.data;
    let cooperative_id = string_field(data, "cooperative_id")?.parse().ok()?;
    let delivered_at = string_field(data, "delivered_at")
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))?;
    let age_days = (now - delivered_at).num_days();
    Some(DeliveryRecord {
        id: record.id.clone(),
        cooperative_id,
        planteur_id: string_field(data, "planteur_id"),
        delivered_at,
        data: data.clone(),
        tier: DeliveryTier::for_age_days(age_days),
        status: RecordSyncStatus::Synced,
        updated_at: record.updated_at,
        cached_at: now,
        synced_at: Some(now),
    })
}
