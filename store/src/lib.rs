//! # CocoaTrack Offline Store
//!
//! The embedded, versioned SQLite store backing the offline cache: entity
//! tables, the tiered delivery cache, the operation queue, delta cursors,
//! a bounded error log and app state — plus the durable sidecar that
//! survives store deletion (queue backup, migration errors, id mappings,
//! upload config).

pub mod app_state;
pub mod cursors;
pub mod deliveries;
pub mod entities;
pub mod error;
pub mod error_log;
pub mod id_map;
pub mod ops;
pub mod schema;
pub mod sidecar;
mod time;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ct_core::types::{CachedEntity, DeliveryRecord, EntityTable, SyncCursor};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use tracing::{info, warn};

pub use crate::app_state::AppState;
pub use crate::cursors::CursorTable;
pub use crate::deliveries::{DeliveryCache, PurgeOutcome};
pub use crate::entities::{EntityStore, PlanteurStats};
pub use crate::error::{StoreError, StoreResult};
pub use crate::error_log::ErrorLog;
pub use crate::id_map::IdMap;
pub use crate::ops::{OpsTable, QueueStats};
pub use crate::schema::SCHEMA_VERSION;
pub use crate::sidecar::{MigrationErrorRecord, Sidecar};

/// Name of the embedded store, also the database file stem.
pub const STORE_NAME: &str = "cocoatrack-offline";

/// Per-table record counts, for diagnostics and the fallback size
/// estimator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableCounts {
    pub planteurs: u64,
    pub chef_planteurs: u64,
    pub warehouses: u64,
    pub deliveries: u64,
    pub ops_queue: u64,
    pub error_log: u64,
}

impl TableCounts {
    #[must_use]
    pub fn total_records(&self) -> u64 {
        self.planteurs
            + self.chef_planteurs
            + self.warehouses
            + self.deliveries
            + self.ops_queue
            + self.error_log
    }
}

/// Handle over the opened store. Cloning is cheap; all clones share the
/// pool and the id-mapping mirror.
#[derive(Clone)]
pub struct OfflineStore {
    pool: SqlitePool,
    sidecar: Sidecar,
    id_map: Arc<IdMap>,
    db_path: PathBuf,
    max_error_logs: usize,
}

impl OfflineStore {
    /// Open (or create) the store under `dir`, running the migration
    /// pipeline. A post-migration integrity failure triggers one rebuild
    /// from a fresh schema with the queue restored from its backup; a
    /// second consecutive failure is fatal.
    pub async fn open(dir: &Path, max_error_logs: usize) -> StoreResult<Self> {
        tokio::fs::create_dir_all(dir).await?;
        let sidecar = Sidecar::open(&dir.join("sidecar")).await?;
        let db_path = dir.join(format!("{STORE_NAME}.db"));

        let pool = schema::open_pool(&db_path).await?;
        schema::migrate(&pool, &sidecar).await?;

        let missing = schema::missing_objects(&pool).await?;
        let pool = if missing.is_empty() {
            pool
        } else {
            warn!(?missing, "Store integrity check failed, rebuilding from fresh schema");
            Self::rebuild(pool, &db_path, &sidecar).await?
        };

        // Restore any queue backup a rebuild (or an earlier crash between
        // backup and upgrade commit) left behind, then drop it together
        // with any stale migration-error record.
        let ops = OpsTable::new(pool.clone());
        if let Some(backup) = sidecar.load_queue_backup().await? {
            let restored = ops.restore(&backup).await?;
            info!(restored, backed_up = backup.len(), "Queue backup restored");
        }
        sidecar.clear_queue_backup().await?;
        sidecar.clear_migration_error().await?;

        let id_map = Arc::new(IdMap::load(sidecar.clone()).await?);
        Ok(Self {
            pool,
            sidecar,
            id_map,
            db_path,
            max_error_logs,
        })
    }

    async fn rebuild(
        old_pool: SqlitePool,
        db_path: &Path,
        sidecar: &Sidecar,
    ) -> StoreResult<SqlitePool> {
        old_pool.close().await;
        remove_db_files(db_path).await?;

        let pool = schema::open_pool(db_path).await?;
        schema::migrate(&pool, sidecar).await?;

        let missing = schema::missing_objects(&pool).await?;
        if !missing.is_empty() {
            sidecar
                .save_migration_error(&MigrationErrorRecord {
                    timestamp: chrono::Utc::now(),
                    message: format!("rebuild left schema incomplete: missing {missing:?}"),
                    context: None,
                })
                .await?;
            return Err(StoreError::Integrity { missing });
        }
        Ok(pool)
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    /// Delete the embedded store. The sidecar is left in place; it must
    /// survive store deletion.
    pub async fn destroy(self) -> StoreResult<()> {
        let db_path = self.db_path.clone();
        self.pool.close().await;
        remove_db_files(&db_path).await
    }

    /// User-initiated reset: back the queue up, delete the store, reopen
    /// fresh. Only the queue backup is carried over.
    pub async fn reset(self) -> StoreResult<Self> {
        let dir = self
            .db_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let max_error_logs = self.max_error_logs;

        let backup = self.ops().all().await?;
        self.sidecar.save_queue_backup(&backup).await?;
        self.sidecar.clear_migration_error().await?;
        info!(ops = backup.len(), "Resetting store");
        self.destroy().await?;

        Self::open(&dir, max_error_logs).await
    }

    // Table handles

    #[must_use]
    pub fn ops(&self) -> OpsTable {
        OpsTable::new(self.pool.clone())
    }

    #[must_use]
    pub fn entities(&self) -> EntityStore {
        EntityStore::new(self.pool.clone())
    }

    #[must_use]
    pub fn deliveries(&self) -> DeliveryCache {
        DeliveryCache::new(self.pool.clone())
    }

    #[must_use]
    pub fn cursors(&self) -> CursorTable {
        CursorTable::new(self.pool.clone())
    }

    #[must_use]
    pub fn error_log(&self) -> ErrorLog {
        ErrorLog::new(self.pool.clone(), self.max_error_logs)
    }

    #[must_use]
    pub fn app_state(&self) -> AppState {
        AppState::new(self.pool.clone())
    }

    #[must_use]
    pub fn id_map(&self) -> &IdMap {
        &self.id_map
    }

    #[must_use]
    pub fn sidecar(&self) -> &Sidecar {
        &self.sidecar
    }

    /// Persist one entity delta page and advance the cursor, atomically:
    /// the cursor never moves past records that did not land.
    pub async fn apply_entity_delta(
        &self,
        table: EntityTable,
        records: &[CachedEntity],
        cursor: &SyncCursor,
    ) -> StoreResult<()> {
        let name = match table {
            EntityTable::Planteurs => "planteurs",
            EntityTable::ChefPlanteurs => "chef_planteurs",
            EntityTable::Warehouses => "warehouses",
            EntityTable::Deliveries => {
                return Err(StoreError::InvalidTable("deliveries".to_string()));
            }
        };
        let mut tx = self.pool.begin().await?;
        for record in records {
            entities::put_in_tx(&mut tx, name, record).await?;
        }
        cursors::put_in_tx(&mut tx, cursor).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Delivery counterpart of [`Self::apply_entity_delta`].
    pub async fn apply_delivery_delta(
        &self,
        records: &[DeliveryRecord],
        cursor: &SyncCursor,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            deliveries::put_in_tx(&mut tx, record).await?;
        }
        cursors::put_in_tx(&mut tx, cursor).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Logout wipe: clear every cache, keep `ops_queue`, the error log and
    /// the sidecar. Cursors reset with the caches they bookmark.
    pub async fn wipe_caches(&self) -> StoreResult<u64> {
        let entities = self.entities();
        let mut cleared = 0;
        for table in [
            EntityTable::Planteurs,
            EntityTable::ChefPlanteurs,
            EntityTable::Warehouses,
        ] {
            cleared += entities.clear(table).await?;
        }
        cleared += self.deliveries().clear_all().await?;
        self.cursors().clear_all().await?;
        info!(cleared, "Caches wiped, queue preserved");
        Ok(cleared)
    }

    pub async fn counts(&self) -> StoreResult<TableCounts> {
        let entities = self.entities();
        Ok(TableCounts {
            planteurs: entities.count(EntityTable::Planteurs).await?,
            chef_planteurs: entities.count(EntityTable::ChefPlanteurs).await?,
            warehouses: entities.count(EntityTable::Warehouses).await?,
            deliveries: self.deliveries().count().await?,
            ops_queue: self.ops().count().await?,
            error_log: self.error_log().count().await?,
        })
    }

    /// Conservative on-disk size: the database file when readable, floored
    /// by a 1 KiB-per-record estimate.
    pub async fn estimated_size_bytes(&self) -> StoreResult<u64> {
        let record_estimate = self.counts().await?.total_records() * 1024;
        let file_size = match tokio::fs::metadata(&self.db_path).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        Ok(file_size.max(record_estimate))
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }
}

async fn remove_db_files(db_path: &Path) -> StoreResult<()> {
    for suffix in ["", "-wal", "-shm"] {
        let path = PathBuf::from(format!("{}{suffix}", db_path.display()));
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ct_core::types::{
        DeliveryTier, OperationStatus, OperationType, Priority, QueuedOperation, RecordSyncStatus,
    };

    async fn open_store(dir: &Path) -> OfflineStore {
        OfflineStore::open(dir, 100).await.unwrap()
    }

    fn entity(id: &str, name: &str) -> CachedEntity {
        CachedEntity {
            id: id.to_string(),
            cooperative_id: "coop-1".parse().unwrap(),
            code: Some(format!("code-{id}")),
            name: name.to_string(),
            name_norm: String::new(),
            chef_planteur_id: None,
            surface_ha: None,
            data: serde_json::json!({"name": name}),
            validation_warnings: Vec::new(),
            updated_at: Utc::now(),
            cached_at: Utc::now(),
            synced_at: None,
        }
    }

    fn delivery(id: &str, days_old: i64, status: RecordSyncStatus) -> DeliveryRecord {
        let delivered_at = Utc::now() - chrono::Duration::days(days_old);
        DeliveryRecord {
            id: id.to_string(),
            cooperative_id: "coop-1".parse().unwrap(),
            planteur_id: Some("p-1".to_string()),
            delivered_at,
            data: serde_json::json!({"weight_kg": 100}),
            tier: DeliveryTier::for_age_days(days_old),
            status,
            updated_at: delivered_at,
            cached_at: Utc::now(),
            synced_at: None,
        }
    }

    fn op(id: &str, user: &str) -> QueuedOperation {
        QueuedOperation {
            id: id.to_string(),
            idempotency_key: format!("key-{id}"),
            op_type: OperationType::Create,
            table: EntityTable::Deliveries,
            record_id: id.to_string(),
            client_id: id.to_string(),
            server_id: None,
            user_id: user.parse().unwrap(),
            cooperative_id: "coop-1".parse().unwrap(),
            data: serde_json::json!({"weight_kg": 10}),
            base_snapshot: None,
            base_updated_at: None,
            row_version: None,
            priority: Priority::Critical,
            status: OperationStatus::Pending,
            retry_count: 0,
            last_attempt_at: None,
            next_retry_at: None,
            created_at: Utc::now(),
            queued_at: Utc::now(),
            error: None,
            conflict_info: None,
        }
    }

    #[tokio::test]
    async fn test_open_reaches_current_schema() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        assert_eq!(
            schema::current_version(&store.pool).await.unwrap(),
            SCHEMA_VERSION
        );
        store.close().await;
    }

    #[tokio::test]
    async fn test_entity_round_trip_and_name_norm() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        store
            .entities()
            .put(EntityTable::Planteurs, &entity("p-1", "Kouamé  Adjoua"))
            .await
            .unwrap();
        let loaded = store
            .entities()
            .get(EntityTable::Planteurs, "p-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.name, "Kouamé  Adjoua");
        assert_eq!(loaded.name_norm, "kouame adjoua");

        let hits = store
            .entities()
            .search_prefix(EntityTable::Planteurs, "KOUA", 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn test_wipe_preserves_queue() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        store
            .entities()
            .put(EntityTable::Planteurs, &entity("p-1", "A"))
            .await
            .unwrap();
        store
            .deliveries()
            .put(&delivery("d-1", 2, RecordSyncStatus::Synced))
            .await
            .unwrap();
        store.ops().insert(&op("op-1", "agent-a")).await.unwrap();

        store.wipe_caches().await.unwrap();

        let counts = store.counts().await.unwrap();
        assert_eq!(counts.planteurs, 0);
        assert_eq!(counts.deliveries, 0);
        assert_eq!(counts.ops_queue, 1);
    }

    #[tokio::test]
    async fn test_reset_restores_only_queue() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        store.ops().insert(&op("op-1", "agent-a")).await.unwrap();
        store
            .entities()
            .put(EntityTable::Warehouses, &entity("w-1", "Entrepôt Nord"))
            .await
            .unwrap();

        let store = store.reset().await.unwrap();
        let counts = store.counts().await.unwrap();
        assert_eq!(counts.ops_queue, 1);
        assert_eq!(counts.warehouses, 0);
        // Backup consumed on successful reopen.
        assert!(store.sidecar().load_queue_backup().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delta_batch_is_atomic_with_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        let now = Utc::now();
        let cursor = SyncCursor {
            table: EntityTable::Planteurs,
            last_updated_at: now,
            last_id: "p-2".to_string(),
            record_count: 2,
            last_sync_at: Some(now),
            last_full_sync_at: None,
        };
        store
            .apply_entity_delta(
                EntityTable::Planteurs,
                &[entity("p-1", "A"), entity("p-2", "B")],
                &cursor,
            )
            .await
            .unwrap();

        assert_eq!(store.entities().count(EntityTable::Planteurs).await.unwrap(), 2);
        let stored = store
            .cursors()
            .get(EntityTable::Planteurs)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.last_id, "p-2");
        assert_eq!(stored.record_count, 2);
    }

    #[tokio::test]
    async fn test_purge_never_touches_pending_sync() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        store
            .deliveries()
            .put_batch(&[
                delivery("d-old", 60, RecordSyncStatus::Synced),
                delivery("d-dirty", 60, RecordSyncStatus::PendingSync),
                delivery("d-new", 2, RecordSyncStatus::Synced),
            ])
            .await
            .unwrap();

        let outcome = store
            .deliveries()
            .purge_tier(DeliveryTier::Tier3, Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome.rows_deleted, 1);
        assert!(outcome.bytes_freed > 0);

        assert!(store.deliveries().get("d-old").await.unwrap().is_none());
        assert!(store.deliveries().get("d-dirty").await.unwrap().is_some());
        assert!(store.deliveries().get("d-new").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_error_log_ring_caps_at_limit() {
        let dir = tempfile::tempdir().unwrap();
        let store = OfflineStore::open(dir.path(), 5).await.unwrap();

        for i in 0..8 {
            store
                .error_log()
                .append(
                    ct_core::types::ErrorKind::Sync,
                    "SYNC_FAILED",
                    &format!("failure {i}"),
                    None,
                )
                .await
                .unwrap();
        }
        assert_eq!(store.error_log().count().await.unwrap(), 5);
        let recent = store.error_log().recent(10).await.unwrap();
        assert_eq!(recent.len(), 5);
        // Newest retained.
        assert!(recent[0].message.contains('7'));
    }

    #[tokio::test]
    async fn test_planteur_stats_partition() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let entities = store.entities();

        let mut assigned_surface = 0.0;
        let mut total_surface = 0.0;
        for i in 0..10 {
            let mut planteur = entity(&format!("p-{i}"), &format!("Planteur {i}"));
            planteur.surface_ha = Some(1.5 + i as f64);
            total_surface += 1.5 + i as f64;
            if i % 3 == 0 {
                planteur.chef_planteur_id = Some("chef-1".to_string());
                assigned_surface += 1.5 + i as f64;
            }
            entities.put(EntityTable::Planteurs, &planteur).await.unwrap();
        }

        let stats = entities.planteur_stats(None).await.unwrap();
        assert_eq!(stats.total, 10);
        assert_eq!(stats.assigned, 4);
        assert_eq!(stats.total, stats.assigned + stats.orphan);
        assert!((stats.total_surface_ha - total_surface).abs() < 0.01);
        assert!(
            (stats.total_surface_ha - stats.assigned_surface_ha - stats.orphan_surface_ha).abs()
                < 0.01
        );
        assert!((stats.assigned_surface_ha - assigned_surface).abs() < 0.01);

        let scoped = entities
            .planteur_stats(Some(&"coop-1".parse().unwrap()))
            .await
            .unwrap();
        assert_eq!(scoped.total, 10);
        let other = entities
            .planteur_stats(Some(&"coop-2".parse().unwrap()))
            .await
            .unwrap();
        assert_eq!(other.total, 0);
    }

    #[tokio::test]
    async fn test_reopen_preserves_queue_and_tier1_counts() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        store.ops().insert(&op("op-1", "agent-a")).await.unwrap();
        store
            .entities()
            .put(EntityTable::Planteurs, &entity("p-1", "A"))
            .await
            .unwrap();
        store
            .entities()
            .put(EntityTable::Warehouses, &entity("w-1", "B"))
            .await
            .unwrap();
        let before = store.counts().await.unwrap();
        store.close().await;

        let store = open_store(dir.path()).await;
        let after = store.counts().await.unwrap();
        assert_eq!(before.ops_queue, after.ops_queue);
        assert_eq!(before.planteurs, after.planteurs);
        assert_eq!(before.warehouses, after.warehouses);
        assert_eq!(before.chef_planteurs, after.chef_planteurs);
    }

    #[tokio::test]
    async fn test_queue_stats_and_batch_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let ops = store.ops();

        let mut low = op("op-low", "agent-a");
        low.priority = Priority::Low;
        low.created_at = Utc::now() - chrono::Duration::minutes(10);
        let mut critical = op("op-critical", "agent-a");
        critical.priority = Priority::Critical;
        critical.created_at = Utc::now() - chrono::Duration::minutes(1);
        let mut high_old = op("op-high-old", "agent-a");
        high_old.priority = Priority::High;
        high_old.created_at = Utc::now() - chrono::Duration::minutes(9);
        let mut high_new = op("op-high-new", "agent-a");
        high_new.priority = Priority::High;
        high_new.created_at = Utc::now() - chrono::Duration::minutes(2);

        for o in [&low, &critical, &high_old, &high_new] {
            ops.insert(o).await.unwrap();
        }

        let batch = ops.next_batch(10, Utc::now()).await.unwrap();
        let ids: Vec<&str> = batch.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, ["op-critical", "op-high-old", "op-high-new", "op-low"]);

        let stats = ops.stats().await.unwrap();
        assert_eq!(stats.pending, 4);
        assert_eq!(stats.total(), 4);
        assert!(stats.oldest_pending_at.is_some());
    }
}
