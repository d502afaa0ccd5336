//! Schema versioning and the migration pipeline.
//!
//! The store persists its schema version in `PRAGMA user_version`. Opening
//! runs every missing `v_k -> v_k+1` step inside one upgrade transaction:
//! either the store reaches the current version or it stays at `v_k`.
//! The operation queue is backed up to the sidecar before any step runs.

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::{Executor, Row, Sqlite, Transaction};
use std::path::Path;
use tracing::{info, warn};

use crate::error::{StoreError, StoreResult};
use crate::ops;
use crate::sidecar::{MigrationErrorRecord, Sidecar};

/// Current schema version of the `cocoatrack-offline` store.
pub const SCHEMA_VERSION: u32 = 4;

/// Tables that must exist after migration.
pub const REQUIRED_TABLES: [&str; 8] = [
    "planteurs",
    "chef_planteurs",
    "warehouses",
    "deliveries",
    "ops_queue",
    "sync_metadata",
    "error_log",
    "app_state",
];

/// Indexes that must exist after migration.
pub const REQUIRED_INDEXES: [&str; 26] = [
    "idx_planteurs_cooperative",
    "idx_planteurs_code",
    "idx_planteurs_name_norm",
    "idx_planteurs_updated_at",
    "idx_planteurs_chef",
    "idx_chef_planteurs_cooperative",
    "idx_chef_planteurs_code",
    "idx_chef_planteurs_name_norm",
    "idx_chef_planteurs_updated_at",
    "idx_warehouses_cooperative",
    "idx_warehouses_code",
    "idx_warehouses_name_norm",
    "idx_warehouses_updated_at",
    "idx_deliveries_date",
    "idx_deliveries_tier",
    "idx_deliveries_updated_at",
    "idx_deliveries_status",
    "idx_ops_queue_idempotency",
    "idx_ops_queue_status",
    "idx_ops_queue_table",
    "idx_ops_queue_created_at",
    "idx_ops_queue_next_retry",
    "idx_ops_queue_user",
    "idx_ops_queue_priority",
    "idx_error_log_timestamp",
    "idx_error_log_kind",
];

pub(crate) async fn open_pool(db_path: &Path) -> StoreResult<SqlitePool> {
    let url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new().max_connections(5).connect(&url).await?;
    pool.execute("PRAGMA foreign_keys = ON").await?;
    Ok(pool)
}

pub(crate) async fn current_version(pool: &SqlitePool) -> StoreResult<u32> {
    let version: i64 = sqlx::query_scalar("PRAGMA user_version").fetch_one(pool).await?;
    Ok(version as u32)
}

async fn set_version(tx: &mut Transaction<'_, Sqlite>, version: u32) -> StoreResult<()> {
    sqlx::query(&format!("PRAGMA user_version = {version}"))
        .execute(&mut **tx)
        .await?;
    Ok(())
}

pub(crate) async fn table_exists(pool: &SqlitePool, name: &str) -> StoreResult<bool> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1")
            .bind(name)
            .fetch_one(pool)
            .await?;
    Ok(count > 0)
}

/// Names of required tables/indexes absent from `sqlite_master`.
pub(crate) async fn missing_objects(pool: &SqlitePool) -> StoreResult<Vec<String>> {
    let rows = sqlx::query("SELECT name FROM sqlite_master WHERE type IN ('table', 'index')")
        .fetch_all(pool)
        .await?;
    let present: std::collections::HashSet<String> =
        rows.iter().map(|r| r.get::<String, _>("name")).collect();

    let mut missing = Vec::new();
    for table in REQUIRED_TABLES {
        if !present.contains(table) {
            missing.push(table.to_string());
        }
    }
    for index in REQUIRED_INDEXES {
        if !present.contains(index) {
            missing.push(index.to_string());
        }
    }
    Ok(missing)
}

/// Run all pending migration steps. Backs the queue up first (when a queue
/// exists), applies every step in one transaction, and records a
/// migration-error sidecar entry if the upgrade fails.
pub(crate) async fn migrate(pool: &SqlitePool, sidecar: &Sidecar) -> StoreResult<()> {
    let from = current_version(pool).await?;
    if from > SCHEMA_VERSION {
        return Err(StoreError::Migration {
            version: from,
            message: format!("store is at v{from}, newer than supported v{SCHEMA_VERSION}"),
        });
    }
    if from == SCHEMA_VERSION {
        return Ok(());
    }

    if from > 0 && table_exists(pool, "ops_queue").await? {
        let backup = ops::read_all_tolerant(pool).await?;
        sidecar.save_queue_backup(&backup).await?;
        info!(count = backup.len(), from, to = SCHEMA_VERSION, "Queue backed up before upgrade");
    }

    let mut tx = pool.begin().await?;
    for step in (from + 1)..=SCHEMA_VERSION {
        if let Err(e) = apply_step(&mut tx, step).await {
            drop(tx);
            let message = format!("step v{} -> v{} failed: {e}", step - 1, step);
            warn!(step, "Migration failed, store stays at v{from}");
            sidecar
                .save_migration_error(&MigrationErrorRecord {
                    timestamp: chrono::Utc::now(),
                    message: message.clone(),
                    context: Some(serde_json::json!({"from": from, "to": SCHEMA_VERSION})),
                })
                .await?;
            return Err(StoreError::Migration {
                version: step,
                message,
            });
        }
    }
    set_version(&mut tx, SCHEMA_VERSION).await?;
    tx.commit().await?;
    info!(from, to = SCHEMA_VERSION, "Store migrated");
    Ok(())
}

async fn apply_step(tx: &mut Transaction<'_, Sqlite>, step: u32) -> StoreResult<()> {
    match step {
        1 => migrate_v1(tx).await,
        2 => migrate_v2(tx).await,
        3 => migrate_v3(tx).await,
        4 => migrate_v4(tx).await,
        other => Err(StoreError::Migration {
            version: other,
            message: "unknown migration step".to_string(),
        }),
    }
}

/// v1: entity tables, the operation queue and per-table sync metadata.
async fn migrate_v1(tx: &mut Transaction<'_, Sqlite>) -> StoreResult<()> {
    for table in ["planteurs", "chef_planteurs", "warehouses"] {
        let extra = if table == "planteurs" {
            "chef_planteur_id TEXT, surface_ha REAL,"
        } else {
            ""
        };
        tx.execute(
            format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    id TEXT PRIMARY KEY,
                    cooperative_id TEXT NOT NULL,
                    code TEXT,
                    name TEXT NOT NULL,
                    name_norm TEXT NOT NULL,
                    {extra}
                    data TEXT NOT NULL,
                    validation_warnings TEXT NOT NULL DEFAULT '[]',
                    updated_at TEXT NOT NULL,
                    cached_at TEXT NOT NULL,
                    synced_at TEXT
                )"
            )
            .as_str(),
        )
        .await?;
        tx.execute(
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_cooperative ON {table}(cooperative_id)"
            )
            .as_str(),
        )
        .await?;
        tx.execute(
            format!("CREATE UNIQUE INDEX IF NOT EXISTS idx_{table}_code ON {table}(code)").as_str(),
        )
        .await?;
        tx.execute(
            format!("CREATE INDEX IF NOT EXISTS idx_{table}_updated_at ON {table}(updated_at)")
                .as_str(),
        )
        .await?;
    }
    tx.execute("CREATE INDEX IF NOT EXISTS idx_planteurs_chef ON planteurs(chef_planteur_id)")
        .await?;

    tx.execute(
        "CREATE TABLE IF NOT EXISTS ops_queue (
            id TEXT PRIMARY KEY,
            idempotency_key TEXT NOT NULL,
            op_type TEXT NOT NULL,
            entity_table TEXT NOT NULL,
            record_id TEXT NOT NULL,
            client_id TEXT NOT NULL,
            server_id TEXT,
            user_id TEXT NOT NULL,
            cooperative_id TEXT NOT NULL,
            data TEXT NOT NULL,
            status TEXT NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_attempt_at TEXT,
            next_retry_at TEXT,
            created_at TEXT NOT NULL,
            queued_at TEXT NOT NULL,
            error TEXT
        )",
    )
    .await?;
    tx.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_ops_queue_idempotency
         ON ops_queue(idempotency_key)",
    )
    .await?;
    tx.execute("CREATE INDEX IF NOT EXISTS idx_ops_queue_status ON ops_queue(status)")
        .await?;
    tx.execute("CREATE INDEX IF NOT EXISTS idx_ops_queue_table ON ops_queue(entity_table)")
        .await?;
    tx.execute("CREATE INDEX IF NOT EXISTS idx_ops_queue_created_at ON ops_queue(created_at)")
        .await?;
    tx.execute("CREATE INDEX IF NOT EXISTS idx_ops_queue_next_retry ON ops_queue(next_retry_at)")
        .await?;

    tx.execute(
        "CREATE TABLE IF NOT EXISTS sync_metadata (
            entity_table TEXT PRIMARY KEY,
            last_updated_at TEXT NOT NULL,
            last_id TEXT NOT NULL DEFAULT '',
            record_count INTEGER NOT NULL DEFAULT 0,
            last_sync_at TEXT,
            last_full_sync_at TEXT
        )",
    )
    .await?;
    Ok(())
}

/// v2: the tiered delivery cache.
async fn migrate_v2(tx: &mut Transaction<'_, Sqlite>) -> StoreResult<()> {
    tx.execute(
        "CREATE TABLE IF NOT EXISTS deliveries (
            id TEXT PRIMARY KEY,
            cooperative_id TEXT NOT NULL,
            planteur_id TEXT,
            delivered_at TEXT NOT NULL,
            data TEXT NOT NULL,
            tier INTEGER NOT NULL DEFAULT 1,
            status TEXT NOT NULL DEFAULT 'synced',
            updated_at TEXT NOT NULL,
            cached_at TEXT NOT NULL,
            synced_at TEXT
        )",
    )
    .await?;
    tx.execute("CREATE INDEX IF NOT EXISTS idx_deliveries_date ON deliveries(delivered_at)")
        .await?;
    tx.execute("CREATE INDEX IF NOT EXISTS idx_deliveries_tier ON deliveries(tier)")
        .await?;
    tx.execute("CREATE INDEX IF NOT EXISTS idx_deliveries_updated_at ON deliveries(updated_at)")
        .await?;
    Ok(())
}

/// v3: queue priorities, per-user indexing, error log and app state.
async fn migrate_v3(tx: &mut Transaction<'_, Sqlite>) -> StoreResult<()> {
    tx.execute("ALTER TABLE ops_queue ADD COLUMN priority INTEGER NOT NULL DEFAULT 2")
        .await?;
    tx.execute("CREATE INDEX IF NOT EXISTS idx_ops_queue_priority ON ops_queue(priority)")
        .await?;
    tx.execute("CREATE INDEX IF NOT EXISTS idx_ops_queue_user ON ops_queue(user_id)")
        .await?;

    tx.execute(
        "CREATE TABLE IF NOT EXISTS error_log (
            id TEXT PRIMARY KEY,
            timestamp TEXT NOT NULL,
            kind TEXT NOT NULL,
            code TEXT NOT NULL,
            message TEXT NOT NULL,
            context TEXT,
            stack TEXT
        )",
    )
    .await?;
    tx.execute("CREATE INDEX IF NOT EXISTS idx_error_log_timestamp ON error_log(timestamp)")
        .await?;
    tx.execute("CREATE INDEX IF NOT EXISTS idx_error_log_kind ON error_log(kind)")
        .await?;

    tx.execute(
        "CREATE TABLE IF NOT EXISTS app_state (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
    )
    .await?;
    Ok(())
}

/// v4: three-way-merge base columns, conflict payloads, prefix-search
/// indexes and delivery status indexing.
async fn migrate_v4(tx: &mut Transaction<'_, Sqlite>) -> StoreResult<()> {
    tx.execute("ALTER TABLE ops_queue ADD COLUMN base_snapshot TEXT").await?;
    tx.execute("ALTER TABLE ops_queue ADD COLUMN base_updated_at TEXT").await?;
    tx.execute("ALTER TABLE ops_queue ADD COLUMN row_version INTEGER").await?;
    tx.execute("ALTER TABLE ops_queue ADD COLUMN conflict_info TEXT").await?;

    for table in ["planteurs", "chef_planteurs", "warehouses"] {
        tx.execute(
            format!("CREATE INDEX IF NOT EXISTS idx_{table}_name_norm ON {table}(name_norm)")
                .as_str(),
        )
        .await?;
    }
    tx.execute("CREATE INDEX IF NOT EXISTS idx_deliveries_status ON deliveries(status)")
        .await?;
    Ok(())
}
