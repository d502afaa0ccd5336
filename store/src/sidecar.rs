//! Durable key/value sidecar, held outside the embedded store.
//!
//! The queue backup, the migration-error record, the id-mapping mirror and
//! the upload config must survive deletion of the SQLite file, so they
//! live as JSON files in their own directory.

use chrono::{DateTime, Utc};
use ct_core::types::{IdMapping, QueuedOperation};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::StoreResult;

const QUEUE_BACKUP_FILE: &str = "queue_backup.json";
const MIGRATION_ERROR_FILE: &str = "migration_error.json";
const ID_MAP_FILE: &str = "id_map.json";
const UPLOAD_CONFIG_FILE: &str = "upload_config.json";

/// Persisted record of a failed migration, for the diagnostics surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub context: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct Sidecar {
    dir: PathBuf,
}

impl Sidecar {
    pub async fn open(dir: &Path) -> StoreResult<Self> {
        tokio::fs::create_dir_all(dir).await?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    async fn read_json<T: serde::de::DeserializeOwned>(&self, file: &str) -> StoreResult<Option<T>> {
        match tokio::fs::read(self.path(file)).await {
            Ok(data) => match serde_json::from_slice(&data) {
                Ok(value) => Ok(Some(value)),
                Err(e) => {
                    warn!(file, error = %e, "Unreadable sidecar record, treating as absent");
                    Ok(None)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_json<T: Serialize>(&self, file: &str, value: &T) -> StoreResult<()> {
        let data = serde_json::to_vec_pretty(value)?;
        let tmp = self.path(&format!("{file}.tmp"));
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, self.path(file)).await?;
        Ok(())
    }

    async fn remove(&self, file: &str) -> StoreResult<()> {
        match tokio::fs::remove_file(self.path(file)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // Queue backup

    pub async fn save_queue_backup(&self, ops: &[QueuedOperation]) -> StoreResult<()> {
        debug!(count = ops.len(), "Writing queue backup");
        self.write_json(QUEUE_BACKUP_FILE, &ops).await
    }

    pub async fn load_queue_backup(&self) -> StoreResult<Option<Vec<QueuedOperation>>> {
        self.read_json(QUEUE_BACKUP_FILE).await
    }

    pub async fn clear_queue_backup(&self) -> StoreResult<()> {
        self.remove(QUEUE_BACKUP_FILE).await
    }

    // Migration error record

    pub async fn save_migration_error(&self, record: &MigrationErrorRecord) -> StoreResult<()> {
        self.write_json(MIGRATION_ERROR_FILE, record).await
    }

    pub async fn load_migration_error(&self) -> StoreResult<Option<MigrationErrorRecord>> {
        self.read_json(MIGRATION_ERROR_FILE).await
    }

    pub async fn clear_migration_error(&self) -> StoreResult<()> {
        self.remove(MIGRATION_ERROR_FILE).await
    }

    // Id-mapping mirror

    pub async fn save_id_mappings(&self, mappings: &[IdMapping]) -> StoreResult<()> {
        self.write_json(ID_MAP_FILE, &mappings).await
    }

    pub async fn load_id_mappings(&self) -> StoreResult<Vec<IdMapping>> {
        Ok(self.read_json(ID_MAP_FILE).await?.unwrap_or_default())
    }

    // Upload config (opaque)

    pub async fn save_upload_config(&self, value: &serde_json::Value) -> StoreResult<()> {
        self.write_json(UPLOAD_CONFIG_FILE, value).await
    }

    pub async fn load_upload_config(&self) -> StoreResult<Option<serde_json::Value>> {
        self.read_json(UPLOAD_CONFIG_FILE).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ct_core::types::{EntityTable, OperationStatus, OperationType, Priority};

    fn sample_op(id: &str) -> QueuedOperation {
        QueuedOperation {
            id: id.to_string(),
            idempotency_key: format!("key-{id}"),
            op_type: OperationType::Create,
            table: EntityTable::Deliveries,
            record_id: id.to_string(),
            client_id: id.to_string(),
            server_id: None,
            user_id: "agent-1".parse().unwrap(),
            cooperative_id: "coop-1".parse().unwrap(),
            data: serde_json::json!({"weight_kg": 50}),
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
    async fn test_queue_backup_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let sidecar = Sidecar::open(dir.path()).await.unwrap();

        assert!(sidecar.load_queue_backup().await.unwrap().is_none());

        let ops = vec![sample_op("a"), sample_op("b")];
        sidecar.save_queue_backup(&ops).await.unwrap();

        let loaded = sidecar.load_queue_backup().await.unwrap().unwrap();
        assert_eq!(loaded, ops);

        sidecar.clear_queue_backup().await.unwrap();
        assert!(sidecar.load_queue_backup().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_migration_error_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let sidecar = Sidecar::open(dir.path()).await.unwrap();

        let record = MigrationErrorRecord {
            timestamp: Utc::now(),
            message: "upgrade transaction failed".to_string(),
            context: Some(serde_json::json!({"from": 3, "to": 4})),
        };
        sidecar.save_migration_error(&record).await.unwrap();
        assert_eq!(
            sidecar.load_migration_error().await.unwrap().unwrap(),
            record
        );

        sidecar.clear_migration_error().await.unwrap();
        assert!(sidecar.load_migration_error().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_record_treated_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let sidecar = Sidecar::open(dir.path()).await.unwrap();

        tokio::fs::write(dir.path().join(QUEUE_BACKUP_FILE), b"{not json")
            .await
            .unwrap();
        assert!(sidecar.load_queue_backup().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_id_mappings_default_empty() {
        let dir = tempfile::tempdir().unwrap();
        let sidecar = Sidecar::open(dir.path()).await.unwrap();
        assert!(sidecar.load_id_mappings().await.unwrap().is_empty());
    }
}
