//! Local entity manager: wraps inserts, updates and deletes with
//! client-generated UUIDs, `pending_sync` cache state, merge bases and
//! queue enqueue.

use chrono::Utc;
use ct_core::types::{
    CachedEntity, CooperativeId, DeliveryRecord, DeliveryTier, EntityTable, OperationType,
    QueuedOperation, RecordSyncStatus, UserId,
};
use queue::{NewOperation, OperationQueue};
use serde_json::Value;
use store::OfflineStore;
use tracing::debug;

use crate::error::{SyncError, SyncResult};
use crate::validation::{self, ValidationReport};

#[derive(Clone)]
pub struct EntityManager {
    queue: OperationQueue,
    store: OfflineStore,
}

impl EntityManager {
    #[must_use]
    pub fn new(queue: OperationQueue) -> Self {
        let store = queue.store().clone();
        Self { queue, store }
    }

    #[must_use]
    pub fn queue(&self) -> &OperationQueue {
        &self.queue
    }

    /// Create a record locally: validate, assign a client UUID, cache it
    /// as pending and enqueue the CREATE.
    pub async fn create_local(
        &self,
        table: EntityTable,
        data: Value,
        user_id: UserId,
        cooperative_id: CooperativeId,
    ) -> SyncResult<(QueuedOperation, ValidationReport)> {
        let report = validation::validate(table, OperationType::Create, &data);
        if !report.is_valid() {
            return Err(SyncError::Validation(report.errors));
        }

        let client_id = utils::generate_client_id();
        self.cache_local(table, &client_id, &data, &cooperative_id, &report)
            .await?;

        let op = self
            .queue
            .create_operation(NewOperation::new(
                OperationType::Create,
                table,
                client_id.clone(),
                data,
                user_id,
                cooperative_id,
            ))
            .await?;
        debug!(table = table.as_str(), client_id, "Local create cached and queued");
        Ok((op, report))
    }

    /// Update a record locally: validate the change set, capture the
    /// cached state as the three-way merge base, apply the change to the
    /// cache and enqueue the UPDATE.
    pub async fn update_local(
        &self,
        table: EntityTable,
        record_id: &str,
        changes: Value,
        user_id: UserId,
        cooperative_id: CooperativeId,
    ) -> SyncResult<(QueuedOperation, ValidationReport)> {
        let report = validation::validate(table, OperationType::Update, &changes);
        if !report.is_valid() {
            return Err(SyncError::Validation(report.errors));
        }

        let base = self.capture_base(table, record_id).await?;
        let mut input = NewOperation::new(
            OperationType::Update,
            table,
            record_id,
            changes.clone(),
            user_id,
            cooperative_id.clone(),
        );
        if let Some((snapshot, updated_at)) = base {
            let row_version = snapshot.get("row_version").and_then(Value::as_i64);
            input = input.with_base(snapshot, updated_at, row_version);
        }

        self.apply_changes_to_cache(table, record_id, &changes, &report).await?;
        let op = self.queue.create_operation(input).await?;
        Ok((op, report))
    }

    /// Delete a record locally and enqueue the DELETE.
    pub async fn delete_local(
        &self,
        table: EntityTable,
        record_id: &str,
        user_id: UserId,
        cooperative_id: CooperativeId,
    ) -> SyncResult<QueuedOperation> {
        let op = self
            .queue
            .create_operation(NewOperation::new(
                OperationType::Delete,
                table,
                record_id,
                Value::Null,
                user_id,
                cooperative_id,
            ))
            .await?;
        match table {
            EntityTable::Deliveries => {
                self.store.deliveries().delete(record_id).await?;
            }
            _ => {
                self.store.entities().delete(table, record_id).await?;
            }
        }
        Ok(op)
    }

    async fn capture_base(
        &self,
        table: EntityTable,
        record_id: &str,
    ) -> SyncResult<Option<(Value, chrono::DateTime<Utc>)>> {
        match table {
            EntityTable::Deliveries => Ok(self
                .store
                .deliveries()
                .get(record_id)
                .await?
                .map(|record| (record.data, record.updated_at))),
            _ => Ok(self
                .store
                .entities()
                .get(table, record_id)
                .await?
                .map(|entity| (entity.data, entity.updated_at))),
        }
    }

    async fn cache_local(
        &self,
        table: EntityTable,
        client_id: &str,
        data: &Value,
        cooperative_id: &CooperativeId,
        report: &ValidationReport,
    ) -> SyncResult<()> {
        let now = Utc::now();
        match table {
            EntityTable::Deliveries => {
                let delivered_at = data
                    .get("delivered_at")
                    .and_then(Value::as_str)
                    .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                    .map_or(now, |dt| dt.with_timezone(&Utc));
                let record = DeliveryRecord {
                    id: client_id.to_string(),
                    cooperative_id: cooperative_id.clone(),
                    planteur_id: data
                        .get("planteur_id")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    delivered_at,
                    data: data.clone(),
                    tier: DeliveryTier::for_age_days((now - delivered_at).num_days()),
                    status: RecordSyncStatus::PendingSync,
                    updated_at: now,
                    cached_at: now,
                    synced_at: None,
                };
                self.store.deliveries().put(&record).await?;
            }
            _ => {
                let name = data
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let entity = CachedEntity {
                    id: client_id.to_string(),
                    cooperative_id: cooperative_id.clone(),
                    code: data.get("code").and_then(Value::as_str).map(str::to_string),
                    name_norm: utils::normalize_name(&name),
                    name,
                    chef_planteur_id: data
                        .get("chef_planteur_id")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    surface_ha: data.get("surface_ha").and_then(Value::as_f64),
                    data: data.clone(),
                    validation_warnings: report.warnings.clone(),
                    updated_at: now,
                    cached_at: now,
                    synced_at: None,
                };
                self.store.entities().put(table, &entity).await?;
            }
        }
        Ok(())
    }

    async fn apply_changes_to_cache(
        &self,
        table: EntityTable,
        record_id: &str,
        changes: &Value,
        report: &ValidationReport,
    ) -> SyncResult<()> {
        let now = Utc::now();
        match table {
            EntityTable::Deliveries => {
                if let Some(mut record) = self.store.deliveries().get(record_id).await? {
                    merge_object(&mut record.data, changes);
                    record.status = RecordSyncStatus::PendingSync;
                    record.updated_at = now;
                    self.store.deliveries().put(&record).await?;
                }
            }
            _ => {
                if let Some(mut entity) = self.store.entities().get(table, record_id).await? {
                    merge_object(&mut entity.data, changes);
                    if let Some(name) = changes.get("name").and_then(Value::as_str) {
                        entity.name = name.to_string();
                    }
                    if let Some(chef) = changes.get("chef_planteur_id").and_then(Value::as_str) {
                        entity.chef_planteur_id = Some(chef.to_string());
                    }
                    if let Some(surface) = changes.get("surface_ha").and_then(Value::as_f64) {
                        entity.surface_ha = Some(surface);
                    }
                    entity.validation_warnings = report.warnings.clone();
                    entity.updated_at = now;
                    self.store.entities().put(table, &entity).await?;
                }
            }
        }
        Ok(())
    }
}

fn merge_object(target: &mut Value, changes: &Value) {
    if let (Some(target_map), Some(change_map)) = (target.as_object_mut(), changes.as_object()) {
        for (key, value) in change_map {
            target_map.insert(key.clone(), value.clone());
        }
    }
}
