//! Shared test doubles: a scriptable transport and helpers.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ct_core::traits::{
    BatteryMonitor, DeltaPage, DeltaRecord, SyncOperationRequest, SyncResponse, SyncTransport,
    TransportError,
};
use ct_core::types::{CooperativeId, EntityTable, UserId};
use tokio::sync::Mutex;

pub fn user(id: &str) -> UserId {
    id.parse().unwrap()
}

pub fn coop(id: &str) -> CooperativeId {
    id.parse().unwrap()
}

/// Scriptable transport: queued responses for `sync_operation`, a map for
/// `fetch_current`, a sorted dataset for `fetch_delta`.
#[derive(Default)]
pub struct MockTransport {
    pub responses: Mutex<VecDeque<Result<SyncResponse, TransportError>>>,
    pub current: Mutex<HashMap<String, serde_json::Value>>,
    pub dataset: Mutex<HashMap<EntityTable, Vec<DeltaRecord>>>,
    pub requests: Mutex<Vec<SyncOperationRequest>>,
    pub delta_calls: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn script(&self, response: Result<SyncResponse, TransportError>) {
        self.responses.lock().await.push_back(response);
    }

    pub async fn set_current(&self, record_id: &str, state: serde_json::Value) {
        self.current.lock().await.insert(record_id.to_string(), state);
    }

    pub async fn set_dataset(&self, table: EntityTable, mut records: Vec<DeltaRecord>) {
        records.sort_by(|a, b| {
            a.updated_at
                .cmp(&b.updated_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        self.dataset.lock().await.insert(table, records);
    }

    pub async fn request_count(&self) -> usize {
        self.requests.lock().await.len()
    }
}

#[async_trait]
impl SyncTransport for MockTransport {
    async fn sync_operation(
        &self,
        request: SyncOperationRequest,
    ) -> Result<SyncResponse, TransportError> {
        self.requests.lock().await.push(request.clone());
        match self.responses.lock().await.pop_front() {
            Some(response) => response,
            None => Ok(SyncResponse::Success {
                server_id: Some(format!("srv-{}", request.record_id)),
                result: None,
            }),
        }
    }

    async fn fetch_current(
        &self,
        _table: EntityTable,
        record_id: &str,
    ) -> Result<Option<serde_json::Value>, TransportError> {
        Ok(self.current.lock().await.get(record_id).cloned())
    }

    async fn fetch_delta(
        &self,
        table: EntityTable,
        updated_at_gt: DateTime<Utc>,
        id_gt: &str,
        limit: usize,
    ) -> Result<DeltaPage, TransportError> {
        self.delta_calls.fetch_add(1, Ordering::SeqCst);
        let dataset = self.dataset.lock().await;
        let records: Vec<DeltaRecord> = dataset
            .get(&table)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| {
                        r.updated_at > updated_at_gt
                            || (r.updated_at == updated_at_gt && r.id.as_str() > id_gt)
                    })
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(DeltaPage { records })
    }
}

/// Fixed battery level (None = no battery API on this platform).
pub struct FixedBattery(pub Option<u8>);

#[async_trait]
impl BatteryMonitor for FixedBattery {
    async fn battery_percent(&self) -> Option<u8> {
        self.0
    }
}
