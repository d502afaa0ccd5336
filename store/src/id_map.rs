//! Client-id to server-id mapping.
//!
//! A bidirectional in-memory table backed by the durable sidecar, so
//! mappings survive deletion of the embedded store. Foreign keys in
//! outbound payloads resolve through `resolve_to_server_id`, which falls
//! back to the input when no mapping exists.

use chrono::Utc;
use ct_core::types::{EntityTable, IdMapping};
use dashmap::DashMap;
use tracing::debug;

use crate::error::StoreResult;
use crate::sidecar::Sidecar;

#[derive(Debug)]
pub struct IdMap {
    sidecar: Sidecar,
    by_client: DashMap<String, IdMapping>,
    by_server: DashMap<String, String>,
}

impl IdMap {
    /// Load the mirror from the sidecar.
    pub async fn load(sidecar: Sidecar) -> StoreResult<Self> {
        let map = Self {
            sidecar,
            by_client: DashMap::new(),
            by_server: DashMap::new(),
        };
        for mapping in map.sidecar.load_id_mappings().await? {
            map.by_server
                .insert(mapping.server_id.clone(), mapping.client_id.clone());
            map.by_client.insert(mapping.client_id.clone(), mapping);
        }
        debug!(count = map.by_client.len(), "Id-mapping mirror loaded");
        Ok(map)
    }

    /// Record a confirmed mapping and persist the mirror.
    pub async fn record(
        &self,
        client_id: &str,
        server_id: &str,
        table: EntityTable,
    ) -> StoreResult<()> {
        let mapping = IdMapping {
            client_id: client_id.to_string(),
            server_id: server_id.to_string(),
            table,
            mapped_at: Utc::now(),
        };
        self.by_server
            .insert(server_id.to_string(), client_id.to_string());
        self.by_client.insert(client_id.to_string(), mapping);
        self.persist().await
    }

    /// `mapping[id] ?? id`.
    #[must_use]
    pub fn resolve_to_server_id(&self, id: &str) -> String {
        self.by_client
            .get(id)
            .map(|m| m.server_id.clone())
            .unwrap_or_else(|| id.to_string())
    }

    /// Reverse lookup; falls back to the input.
    #[must_use]
    pub fn resolve_to_client_id(&self, id: &str) -> String {
        self.by_server
            .get(id)
            .map(|c| c.clone())
            .unwrap_or_else(|| id.to_string())
    }

    #[must_use]
    pub fn get(&self, client_id: &str) -> Option<IdMapping> {
        self.by_client.get(client_id).map(|m| m.clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_client.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_client.is_empty()
    }

    async fn persist(&self) -> StoreResult<()> {
        let mut mappings: Vec<IdMapping> =
            self.by_client.iter().map(|e| e.value().clone()).collect();
        mappings.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        self.sidecar.save_id_mappings(&mappings).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_falls_back_to_input() {
        let dir = tempfile::tempdir().unwrap();
        let sidecar = Sidecar::open(dir.path()).await.unwrap();
        let map = IdMap::load(sidecar).await.unwrap();

        assert_eq!(map.resolve_to_server_id("local-1"), "local-1");
        assert_eq!(map.resolve_to_client_id("srv-1"), "srv-1");
    }

    #[tokio::test]
    async fn test_record_and_resolve_both_ways() {
        let dir = tempfile::tempdir().unwrap();
        let sidecar = Sidecar::open(dir.path()).await.unwrap();
        let map = IdMap::load(sidecar).await.unwrap();

        map.record("local-1", "srv-9", EntityTable::Planteurs)
            .await
            .unwrap();
        assert_eq!(map.resolve_to_server_id("local-1"), "srv-9");
        assert_eq!(map.resolve_to_client_id("srv-9"), "local-1");
    }

    #[tokio::test]
    async fn test_mirror_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let sidecar = Sidecar::open(dir.path()).await.unwrap();
            let map = IdMap::load(sidecar).await.unwrap();
            map.record("local-1", "srv-9", EntityTable::Deliveries)
                .await
                .unwrap();
        }
        let sidecar = Sidecar::open(dir.path()).await.unwrap();
        let map = IdMap::load(sidecar).await.unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map.resolve_to_server_id("local-1"), "srv-9");
    }
}
