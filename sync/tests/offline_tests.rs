//! Offline-fetch boundary: queueing, synthetic responses, validation.

mod common;

use std::sync::Arc;

use common::{FixedBattery, MockTransport, coop, user};
use config::EngineConfig;
use ct_core::traits::TransportError;
use ct_core::types::{EntityTable, OperationStatus, RecordSyncStatus};
use queue::OperationQueue;
use store::OfflineStore;
use sync::{
    Connectivity, EntityManager, GatewayResponse, InterceptedRequest, Method, OfflineFetch,
    RequestContext, SyncEngine,
};

struct Harness {
    _dir: tempfile::TempDir,
    queue: OperationQueue,
    transport: Arc<MockTransport>,
    connectivity: Arc<Connectivity>,
    fetch: OfflineFetch,
}

async fn harness(online: bool) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = OfflineStore::open(dir.path(), 100).await.unwrap();
    let queue = OperationQueue::new(store);
    let transport = MockTransport::new();
    let engine = Arc::new(SyncEngine::new(
        queue.clone(),
        transport.clone(),
        Arc::new(FixedBattery(Some(100))),
        &EngineConfig::default(),
    ));
    let connectivity = Arc::new(Connectivity::new(online));
    let fetch = OfflineFetch::new(
        EntityManager::new(queue.clone()),
        engine,
        connectivity.clone(),
    );
    Harness {
        _dir: dir,
        queue,
        transport,
        connectivity,
        fetch,
    }
}

fn ctx() -> RequestContext {
    RequestContext {
        user_id: Some(user("agent-a")),
        cooperative_id: Some(coop("coop-1")),
    }
}

fn delivery_create() -> InterceptedRequest {
    InterceptedRequest {
        method: Method::Post,
        table: "deliveries".to_string(),
        record_id: None,
        payload: serde_json::json!({
            "planteur_id": "9073926b-929f-4000-8000-c8d5259b3bc3",
            "weight_kg": 75.5,
            "delivered_at": "2026-07-30T09:00:00Z",
            "quality_grade": "B",
        }),
    }
}

#[tokio::test]
async fn test_offline_create_returns_synthetic_202() {
    let h = harness(false).await;
    let response = h.fetch.handle(delivery_create(), &ctx()).await;

    let GatewayResponse::Queued {
        status,
        offline_queued,
        operation,
    } = response
    else {
        panic!("Expected Queued, got {response:?}");
    };
    assert_eq!(status, 202);
    assert!(offline_queued);
    assert_eq!(operation.table, EntityTable::Deliveries);
    assert!(utils::is_valid_uuid_v4(&operation.record_id));

    // Durably queued, cached as pending, no RPC attempted.
    assert_eq!(h.queue.count().await.unwrap(), 1);
    assert_eq!(h.transport.request_count().await, 0);
    let cached = h
        .queue
        .store()
        .deliveries()
        .get(&operation.record_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cached.status, RecordSyncStatus::PendingSync);
}

#[tokio::test]
async fn test_unknown_table_is_refused() {
    let h = harness(false).await;
    let response = h
        .fetch
        .handle(
            InterceptedRequest {
                method: Method::Post,
                table: "exports".to_string(),
                record_id: None,
                payload: serde_json::json!({}),
            },
            &ctx(),
        )
        .await;
    let GatewayResponse::Rejected { status, code, .. } = response else {
        panic!("Expected Rejected, got {response:?}");
    };
    assert_eq!(status, 503);
    assert_eq!(code, "OFFLINE_NOT_SUPPORTED");
}

#[tokio::test]
async fn test_missing_identity_is_refused() {
    let h = harness(false).await;
    let response = h
        .fetch
        .handle(
            delivery_create(),
            &RequestContext {
                user_id: None,
                cooperative_id: None,
            },
        )
        .await;
    let GatewayResponse::Rejected { status, code, .. } = response else {
        panic!("Expected Rejected, got {response:?}");
    };
    assert_eq!(status, 503);
    assert_eq!(code, "OFFLINE_NOT_SUPPORTED");
    assert_eq!(h.queue.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_validation_errors_block_enqueue() {
    let h = harness(false).await;
    let response = h
        .fetch
        .handle(
            InterceptedRequest {
                method: Method::Post,
                table: "deliveries".to_string(),
                record_id: None,
                payload: serde_json::json!({"weight_kg": -4}),
            },
            &ctx(),
        )
        .await;
    let GatewayResponse::Rejected {
        status,
        code,
        errors,
        ..
    } = response
    else {
        panic!("Expected Rejected, got {response:?}");
    };
    assert_eq!(status, 422);
    assert_eq!(code, "VALIDATION_FAILED");
    assert!(!errors.is_empty());
    assert_eq!(h.queue.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_get_is_never_queued_offline() {
    let h = harness(false).await;
    let response = h
        .fetch
        .handle(
            InterceptedRequest {
                method: Method::Get,
                table: "planteurs".to_string(),
                record_id: Some("p-1".to_string()),
                payload: serde_json::Value::Null,
            },
            &ctx(),
        )
        .await;
    let GatewayResponse::Rejected { status, .. } = response else {
        panic!("Expected Rejected, got {response:?}");
    };
    assert_eq!(status, 503);
    assert_eq!(h.queue.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_get_passes_through_online() {
    let h = harness(true).await;
    h.transport
        .set_current("p-1", serde_json::json!({"name": "Kouamé"}))
        .await;
    let response = h
        .fetch
        .handle(
            InterceptedRequest {
                method: Method::Get,
                table: "planteurs".to_string(),
                record_id: Some("p-1".to_string()),
                payload: serde_json::Value::Null,
            },
            &ctx(),
        )
        .await;
    let GatewayResponse::Passthrough { status, body } = response else {
        panic!("Expected Passthrough, got {response:?}");
    };
    assert_eq!(status, 200);
    assert_eq!(body["name"], "Kouamé");
}

#[tokio::test]
async fn test_online_create_passes_through_and_drains() {
    let h = harness(true).await;
    let response = h.fetch.handle(delivery_create(), &ctx()).await;

    let GatewayResponse::Passthrough { status, .. } = response else {
        panic!("Expected Passthrough, got {response:?}");
    };
    assert_eq!(status, 200);
    // The op was drained inline.
    assert_eq!(h.queue.count().await.unwrap(), 0);
    assert_eq!(h.transport.request_count().await, 1);
}

#[tokio::test]
async fn test_online_transport_error_falls_back_to_queue() {
    let h = harness(true).await;
    h.transport.script(Err(TransportError::Timeout {
        timeout_ms: 30_000,
    })).await;

    let response = h.fetch.handle(delivery_create(), &ctx()).await;
    let GatewayResponse::Queued {
        status,
        offline_queued,
        ..
    } = response
    else {
        panic!("Expected Queued, got {response:?}");
    };
    assert_eq!(status, 202);
    assert!(offline_queued);

    // The op stays queued with a retry scheduled.
    let stats = h.queue.stats().await.unwrap();
    assert_eq!(stats.failed, 1);
    let ops = h
        .queue
        .store()
        .ops()
        .by_status(OperationStatus::Failed)
        .await
        .unwrap();
    assert!(ops[0].next_retry_at.is_some());
}

#[tokio::test]
async fn test_connectivity_flip_changes_path() {
    let h = harness(false).await;
    let first = h.fetch.handle(delivery_create(), &ctx()).await;
    assert!(matches!(first, GatewayResponse::Queued { .. }));

    h.connectivity.set_online(true);
    let second = h
        .fetch
        .handle(
            InterceptedRequest {
                method: Method::Post,
                table: "deliveries".to_string(),
                record_id: None,
                payload: serde_json::json!({
                    "planteur_id": "9073926b-929f-4000-8000-c8d5259b3bc3",
                    "weight_kg": 42,
                    "delivered_at": "2026-07-30T11:00:00Z",
                }),
            },
            &ctx(),
        )
        .await;
    assert!(matches!(second, GatewayResponse::Passthrough { .. }));
    // The inline drain also flushed the earlier offline op.
    assert_eq!(h.queue.count().await.unwrap(), 0);
}
