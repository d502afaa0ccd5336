//! Trait seams between the engine and its external collaborators.
//!
//! The HTTP/RPC transport, the battery query and the platform storage API
//! are out of scope for the engine; these traits are the contracts they
//! must satisfy.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{EntityTable, OperationType};

/// Transport-level failure. Everything except a 4xx response is
/// retryable.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Offline: no connectivity")]
    Offline,

    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Transport failure: {0}")]
    Other(String),
}

impl TransportError {
    /// HTTP status when the server answered at all.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// One queued mutation, as presented to the server RPC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperationRequest {
    pub idempotency_key: String,
    pub table: EntityTable,
    pub op_type: OperationType,
    pub record_id: String,
    pub data: serde_json::Value,
}

/// Server-reported conflict body (HTTP 409 payload).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConflict {
    pub server_version: i64,
    pub client_version: i64,
    pub server_data: serde_json::Value,
    pub server_updated_at: Option<DateTime<Utc>>,
    pub server_updated_by: Option<String>,
    pub fields_changed: Vec<String>,
}

/// Outcome of `sync_operation`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncResponse {
    #[serde(rename_all = "camelCase")]
    Success {
        server_id: Option<String>,
        result: Option<serde_json::Value>,
    },
    /// The server saw this idempotency key before; treated as success.
    AlreadyProcessed,
    Conflict { conflict: ServerConflict },
    #[serde(rename_all = "camelCase")]
    Error { code: u16, message: String },
}

/// One record of a delta page, in `(updated_at, id)` order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaRecord {
    pub id: String,
    pub updated_at: DateTime<Utc>,
    pub data: serde_json::Value,
}

/// A single page returned by the delta endpoint.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaPage {
    pub records: Vec<DeltaRecord>,
}

/// The server transport contract: one mutation RPC plus the delta
/// endpoint.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// `sync_operation(idempotency_key, table, type, record_id, data)`.
    async fn sync_operation(
        &self,
        request: SyncOperationRequest,
    ) -> Result<SyncResponse, TransportError>;

    /// Current server state of one record, used for pre-flight conflict
    /// detection on UPDATE. `None` when the record does not exist.
    async fn fetch_current(
        &self,
        table: EntityTable,
        record_id: &str,
    ) -> Result<Option<serde_json::Value>, TransportError>;

    /// `GET /{table}?updated_at_gt=..&id_gt=..&order=updated_at.asc,id.asc&limit=N`.
    async fn fetch_delta(
        &self,
        table: EntityTable,
        updated_at_gt: DateTime<Utc>,
        id_gt: &str,
        limit: usize,
    ) -> Result<DeltaPage, TransportError>;
}

/// Battery query; retries are paused below a configured floor.
#[async_trait]
pub trait BatteryMonitor: Send + Sync {
    /// Percent in `0..=100`, or `None` when the platform exposes nothing
    /// (mains-powered devices report `None` and are never gated).
    async fn battery_percent(&self) -> Option<u8>;
}

/// A battery monitor for platforms without one; never gates retries.
pub struct NoBattery;

#[async_trait]
impl BatteryMonitor for NoBattery {
    async fn battery_percent(&self) -> Option<u8> {
        None
    }
}

/// Usage figures from the platform storage API.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaEstimate {
    pub used_bytes: u64,
    pub total_bytes: u64,
}

impl QuotaEstimate {
    #[must_use]
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.used_bytes as f64 / self.total_bytes as f64) * 100.0
    }
}

/// Platform storage quota probe; `None` triggers the conservative
/// fallback estimator.
#[async_trait]
pub trait QuotaProbe: Send + Sync {
    async fn estimate(&self) -> Option<QuotaEstimate>;
}

/// Session validity, provided by the authentication subsystem.
pub trait SessionProbe: Send + Sync {
    fn session_expired(&self) -> bool;
}
