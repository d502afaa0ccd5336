//! Offline-fetch wrapper: the boundary that turns mutation attempts into
//! queued operations when the device is offline (or the transport fails),
//! and synthesizes HTTP-shaped responses either way.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use ct_core::types::{CooperativeId, EntityTable, OperationStatus, OperationType, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::engine::SyncEngine;
use crate::entity_manager::EntityManager;
use crate::error::SyncError;

/// Process-wide connectivity flag, flipped by the platform's network
/// listener.
#[derive(Debug, Default)]
pub struct Connectivity {
    online: AtomicBool,
}

impl Connectivity {
    #[must_use]
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    #[must_use]
    pub fn is_mutation(&self) -> bool {
        !matches!(self, Self::Get)
    }

    fn op_type(&self) -> Option<OperationType> {
        match self {
            Self::Post => Some(OperationType::Create),
            Self::Put | Self::Patch => Some(OperationType::Update),
            Self::Delete => Some(OperationType::Delete),
            Self::Get => None,
        }
    }
}

/// A request intercepted at the boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterceptedRequest {
    pub method: Method,
    /// Raw resource name; unknown tables are refused.
    pub table: String,
    pub record_id: Option<String>,
    pub payload: Value,
}

/// Identity context from the (out-of-scope) auth subsystem.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub user_id: Option<UserId>,
    pub cooperative_id: Option<CooperativeId>,
}

/// Summary of the queued op, embedded in the synthetic 202 body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedSummary {
    pub id: String,
    pub table: EntityTable,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub record_id: String,
    pub queued_at: DateTime<Utc>,
}

/// HTTP-shaped outcome of an intercepted request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GatewayResponse {
    /// The server answered while online.
    #[serde(rename_all = "camelCase")]
    Passthrough { status: u16, body: Value },
    /// Synthetic `202 Accepted`: durably queued for later sync. The
    /// `offline_queued` marker lets callers tell it from a live 202.
    #[serde(rename_all = "camelCase")]
    Queued {
        status: u16,
        offline_queued: bool,
        operation: QueuedSummary,
    },
    /// Refused synchronously (unknown table, missing identity, offline
    /// GET, validation failure).
    #[serde(rename_all = "camelCase")]
    Rejected {
        status: u16,
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        errors: Vec<String>,
    },
}

impl GatewayResponse {
    fn not_supported(message: impl Into<String>) -> Self {
        Self::Rejected {
            status: 503,
            code: "OFFLINE_NOT_SUPPORTED".to_string(),
            message: message.into(),
            errors: Vec::new(),
        }
    }
}

pub struct OfflineFetch {
    manager: EntityManager,
    engine: Arc<SyncEngine>,
    connectivity: Arc<Connectivity>,
}

impl OfflineFetch {
    #[must_use]
    pub fn new(
        manager: EntityManager,
        engine: Arc<SyncEngine>,
        connectivity: Arc<Connectivity>,
    ) -> Self {
        Self {
            manager,
            engine,
            connectivity,
        }
    }

    /// Intercept one request. Mutations are cached and queued; when
    /// online, a sync cycle runs immediately and the queue state decides
    /// the synthesized response.
    pub async fn handle(
        &self,
        request: InterceptedRequest,
        ctx: &RequestContext,
    ) -> GatewayResponse {
        let Ok(table) = EntityTable::from_str(&request.table) else {
            return GatewayResponse::not_supported(format!(
                "table '{}' is not available offline",
                request.table
            ));
        };

        if request.method == Method::Get {
            return self.handle_get(table, request.record_id.as_deref()).await;
        }

        let (Some(user_id), Some(cooperative_id)) =
            (ctx.user_id.clone(), ctx.cooperative_id.clone())
        else {
            return GatewayResponse::not_supported("missing identity context");
        };

        let op_type = match request.method.op_type() {
            Some(op_type) => op_type,
            None => return GatewayResponse::not_supported("method not interceptable"),
        };

        let queued = match op_type {
            OperationType::Create => {
                self.manager
                    .create_local(table, request.payload, user_id, cooperative_id)
                    .await
                    .map(|(op, _)| op)
            }
            OperationType::Update => match request.record_id.as_deref() {
                Some(record_id) => self
                    .manager
                    .update_local(table, record_id, request.payload, user_id, cooperative_id)
                    .await
                    .map(|(op, _)| op),
                None => {
                    return GatewayResponse::Rejected {
                        status: 400,
                        code: "MISSING_RECORD_ID".to_string(),
                        message: "update requires a record id".to_string(),
                        errors: Vec::new(),
                    };
                }
            },
            OperationType::Delete => match request.record_id.as_deref() {
                Some(record_id) => self
                    .manager
                    .delete_local(table, record_id, user_id, cooperative_id)
                    .await,
                None => {
                    return GatewayResponse::Rejected {
                        status: 400,
                        code: "MISSING_RECORD_ID".to_string(),
                        message: "delete requires a record id".to_string(),
                        errors: Vec::new(),
                    };
                }
            },
        };

        let op = match queued {
            Ok(op) => op,
            Err(SyncError::Validation(errors)) => {
                return GatewayResponse::Rejected {
                    status: 422,
                    code: "VALIDATION_FAILED".to_string(),
                    message: "payload failed local validation".to_string(),
                    errors,
                };
            }
            Err(e) => {
                warn!(error = %e, "Enqueue failed at the offline boundary");
                return GatewayResponse::Rejected {
                    status: 500,
                    code: "QUEUE_FAILED".to_string(),
                    message: e.to_string(),
                    errors: Vec::new(),
                };
            }
        };

        if self.connectivity.is_online() {
            // Pass through: drain now, then answer from what happened to
            // the op. A transport failure leaves it queued.
            match self.engine.sync().await {
                Ok(_) | Err(SyncError::SyncInProgress) => {}
                Err(e) => debug!(error = %e, "Inline sync after passthrough failed"),
            }
            return self.response_from_queue_state(&op.id, op_summary(&op)).await;
        }

        GatewayResponse::Queued {
            status: 202,
            offline_queued: true,
            operation: op_summary(&op),
        }
    }

    async fn handle_get(&self, table: EntityTable, record_id: Option<&str>) -> GatewayResponse {
        if !self.connectivity.is_online() {
            // GET is never queued.
            return GatewayResponse::Rejected {
                status: 503,
                code: "OFFLINE".to_string(),
                message: "reads are not queued offline; use the local cache".to_string(),
                errors: Vec::new(),
            };
        }
        let Some(record_id) = record_id else {
            return GatewayResponse::not_supported("collection reads are not intercepted");
        };
        match self.engine.transport().fetch_current(table, record_id).await {
            Ok(Some(body)) => GatewayResponse::Passthrough { status: 200, body },
            Ok(None) => GatewayResponse::Passthrough {
                status: 404,
                body: Value::Null,
            },
            Err(e) => GatewayResponse::Rejected {
                status: 503,
                code: "UPSTREAM_UNAVAILABLE".to_string(),
                message: e.to_string(),
                errors: Vec::new(),
            },
        }
    }

    async fn response_from_queue_state(
        &self,
        op_id: &str,
        summary: QueuedSummary,
    ) -> GatewayResponse {
        let ops = self.manager.queue().store().ops();
        match ops.get(op_id).await {
            // Dequeued: the server applied it.
            Ok(None) => GatewayResponse::Passthrough {
                status: 200,
                body: serde_json::json!({"status": "success"}),
            },
            Ok(Some(op)) => match op.status {
                OperationStatus::NeedsReview => GatewayResponse::Passthrough {
                    status: 409,
                    body: serde_json::to_value(&op.conflict_info).unwrap_or(Value::Null),
                },
                // A client error is final; retryable/paused failures stay
                // queued.
                OperationStatus::Failed
                    if op
                        .error
                        .as_ref()
                        .and_then(|e| e.code)
                        .is_some_and(|code| (400..500).contains(&code)) =>
                {
                    let (status, message) = op
                        .error
                        .as_ref()
                        .map_or((500, "sync failed".to_string()), |e| {
                            (e.code.unwrap_or(500), e.message.clone())
                        });
                    GatewayResponse::Rejected {
                        status,
                        code: "SYNC_FAILED".to_string(),
                        message,
                        errors: Vec::new(),
                    }
                }
                _ => GatewayResponse::Queued {
                    status: 202,
                    offline_queued: true,
                    operation: summary,
                },
            },
            Err(e) => GatewayResponse::Rejected {
                status: 500,
                code: "QUEUE_FAILED".to_string(),
                message: e.to_string(),
                errors: Vec::new(),
            },
        }
    }
}

fn op_summary(op: &ct_core::types::QueuedOperation) -> QueuedSummary {
    QueuedSummary {
        id: op.id.clone(),
        table: op.table,
        op_type: op.op_type,
        record_id: op.record_id.clone(),
        queued_at: op.queued_at,
    }
}
