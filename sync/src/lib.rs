//! # CocoaTrack Sync Engine
//!
//! Reconciliation between the offline cache and the authoritative server:
//! the guarded drain loop, three-way conflict detection and resolution,
//! the delta-sync cursor protocol, the offline-fetch boundary and the
//! periodic background cadence.

pub mod conflict;
pub mod delta;
pub mod engine;
pub mod entity_manager;
pub mod error;
pub mod offline;
pub mod periodic;
pub mod validation;

#[cfg(test)]
mod proptests;

pub use conflict::{ConflictPolicy, ConflictType, Detection, FieldStrategy, MergeOutcome};
pub use delta::{DeltaOutcome, DeltaSyncManager, TIER1_TABLES};
pub use engine::{SyncCycleError, SyncEngine, SyncReport};
pub use entity_manager::EntityManager;
pub use error::{SyncError, SyncResult};
pub use offline::{
    Connectivity, GatewayResponse, InterceptedRequest, Method, OfflineFetch, RequestContext,
};
pub use periodic::PeriodicSync;
pub use validation::{ValidationReport, validate};
