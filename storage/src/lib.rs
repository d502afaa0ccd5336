//! # CocoaTrack Storage Manager
//!
//! Quota-band state machine, tier eviction with hard safety invariants,
//! the composed degraded mode and the diagnostics snapshot.

pub mod degraded;
pub mod diagnostics;
pub mod error;
pub mod eviction;
pub mod quota;

pub use degraded::DegradedModeManager;
pub use diagnostics::{DiagnosticsService, DiagnosticsSnapshot};
pub use error::{StorageError, StorageResult};
pub use eviction::{
    CleanupOutcome, EvictionPlan, PROTECTED_STORES, SafetyReport, StorageManager,
    validate_eviction_safety,
};
pub use quota::{AllowedDownloads, StorageMetrics, StorageMonitor};
