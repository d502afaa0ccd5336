use thiserror::Error;

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// A `sync()` cycle is already running; callers fail fast.
    #[error("SYNC_IN_PROGRESS")]
    SyncInProgress,

    #[error(transparent)]
    Queue(#[from] queue::QueueError),

    #[error(transparent)]
    Store(#[from] store::StoreError),

    #[error("Transport error: {0}")]
    Transport(#[from] ct_core::traits::TransportError),

    #[error("Validation failed: {0:?}")]
    Validation(Vec<String>),

    #[error("Offline operation not supported: {0}")]
    OfflineNotSupported(String),

    #[error("Malformed delta record in {table}: {reason}")]
    BadDeltaRecord { table: String, reason: String },
}
