use ct_core::types::OperationStatus;
use thiserror::Error;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] store::StoreError),

    #[error("Operation not found: {0}")]
    OperationNotFound(String),

    #[error("Illegal status transition: {from} -> {to}")]
    IllegalTransition {
        from: OperationStatus,
        to: OperationStatus,
    },

    #[error("Merge resolution requires merged data")]
    MissingMergedData,
}
