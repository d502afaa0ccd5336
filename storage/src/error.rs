use thiserror::Error;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Store(#[from] store::StoreError),

    #[error(transparent)]
    Queue(#[from] queue::QueueError),

    #[error("Eviction plan rejected: {violations:?}")]
    UnsafeEviction { violations: Vec<String> },
}
