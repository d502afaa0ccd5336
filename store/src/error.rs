use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Migration failed at version {version}: {message}")]
    Migration { version: u32, message: String },

    #[error("Store integrity check failed: missing {missing:?}")]
    Integrity { missing: Vec<String> },

    #[error("Invalid stored value in {table}.{column}: {value}")]
    Corrupt {
        table: &'static str,
        column: &'static str,
        value: String,
    },

    #[error("Record not found: {table}:{id}")]
    NotFound { table: &'static str, id: String },

    #[error("Not an entity cache table: {0}")]
    InvalidTable(String),
}

impl StoreError {
    #[must_use]
    pub fn corrupt(table: &'static str, column: &'static str, value: impl Into<String>) -> Self {
        Self::Corrupt {
            table,
            column,
            value: value.into(),
        }
    }
}
