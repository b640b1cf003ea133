use thiserror::Error;

/// Errors raised by the catalog scan engine and its storage/transport seams.
#[derive(Error, Debug)]
pub enum CatalogScanError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Entity not found: {table}/{partition_key}/{row_key}")]
    EntityNotFound {
        table: String,
        partition_key: String,
        row_key: String,
    },

    #[error("Entity already exists: {table}/{partition_key}/{row_key}")]
    EntityAlreadyExists {
        table: String,
        partition_key: String,
        row_key: String,
    },

    #[error("Precondition failed: {table}/{partition_key}/{row_key}")]
    PreconditionFailed {
        table: String,
        partition_key: String,
        row_key: String,
    },

    #[error("Invalid batch: {0}")]
    InvalidBatch(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Driver error: {0}")]
    Driver(#[from] anyhow::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CatalogScanError {
    /// True when another writer got to the row first: the row vanished or its
    /// version token moved on. Callers reschedule instead of failing.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            CatalogScanError::EntityNotFound { .. }
                | CatalogScanError::PreconditionFailed { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            CatalogScanError::EntityNotFound { .. }
                | CatalogScanError::TableNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CatalogScanError>;
