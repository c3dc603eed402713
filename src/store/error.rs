//! Error types for the storage layer.

use thiserror::Error;

pub type StoreResult<T> = Result<T, StorageError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// A row read inside the unit changed before commit; nothing was written.
    #[error("concurrent write detected, unit of work rolled back")]
    Conflict,

    #[error("unique constraint {0} violated")]
    UniqueViolation(&'static str),

    #[error("{0} row {1} does not exist")]
    RowMissing(&'static str, u64),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}
