//! Error types for the store.
//!
//! The split mirrors the two failure domains: `StorageError` covers the
//! backing-store adapters, `StoreError` is what the public engine surface
//! returns. Dimension mismatches fail fast and are never retried; storage
//! failures propagate to whichever operation triggered the I/O.

use thiserror::Error;

/// Failures raised by a backing-store adapter.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("table '{table}' has no column '{column}'")]
    MissingColumn { table: String, column: String },

    #[error("unknown table '{0}'")]
    UnknownTable(String),

    #[error("backend error: {0}")]
    Backend(String),
}

/// Failures surfaced by the public store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
