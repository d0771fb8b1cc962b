//! # Store Errors
//!
//! Error types for the backing relational store.

use std::path::PathBuf;

use thiserror::Error;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Backing store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// Store stayed busy for the whole retry window
    #[error("Store busy during {operation} after {waited_ms} ms")]
    Busy { operation: String, waited_ms: u64 },

    /// SQLite reported an error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Filesystem error next to the database files
    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Stored value could not be turned back into a field value
    #[error("Cannot decode column {column}: {reason}")]
    Decode { column: String, reason: String },
}

impl StoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}
