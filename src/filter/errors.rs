//! # Materializer Errors
//!
//! A failed build is abandoned: the temporary file is removed, the lock is
//! released and the error reaches the caller. The next call starts over.

use std::path::PathBuf;

use thiserror::Error;

use crate::dag::CollaboratorError;
use crate::schema::SchemaError;
use crate::store::StoreError;

/// Result type for materializer operations
pub type MaterializeResult<T> = Result<T, MaterializeError>;

/// State-filter materialization errors
#[derive(Debug, Error)]
pub enum MaterializeError {
    /// Another party held the build lock for the whole wait window
    #[error("Timed out after {waited_ms} ms waiting for the state filter of {csid}")]
    FilterBuildTimeout { csid: String, waited_ms: u64 },

    /// The changeset has not been ingested into the index
    #[error("Changeset not indexed: {0}")]
    ChangesetNotIndexed(String),

    /// Records live in the changeset are absent from the main database
    #[error("{count} records of changeset {csid} are missing from the index")]
    MissingRecords { csid: String, count: usize },

    /// Filter file could not be created, copied, renamed or removed
    #[error("Filter I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A filter file exists but its metadata is unreadable
    #[error("Corrupt state filter {}: {reason}", .path.display())]
    CorruptFilter { path: PathBuf, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error(transparent)]
    Schema(#[from] SchemaError),
}

impl MaterializeError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        MaterializeError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        MaterializeError::CorruptFilter {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

impl From<rusqlite::Error> for MaterializeError {
    fn from(err: rusqlite::Error) -> Self {
        MaterializeError::Store(StoreError::Sqlite(err))
    }
}
