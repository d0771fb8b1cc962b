//! Top-level error taxonomy
//!
//! Subsystem errors keep their own codes and are wrapped here so the public
//! API returns a single error type.

use thiserror::Error;

use crate::dag::CollaboratorError;
use crate::filter::MaterializeError;
use crate::query::CompileError;
use crate::schema::SchemaError;
use crate::store::StoreError;

/// Result type for index operations
pub type IndexResult<T> = Result<T, IndexError>;

#[derive(Debug, Error)]
pub enum IndexError {
    /// Template or field resolution failed
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// Query could not be compiled; never retried
    #[error(transparent)]
    Compile(#[from] CompileError),

    /// State filter could not be produced
    #[error(transparent)]
    Materialize(#[from] MaterializeError),

    /// Backing store failure, including exhausted busy retries
    #[error(transparent)]
    Store(#[from] StoreError),

    /// DAG, blob or template collaborator failure
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    /// Indexed data disagrees with the DAG; always fatal to the operation
    #[error("consistency violation: {0}")]
    ConsistencyViolation(String),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<rusqlite::Error> for IndexError {
    fn from(err: rusqlite::Error) -> Self {
        IndexError::Store(StoreError::Sqlite(err))
    }
}

impl IndexError {
    /// Returns true if the error came from store contention
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            IndexError::Store(StoreError::Busy { .. })
                | IndexError::Materialize(MaterializeError::Store(StoreError::Busy { .. }))
        )
    }
}
