//! Collaborator error types

use thiserror::Error;

/// Result type for collaborator calls
pub type CollaboratorResult<T> = Result<T, CollaboratorError>;

/// Failures reported by the DAG, blob or template collaborators
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollaboratorError {
    /// Changeset is not part of the DAG
    #[error("Unknown changeset: {0}")]
    UnknownChangeset(String),

    /// Blob store has no record with this content hash
    #[error("Unknown record: {0}")]
    UnknownRecord(String),

    /// Template is not known to the template layer
    #[error("Unknown template: {0}")]
    UnknownTemplate(String),

    /// Collaborator could not serve the request
    #[error("Collaborator unavailable: {0}")]
    Unavailable(String),
}
