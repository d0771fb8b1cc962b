//! Query compile error types
//!
//! Error codes:
//! - DAGIDX_QUERY_FIELD_NOT_FOUND
//! - DAGIDX_QUERY_INVALID_ARGUMENT
//! - DAGIDX_QUERY_HISTORY_REQUIRES_SNAPSHOT
//! - DAGIDX_QUERY_INVALID_SORT
//! - DAGIDX_QUERY_UNIQUE_LOOKUP_UNSUPPORTED
//! - DAGIDX_QUERY_UNKNOWN_RECTYPE
//!
//! All of them reject the query; none is retried.

use std::fmt;

/// Compiler-specific error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileErrorCode {
    /// Field is not defined on the record type
    FieldNotFound,
    /// Malformed criteria node or projection
    InvalidArgument,
    /// History was requested without an as-of changeset
    HistoryRequiresSnapshot,
    /// Field cannot be sorted on
    InvalidSort,
    /// Unique lookup on a DAG type without unique constraints
    UniqueLookupUnsupported,
    /// Record type is not in the schema
    UnknownRecordType,
}

impl CompileErrorCode {
    /// Returns the stable string code
    pub fn code(&self) -> &'static str {
        match self {
            CompileErrorCode::FieldNotFound => "DAGIDX_QUERY_FIELD_NOT_FOUND",
            CompileErrorCode::InvalidArgument => "DAGIDX_QUERY_INVALID_ARGUMENT",
            CompileErrorCode::HistoryRequiresSnapshot => "DAGIDX_QUERY_HISTORY_REQUIRES_SNAPSHOT",
            CompileErrorCode::InvalidSort => "DAGIDX_QUERY_INVALID_SORT",
            CompileErrorCode::UniqueLookupUnsupported => "DAGIDX_QUERY_UNIQUE_LOOKUP_UNSUPPORTED",
            CompileErrorCode::UnknownRecordType => "DAGIDX_QUERY_UNKNOWN_RECTYPE",
        }
    }
}

impl fmt::Display for CompileErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Compile error with full context
#[derive(Debug, Clone)]
pub struct CompileError {
    /// Error code
    code: CompileErrorCode,
    /// Human-readable message
    message: String,
    /// Field name if applicable
    field: Option<String>,
}

impl CompileError {
    pub fn field_not_found(rectype: &str, field: impl Into<String>) -> Self {
        let f = field.into();
        Self {
            code: CompileErrorCode::FieldNotFound,
            message: format!("Field '{}' not found on '{}'", f, rectype),
            field: Some(f),
        }
    }

    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self {
            code: CompileErrorCode::InvalidArgument,
            message: reason.into(),
            field: None,
        }
    }

    pub fn history_requires_snapshot() -> Self {
        Self {
            code: CompileErrorCode::HistoryRequiresSnapshot,
            message: "History can only be projected as of a changeset".into(),
            field: None,
        }
    }

    pub fn invalid_sort(field: impl Into<String>, reason: impl Into<String>) -> Self {
        let f = field.into();
        Self {
            code: CompileErrorCode::InvalidSort,
            message: format!("Cannot sort on '{}': {}", f, reason.into()),
            field: Some(f),
        }
    }

    pub fn unique_lookup_unsupported(field: impl Into<String>) -> Self {
        let f = field.into();
        Self {
            code: CompileErrorCode::UniqueLookupUnsupported,
            message: format!("Unique lookup on '{}' is not supported by this DAG type", f),
            field: Some(f),
        }
    }

    pub fn unknown_rectype(rectype: impl Into<String>) -> Self {
        Self {
            code: CompileErrorCode::UnknownRecordType,
            message: format!("Record type '{}' not found", rectype.into()),
            field: None,
        }
    }

    /// Returns the error code
    pub fn code(&self) -> CompileErrorCode {
        self.code
    }

    /// Returns the error message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the field name if applicable
    pub fn field(&self) -> Option<&str> {
        self.field.as_deref()
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.code(), self.message)
    }
}

impl std::error::Error for CompileError {}

/// Result type for compile operations
pub type CompileResult<T> = Result<T, CompileError>;
