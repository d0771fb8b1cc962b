//! Schema error types
//!
//! Error codes:
//! - DAGIDX_SCHEMA_EMPTY
//! - DAGIDX_SCHEMA_INVALID_NAME
//! - DAGIDX_SCHEMA_CONFLICT
//! - DAGIDX_SCHEMA_TEMPLATE_UNAVAILABLE
//! - DAGIDX_SCHEMA_UNKNOWN_RECTYPE
//! - DAGIDX_SCHEMA_SERIALIZATION

use std::fmt;

/// Schema-specific error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaErrorCode {
    /// No templates to build a schema from
    EmptyTemplateSet,
    /// Record type or field name is not a plain identifier
    InvalidName,
    /// Two templates define the same field incompatibly
    ConflictingField,
    /// Template layer could not describe a template
    TemplateUnavailable,
    /// Record type is not part of the composite schema
    UnknownRecordType,
    /// Schema could not be serialized or parsed
    Serialization,
}

impl SchemaErrorCode {
    /// Returns the stable string code
    pub fn code(&self) -> &'static str {
        match self {
            SchemaErrorCode::EmptyTemplateSet => "DAGIDX_SCHEMA_EMPTY",
            SchemaErrorCode::InvalidName => "DAGIDX_SCHEMA_INVALID_NAME",
            SchemaErrorCode::ConflictingField => "DAGIDX_SCHEMA_CONFLICT",
            SchemaErrorCode::TemplateUnavailable => "DAGIDX_SCHEMA_TEMPLATE_UNAVAILABLE",
            SchemaErrorCode::UnknownRecordType => "DAGIDX_SCHEMA_UNKNOWN_RECTYPE",
            SchemaErrorCode::Serialization => "DAGIDX_SCHEMA_SERIALIZATION",
        }
    }
}

impl fmt::Display for SchemaErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Schema error with full context
#[derive(Debug, Clone)]
pub struct SchemaError {
    code: SchemaErrorCode,
    message: String,
}

impl SchemaError {
    pub fn empty_template_set() -> Self {
        Self {
            code: SchemaErrorCode::EmptyTemplateSet,
            message: "Cannot build a composite schema from an empty template set".into(),
        }
    }

    pub fn invalid_name(kind: &str, name: &str) -> Self {
        Self {
            code: SchemaErrorCode::InvalidName,
            message: format!("Invalid {} name '{}'", kind, name),
        }
    }

    pub fn conflicting_field(rectype: &str, field: &str, reason: impl Into<String>) -> Self {
        Self {
            code: SchemaErrorCode::ConflictingField,
            message: format!(
                "Field '{}.{}' is defined incompatibly: {}",
                rectype,
                field,
                reason.into()
            ),
        }
    }

    pub fn template_unavailable(template: &str, reason: impl fmt::Display) -> Self {
        Self {
            code: SchemaErrorCode::TemplateUnavailable,
            message: format!("Template '{}' unavailable: {}", template, reason),
        }
    }

    pub fn unknown_rectype(rectype: &str) -> Self {
        Self {
            code: SchemaErrorCode::UnknownRecordType,
            message: format!("Record type '{}' is not in the schema", rectype),
        }
    }

    pub fn serialization(reason: impl Into<String>) -> Self {
        Self {
            code: SchemaErrorCode::Serialization,
            message: reason.into(),
        }
    }

    /// Returns the error code
    pub fn code(&self) -> SchemaErrorCode {
        self.code
    }

    /// Returns the error message
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.code(), self.message)
    }
}

impl std::error::Error for SchemaError {}

/// Result type for schema operations
pub type SchemaResult<T> = Result<T, SchemaError>;
