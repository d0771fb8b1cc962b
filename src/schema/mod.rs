//! Schema Catalog
//!
//! Merges the field definitions of every template active for a DAG into one
//! composite schema.
//!
//! # Design Principles
//!
//! - Deterministic: record types and fields are ordered by name
//! - Identified by fingerprint: filters embed the schema they were built with
//! - Recomputed, never mutated, when the template set changes

mod catalog;
mod errors;
mod types;

pub use catalog::{validate_name, SchemaCatalog};
pub use errors::{SchemaError, SchemaErrorCode, SchemaResult};
pub use types::{
    CompositeSchema, FieldOrdering, FieldSpec, FieldType, RecordType, RECID_FIELD,
};
