//! Schema type definitions
//!
//! Supported field types:
//! - string, userid, attachment, reference: stored as text
//! - int, bool: stored as integers
//! - datetime: stored as integer milliseconds since the Unix epoch

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::errors::{SchemaError, SchemaResult};
use crate::dag::DagKind;

/// Name of the implicit stable-identifier field
pub const RECID_FIELD: &str = "recid";

/// Supported field types
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    #[default]
    String,
    Int,
    Datetime,
    Bool,
    Attachment,
    Userid,
    Reference,
}

impl FieldType {
    /// Returns the type name for error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Int => "int",
            FieldType::Datetime => "datetime",
            FieldType::Bool => "bool",
            FieldType::Attachment => "attachment",
            FieldType::Userid => "userid",
            FieldType::Reference => "reference",
        }
    }

    /// Integerish types compare numerically, everything else as text
    pub fn is_integerish(&self) -> bool {
        matches!(self, FieldType::Int | FieldType::Datetime | FieldType::Bool)
    }

    /// Column affinity in the backing store
    pub fn sql_affinity(&self) -> &'static str {
        if self.is_integerish() {
            "INTEGER"
        } else {
            "TEXT"
        }
    }
}

/// A named ranking of field values.
///
/// The rank of a value is its position in `values`; sorting on a field with
/// one ordering sorts by rank instead of by raw value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldOrdering {
    pub name: String,
    pub values: Vec<Value>,
}

impl FieldOrdering {
    pub fn new(name: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }
}

/// Field definition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub indexed: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub full_text: bool,
    /// Named ranking tables, sorted by name
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub orderings: Vec<FieldOrdering>,
    /// Target record type of a reference field
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_target: Option<String>,
}

impl FieldSpec {
    pub fn of_type(field_type: FieldType) -> Self {
        Self {
            field_type,
            ..Self::default()
        }
    }

    pub fn string() -> Self {
        Self::of_type(FieldType::String)
    }

    pub fn int() -> Self {
        Self::of_type(FieldType::Int)
    }

    pub fn datetime() -> Self {
        Self::of_type(FieldType::Datetime)
    }

    pub fn boolean() -> Self {
        Self::of_type(FieldType::Bool)
    }

    pub fn attachment() -> Self {
        Self::of_type(FieldType::Attachment)
    }

    pub fn userid() -> Self {
        Self::of_type(FieldType::Userid)
    }

    /// Reference to a record of `target` by its recid
    pub fn reference(target: impl Into<String>) -> Self {
        Self {
            ref_target: Some(target.into()),
            ..Self::of_type(FieldType::Reference)
        }
    }

    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn full_text(mut self) -> Self {
        self.full_text = true;
        self
    }

    pub fn with_ordering(mut self, name: impl Into<String>, values: Vec<Value>) -> Self {
        self.orderings.push(FieldOrdering::new(name, values));
        self.orderings.sort_by(|a, b| a.name.cmp(&b.name));
        self
    }

    /// The ordering used for sorting, if the field has exactly one
    pub fn sort_ordering(&self) -> Option<&FieldOrdering> {
        match self.orderings.as_slice() {
            [only] => Some(only),
            _ => None,
        }
    }
}

/// A record type: name plus fields ordered by name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordType {
    pub name: String,
    pub fields: BTreeMap<String, FieldSpec>,
}

impl RecordType {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.get(name)
    }

    /// Names of full-text fields, in field order
    pub fn full_text_fields(&self) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|(_, spec)| spec.full_text)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn has_recid(&self) -> bool {
        self.fields.contains_key(RECID_FIELD)
    }
}

/// Union of the record types of every template active for a DAG.
///
/// Record types and fields are kept in name order, so the serialized form is
/// deterministic and its fingerprint identifies the schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeSchema {
    pub kind: DagKind,
    /// Template ids, sorted and de-duplicated
    pub templates: Vec<String>,
    pub rectypes: BTreeMap<String, RecordType>,
}

impl CompositeSchema {
    /// Schema of an index that has not seen any template yet
    pub fn empty(kind: DagKind) -> Self {
        Self {
            kind,
            templates: Vec::new(),
            rectypes: BTreeMap::new(),
        }
    }

    pub fn rectype(&self, name: &str) -> Option<&RecordType> {
        self.rectypes.get(name)
    }

    pub fn field(&self, rectype: &str, field: &str) -> Option<&FieldSpec> {
        self.rectype(rectype).and_then(|rt| rt.field(field))
    }

    /// Serialized form embedded in state filters
    pub fn to_json(&self) -> SchemaResult<String> {
        serde_json::to_string(self).map_err(|e| SchemaError::serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> SchemaResult<Self> {
        serde_json::from_str(json).map_err(|e| SchemaError::serialization(e.to_string()))
    }

    /// SHA-256 of the serialized form, hex encoded
    pub fn fingerprint(&self) -> SchemaResult<String> {
        let json = self.to_json()?;
        let digest = Sha256::digest(json.as_bytes());
        Ok(format!("{:x}", digest))
    }
}
