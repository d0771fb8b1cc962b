//! Assembled result types

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::dag::Audit;

/// One logical record of a query result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Grouping key: recid, or the content-row id
    pub key: Value,
    /// Scalars, nested follow objects and sub-collection arrays
    pub fields: Map<String, Value>,
    /// Changeset trail, newest generation first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<HistoryEntry>,
}

impl Record {
    pub fn new(key: Value) -> Self {
        Self {
            key,
            fields: Map::new(),
            history: Vec::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// String value of a field, if it is a string
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    /// Items of a sub-collection
    pub fn collection(&self, name: &str) -> Option<&Vec<Value>> {
        self.fields.get(name).and_then(Value::as_array)
    }
}

/// A changeset in which a version of the record became current
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub csid: String,
    pub hidrec: String,
    pub generation: u64,
    /// De-duplicated, in chronological order
    pub audits: Vec<Audit>,
    /// Value of the requested field in this version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}
