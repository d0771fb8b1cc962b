//! Query AST structures
//!
//! Defines the caller-facing query representation: criteria tree, sort,
//! projection and pagination.

use serde_json::Value;

use super::errors::{CompileError, CompileResult};

/// Output key of the content hash projection
pub const HIDREC_KEY: &str = "_hidrec";

/// Output key of the full-text relevance column
pub const RELEVANCE_KEY: &str = "_relevance";

/// Output key of a junction record's recid inside an xref collection
pub const JUNCTION_RECID_KEY: &str = "_junction_recid";

/// Literal operand of a criteria node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
}

impl Literal {
    /// Literal from a JSON scalar; arrays, objects and fractions are rejected
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(Literal::Null),
            Value::Bool(b) => Some(Literal::Bool(*b)),
            Value::Number(n) => n.as_i64().map(Literal::Int),
            Value::String(s) => Some(Literal::Text(s.clone())),
            Value::Array(_) | Value::Object(_) => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Literal::Null => Value::Null,
            Literal::Bool(b) => Value::Bool(*b),
            Literal::Int(i) => Value::from(*i),
            Literal::Text(s) => Value::String(s.clone()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Literal::Null)
    }
}

impl From<i64> for Literal {
    fn from(value: i64) -> Self {
        Literal::Int(value)
    }
}

impl From<i32> for Literal {
    fn from(value: i32) -> Self {
        Literal::Int(i64::from(value))
    }
}

impl From<bool> for Literal {
    fn from(value: bool) -> Self {
        Literal::Bool(value)
    }
}

impl From<&str> for Literal {
    fn from(value: &str) -> Self {
        Literal::Text(value.to_string())
    }
}

impl From<String> for Literal {
    fn from(value: String) -> Self {
        Literal::Text(value)
    }
}

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
}

impl CompareOp {
    pub fn parse(op: &str) -> Option<Self> {
        match op {
            "<" => Some(CompareOp::Lt),
            ">" => Some(CompareOp::Gt),
            "<=" => Some(CompareOp::Le),
            ">=" => Some(CompareOp::Ge),
            "==" => Some(CompareOp::Eq),
            "!=" => Some(CompareOp::Ne),
            _ => None,
        }
    }

    pub fn sql(&self) -> &'static str {
        match self {
            CompareOp::Lt => "<",
            CompareOp::Gt => ">",
            CompareOp::Le => "<=",
            CompareOp::Ge => ">=",
            CompareOp::Eq => "=",
            CompareOp::Ne => "!=",
        }
    }
}

/// Criteria tree
#[derive(Debug, Clone, PartialEq)]
pub enum Criteria {
    /// field <op> literal
    Compare {
        field: String,
        op: CompareOp,
        value: Literal,
    },
    /// Full-text match on one field, or on every full-text field
    Match {
        field: Option<String>,
        phrase: String,
    },
    /// field is one of the literals
    In { field: String, values: Vec<Literal> },
    /// field is not null
    Exists(String),
    /// field is null
    IsNull(String),
    And(Box<Criteria>, Box<Criteria>),
    Or(Box<Criteria>, Box<Criteria>),
}

impl Criteria {
    pub fn compare(field: impl Into<String>, op: CompareOp, value: impl Into<Literal>) -> Self {
        Criteria::Compare {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Literal>) -> Self {
        Self::compare(field, CompareOp::Eq, value)
    }

    pub fn matches(field: impl Into<String>, phrase: impl Into<String>) -> Self {
        Criteria::Match {
            field: Some(field.into()),
            phrase: phrase.into(),
        }
    }

    pub fn matches_any(phrase: impl Into<String>) -> Self {
        Criteria::Match {
            field: None,
            phrase: phrase.into(),
        }
    }

    pub fn in_list<L: Into<Literal>>(
        field: impl Into<String>,
        values: impl IntoIterator<Item = L>,
    ) -> Self {
        Criteria::In {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn exists(field: impl Into<String>) -> Self {
        Criteria::Exists(field.into())
    }

    pub fn is_null(field: impl Into<String>) -> Self {
        Criteria::IsNull(field.into())
    }

    pub fn and(self, other: Criteria) -> Self {
        Criteria::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Criteria) -> Self {
        Criteria::Or(Box::new(self), Box::new(other))
    }

    /// Parse the nested-array form.
    ///
    /// ```text
    /// ["field", "<", 3]          ["field", "match", "phrase"]
    /// ["field", "in", [1, 2]]    ["field", "exists"]    ["field", "isnull"]
    /// [left, "&&", right]        [left, "||", right]
    /// ```
    pub fn from_json(value: &Value) -> CompileResult<Self> {
        let Value::Array(items) = value else {
            return Err(CompileError::invalid_argument(format!(
                "criteria node must be an array, got {}",
                value
            )));
        };

        match items.as_slice() {
            [left, Value::String(op), right] if op == "&&" || op == "||" => {
                let left = Self::from_json(left)?;
                let right = Self::from_json(right)?;
                Ok(if op == "&&" {
                    left.and(right)
                } else {
                    left.or(right)
                })
            }
            [Value::String(field), Value::String(op)] => match op.as_str() {
                "exists" => Ok(Criteria::exists(field.as_str())),
                "isnull" => Ok(Criteria::is_null(field.as_str())),
                other => Err(CompileError::invalid_argument(format!(
                    "unknown unary operator '{}'",
                    other
                ))),
            },
            [Value::String(field), Value::String(op), operand] => match op.as_str() {
                "match" => match operand {
                    Value::String(phrase) => Ok(Criteria::matches(field.as_str(), phrase.as_str())),
                    other => Err(CompileError::invalid_argument(format!(
                        "match phrase must be a string, got {}",
                        other
                    ))),
                },
                "in" => {
                    let Value::Array(values) = operand else {
                        return Err(CompileError::invalid_argument(
                            "'in' requires a list of literals",
                        ));
                    };
                    let values = values
                        .iter()
                        .map(|v| {
                            Literal::from_json(v).ok_or_else(|| {
                                CompileError::invalid_argument(format!("invalid literal {}", v))
                            })
                        })
                        .collect::<CompileResult<Vec<_>>>()?;
                    Ok(Criteria::In {
                        field: field.clone(),
                        values,
                    })
                }
                other => {
                    let op = CompareOp::parse(other).ok_or_else(|| {
                        CompileError::invalid_argument(format!("unknown operator '{}'", other))
                    })?;
                    let value = Literal::from_json(operand).ok_or_else(|| {
                        CompileError::invalid_argument(format!("invalid literal {}", operand))
                    })?;
                    Ok(Criteria::compare(field.as_str(), op, value))
                }
            },
            _ => Err(CompileError::invalid_argument(format!(
                "malformed criteria node {}",
                value
            ))),
        }
    }
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

/// Sort specification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortSpec {
    /// Field or projection alias to sort by
    pub field: String,
    /// Sort direction
    pub direction: SortDirection,
}

impl SortSpec {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Desc,
        }
    }
}

/// One entry of a projection list
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Projection {
    /// A field of the queried record type
    Field { name: String, alias: Option<String> },
    /// Every field of the queried record type
    AllFields,
    /// The content hash of the current version
    ContentHash,
    /// Changeset and audit trail of the record
    History,
    /// One-to-one forward reference; nested under `alias` (default: the field)
    Follow {
        ref_field: String,
        fields: Vec<String>,
        alias: Option<String>,
    },
    /// One-to-many: records of `rectype` whose `ref_field` points here
    Reverse {
        rectype: String,
        ref_field: String,
        fields: Vec<String>,
        alias: String,
    },
    /// Many-to-many through a junction record type
    Xref {
        junction: String,
        ref_to_me: String,
        ref_to_other: String,
        fields: Vec<String>,
        alias: String,
        expose_junction_recid: bool,
    },
    /// Display name of a userid field, from the identity table
    Username { field: String, alias: Option<String> },
}

impl Projection {
    pub fn field(name: impl Into<String>) -> Self {
        Projection::Field {
            name: name.into(),
            alias: None,
        }
    }

    pub fn field_as(name: impl Into<String>, alias: impl Into<String>) -> Self {
        Projection::Field {
            name: name.into(),
            alias: Some(alias.into()),
        }
    }

    pub fn follow(ref_field: impl Into<String>) -> Self {
        Projection::Follow {
            ref_field: ref_field.into(),
            fields: Vec::new(),
            alias: None,
        }
    }

    pub fn reverse(
        rectype: impl Into<String>,
        ref_field: impl Into<String>,
        fields: &[&str],
        alias: impl Into<String>,
    ) -> Self {
        Projection::Reverse {
            rectype: rectype.into(),
            ref_field: ref_field.into(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
            alias: alias.into(),
        }
    }

    pub fn xref(
        junction: impl Into<String>,
        ref_to_me: impl Into<String>,
        ref_to_other: impl Into<String>,
        fields: &[&str],
        alias: impl Into<String>,
    ) -> Self {
        Projection::Xref {
            junction: junction.into(),
            ref_to_me: ref_to_me.into(),
            ref_to_other: ref_to_other.into(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
            alias: alias.into(),
            expose_junction_recid: false,
        }
    }

    pub fn username(field: impl Into<String>, alias: impl Into<String>) -> Self {
        Projection::Username {
            field: field.into(),
            alias: Some(alias.into()),
        }
    }
}

/// A query against one record type
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    /// Record type to query
    pub rectype: String,
    /// Optional criteria tree
    pub criteria: Option<Criteria>,
    /// Sort terms, applied in order
    pub sort: Vec<SortSpec>,
    /// Projection list; empty means every field
    pub projection: Vec<Projection>,
    pub limit: Option<u64>,
    pub skip: Option<u64>,
    /// Changeset the query is scoped to
    pub as_of: Option<String>,
}

impl Query {
    pub fn new(rectype: impl Into<String>) -> Self {
        Self {
            rectype: rectype.into(),
            criteria: None,
            sort: Vec::new(),
            projection: Vec::new(),
            limit: None,
            skip: None,
            as_of: None,
        }
    }

    pub fn with_criteria(mut self, criteria: Criteria) -> Self {
        self.criteria = Some(criteria);
        self
    }

    pub fn with_sort(mut self, sort: SortSpec) -> Self {
        self.sort.push(sort);
        self
    }

    pub fn with_projection(mut self, projection: Projection) -> Self {
        self.projection.push(projection);
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn as_of(mut self, csid: impl Into<String>) -> Self {
        self.as_of = Some(csid.into());
        self
    }
}
