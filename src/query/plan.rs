//! Typed query plan
//!
//! A plan is produced by the compiler and consumed twice: the renderer turns
//! it into one parameterized statement, and the assembler uses the column
//! roles to regroup the rows that statement returns.

use std::collections::HashMap;

use rusqlite::types::Value as SqlValue;

use super::ast::{CompareOp, SortDirection};
use crate::schema::FieldType;

/// Index of a join in its plan's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JoinHandle(pub usize);

/// What a join attaches to the base row.
///
/// Two joins with equal kinds are the same join.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JoinKind {
    /// Target record whose recid the base's reference field holds
    Follow { target: String, ref_field: String },
    /// Records of `rectype` whose reference field holds the base's recid
    Reverse { rectype: String, ref_field: String },
    /// Junction records whose `ref_to_me` holds the base's recid
    Junction { rectype: String, ref_to_me: String },
    /// Record the junction's `ref_to_other` points to
    XrefTarget {
        junction: JoinHandle,
        target: String,
        ref_to_other: String,
    },
    /// Identity table row of a userid field
    Username { field: String },
    /// Rank table of the field's only ordering
    Ordering { field: String, ordering: String },
    /// Full-text hits for a phrase, with their relevance
    FullText { field: Option<String>, phrase: String },
    /// Every indexed version sharing the base's recid
    HistoryVersions,
    /// History entries of a version; `None` means of the base row itself
    HistoryLog { versions: Option<JoinHandle> },
    /// Changeset of a history entry
    HistoryChangeset { log: JoinHandle },
    /// Audits of a history entry's changeset
    HistoryAudit { log: JoinHandle },
}

impl JoinKind {
    /// Junctions render as `x###`, every other join as `t###`
    pub fn alias_prefix(&self) -> char {
        match self {
            JoinKind::Junction { .. } => 'x',
            _ => 't',
        }
    }
}

/// Joins of one plan, de-duplicated by kind.
///
/// Aliases are derived from insertion order: the n-th join with a given
/// prefix is `<prefix>{n:03}`.
#[derive(Debug, Clone, Default)]
pub struct JoinArena {
    joins: Vec<JoinKind>,
    index: HashMap<JoinKind, JoinHandle>,
}

impl JoinArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle of the join, adding it on first use
    pub fn intern(&mut self, kind: JoinKind) -> JoinHandle {
        if let Some(handle) = self.index.get(&kind) {
            return *handle;
        }
        let handle = JoinHandle(self.joins.len());
        self.joins.push(kind.clone());
        self.index.insert(kind, handle);
        handle
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (JoinHandle, &JoinKind)> {
        self.joins.iter().enumerate().map(|(i, k)| (JoinHandle(i), k))
    }

    /// Aliases of every join, indexed by handle
    pub fn aliases(&self) -> Vec<String> {
        let mut counters: HashMap<char, usize> = HashMap::new();
        self.joins
            .iter()
            .map(|kind| {
                let prefix = kind.alias_prefix();
                let n = counters.entry(prefix).or_insert(0);
                *n += 1;
                format!("{}{:03}", prefix, n)
            })
            .collect()
    }
}

/// Table a column is read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnSource {
    Base,
    Join(JoinHandle),
}

/// A value expression of the plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnExpr {
    /// Physical column of the base table or a join
    Column { source: ColumnSource, column: String },
    /// `round(1000 * sum of the joins' relevance)`
    Relevance(Vec<JoinHandle>),
}

impl ColumnExpr {
    pub fn base(column: impl Into<String>) -> Self {
        ColumnExpr::Column {
            source: ColumnSource::Base,
            column: column.into(),
        }
    }

    pub fn join(handle: JoinHandle, column: impl Into<String>) -> Self {
        ColumnExpr::Column {
            source: ColumnSource::Join(handle),
            column: column.into(),
        }
    }
}

/// History attribute carried by a column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryField {
    Changeset,
    ContentHash,
    Generation,
    AuditUser,
    AuditTime,
    /// Value of the history field of the version
    Value,
}

/// Where a column's value goes in the assembled record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnRole {
    /// Identifies the logical record; always the first column
    GroupKey,
    /// Written once per record, optionally nested under a key
    Scalar {
        name: String,
        nested: Option<String>,
    },
    /// Accumulated into the history list
    History(HistoryField),
    /// Identifies an item of a sub-collection
    SubCollectionKey { collection: String },
    /// Field of a sub-collection item
    SubCollection { collection: String, field: String },
}

impl ColumnRole {
    /// Output name used as the column alias in the rendered statement
    pub fn output_name(&self, position: usize) -> String {
        match self {
            ColumnRole::Scalar { name, nested: None } => name.clone(),
            ColumnRole::Scalar {
                name,
                nested: Some(parent),
            } => format!("{}.{}", parent, name),
            ColumnRole::SubCollection { collection, field } => format!("{}.{}", collection, field),
            _ => format!("_c{}", position),
        }
    }
}

/// One output column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanColumn {
    pub expr: ColumnExpr,
    pub role: ColumnRole,
    /// Field type used to decode the value, if it is a field
    pub field_type: Option<FieldType>,
}

/// WHERE expression
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Compare {
        expr: ColumnExpr,
        op: CompareOp,
        value: SqlValue,
    },
    IsNull {
        expr: ColumnExpr,
        negated: bool,
    },
    InList {
        expr: ColumnExpr,
        values: Vec<SqlValue>,
    },
    /// Membership in a registered temp set, by index into `temp_sets`
    InTempSet { expr: ColumnExpr, set: usize },
    /// Row has a hit in the full-text join
    FullText(JoinHandle),
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
}

/// Values of a large `in` list, loaded into a temporary table at execution
#[derive(Debug, Clone, PartialEq)]
pub struct TempSet {
    pub name: String,
    pub values: Vec<SqlValue>,
}

/// ORDER BY operand
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderExpr {
    Column(ColumnExpr),
    /// Output column alias, passed through as is
    Alias(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderTerm {
    pub expr: OrderExpr,
    pub direction: SortDirection,
}

/// Skip and limit, counted in logical records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pagination {
    pub skip: u64,
    pub limit: Option<u64>,
}

impl Pagination {
    pub fn from_parts(limit: Option<u64>, skip: Option<u64>) -> Option<Self> {
        if limit.is_none() && skip.unwrap_or(0) == 0 {
            return None;
        }
        Some(Self {
            skip: skip.unwrap_or(0),
            limit,
        })
    }
}

/// Where record and full-text tables are read from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableSource {
    /// Every indexed version, in the main database
    Current,
    /// Live records of one changeset, in the attached state filter
    Snapshot,
}

/// A compiled query
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub rectype: String,
    pub source: TableSource,
    /// First column is always the grouping key
    pub columns: Vec<PlanColumn>,
    pub joins: JoinArena,
    pub predicate: Option<Predicate>,
    pub order: Vec<OrderTerm>,
    /// Pagination applied by the statement
    pub pushed: Option<Pagination>,
    /// Pagination applied by the assembler
    pub deferred: Option<Pagination>,
    pub temp_sets: Vec<TempSet>,
    pub with_history: bool,
    pub multirow: bool,
}

impl QueryPlan {
    pub fn roles(&self) -> Vec<ColumnRole> {
        self.columns.iter().map(|c| c.role.clone()).collect()
    }

    pub fn field_types(&self) -> Vec<Option<FieldType>> {
        self.columns.iter().map(|c| c.field_type).collect()
    }
}
