//! Values exchanged with the DAG and blob collaborators

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Content hash of a changeset
pub type ChangesetId = String;

/// Content hash of one record version
pub type Hidrec = String;

/// Record-identity capabilities of a DAG type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DagKind {
    /// Records carry a stable `recid`
    pub has_recid: bool,
    /// Fields may be declared unique and looked up as such
    pub allows_unique: bool,
}

impl DagKind {
    /// Record DAG with recids and unique constraints
    pub fn with_recid() -> Self {
        Self {
            has_recid: true,
            allows_unique: true,
        }
    }

    /// Record DAG whose records are identified only by content hash
    pub fn recid_less() -> Self {
        Self {
            has_recid: false,
            allows_unique: false,
        }
    }
}

impl Default for DagKind {
    fn default() -> Self {
        Self::with_recid()
    }
}

/// Add/remove sets between two states
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delta {
    pub add: BTreeSet<Hidrec>,
    pub remove: BTreeSet<Hidrec>,
}

impl Delta {
    pub fn new(add: BTreeSet<Hidrec>, remove: BTreeSet<Hidrec>) -> Self {
        Self { add, remove }
    }

    /// Delta from the empty root state
    pub fn from_root(add: BTreeSet<Hidrec>) -> Self {
        Self {
            add,
            remove: BTreeSet::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }
}

/// Delta of a changeset relative to one of its parents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentDelta {
    /// Parent changeset; `None` for the root changeset
    pub parent: Option<ChangesetId>,
    pub delta: Delta,
}

/// Editor and time of a changeset
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Audit {
    pub userid: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
}

impl Audit {
    pub fn new(userid: impl Into<String>, timestamp: i64) -> Self {
        Self {
            userid: userid.into(),
            timestamp,
        }
    }

    /// Fixed-width key: zero-padded timestamp followed by the editor id.
    ///
    /// Lexicographic order of keys is chronological order of audits.
    pub fn dedup_key(&self) -> String {
        format!("{:020}{}", self.timestamp, self.userid)
    }
}

/// Everything the index needs from one changeset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangesetData {
    pub csid: ChangesetId,
    pub generation: u64,
    pub template_id: String,
    /// One entry per parent, or a single `parent: None` entry for the root
    pub deltas: Vec<ParentDelta>,
    pub audits: Vec<Audit>,
}

impl ChangesetData {
    /// Parent ids, in delta order
    pub fn parents(&self) -> impl Iterator<Item = &str> {
        self.deltas.iter().filter_map(|d| d.parent.as_deref())
    }

    /// Records new in this changeset.
    ///
    /// For merges a record is new only if it is an add relative to every
    /// parent; an add relative to some parents only already existed on the
    /// other side of the merge.
    pub fn new_records(&self) -> BTreeSet<Hidrec> {
        let mut deltas = self.deltas.iter();
        let Some(first) = deltas.next() else {
            return BTreeSet::new();
        };

        let mut new = first.delta.add.clone();
        for other in deltas {
            new.retain(|hidrec| other.delta.add.contains(hidrec));
        }
        new
    }
}

/// Record content fetched from the blob store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub rectype: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recid: Option<String>,
    pub fields: Map<String, Value>,
}

impl StoredRecord {
    pub fn new(rectype: impl Into<String>, recid: Option<String>, fields: Map<String, Value>) -> Self {
        Self {
            rectype: rectype.into(),
            recid,
            fields,
        }
    }
}
