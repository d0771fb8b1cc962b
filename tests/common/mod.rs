//! Shared fixtures: an in-memory DAG, blob store and template layer.
//!
//! Records are content-addressed by the SHA-256 of their JSON form. Each
//! commit stores its full live set, so deltas between any two changesets
//! are plain set differences.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dagindex::dag::{
    Audit, BlobStore, ChangesetData, ChangesetId, ChangesetSource, CollaboratorError,
    CollaboratorResult, DagKind, Delta, Hidrec, ParentDelta, StoredRecord, TemplateSource,
};
use dagindex::schema::FieldSpec;
use dagindex::{IndexConfig, RecordIndex};

struct Node {
    generation: u64,
    parents: Vec<ChangesetId>,
    template: String,
    audits: Vec<Audit>,
    live: BTreeSet<Hidrec>,
}

/// DAG, blob store and template source in one
pub struct MemoryRepo {
    kind: DagKind,
    templates: HashMap<String, BTreeMap<String, BTreeMap<String, FieldSpec>>>,
    nodes: HashMap<ChangesetId, Node>,
    blobs: HashMap<Hidrec, StoredRecord>,
}

impl MemoryRepo {
    pub fn new(kind: DagKind) -> Self {
        Self {
            kind,
            templates: HashMap::new(),
            nodes: HashMap::new(),
            blobs: HashMap::new(),
        }
    }

    /// Add a record type to a template
    pub fn define(&mut self, template: &str, rectype: &str, fields: Vec<(&str, FieldSpec)>) {
        let rectypes = self.templates.entry(template.to_string()).or_default();
        let defined = rectypes.entry(rectype.to_string()).or_default();
        for (name, spec) in fields {
            defined.insert(name.to_string(), spec);
        }
    }

    /// Store a record version and return its content hash
    pub fn put(&mut self, rectype: &str, recid: Option<&str>, fields: Value) -> Hidrec {
        let fields: Map<String, Value> = match fields {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let record = StoredRecord::new(rectype, recid.map(str::to_string), fields);
        let bytes = serde_json::to_vec(&record).unwrap_or_default();
        let hidrec = format!("{:x}", Sha256::digest(&bytes));
        self.blobs.insert(hidrec.clone(), record);
        hidrec
    }

    /// Commit a changeset on top of `parents`.
    ///
    /// The live set is the union of the parents' live sets, minus `deletes`,
    /// plus `puts`.
    pub fn commit(
        &mut self,
        parents: &[&str],
        template: &str,
        puts: &[Hidrec],
        deletes: &[Hidrec],
    ) -> ChangesetId {
        self.commit_with_audits(parents, template, puts, deletes, Vec::new())
    }

    pub fn commit_with_audits(
        &mut self,
        parents: &[&str],
        template: &str,
        puts: &[Hidrec],
        deletes: &[Hidrec],
        audits: Vec<Audit>,
    ) -> ChangesetId {
        let mut live: BTreeSet<Hidrec> = BTreeSet::new();
        let mut generation = 0;
        for parent in parents {
            let node = &self.nodes[*parent];
            live.extend(node.live.iter().cloned());
            generation = generation.max(node.generation + 1);
        }
        for hidrec in deletes {
            live.remove(hidrec);
        }
        live.extend(puts.iter().cloned());

        let seed = json!({
            "parents": parents,
            "template": template,
            "live": live,
            "n": self.nodes.len(),
        });
        let digest = format!("{:x}", Sha256::digest(seed.to_string().as_bytes()));
        let csid = digest[..16].to_string();

        self.nodes.insert(
            csid.clone(),
            Node {
                generation,
                parents: parents.iter().map(|p| p.to_string()).collect(),
                template: template.to_string(),
                audits,
                live,
            },
        );
        csid
    }

    pub fn live(&self, csid: &str) -> BTreeSet<Hidrec> {
        self.nodes[csid].live.clone()
    }

    fn node(&self, csid: &str) -> CollaboratorResult<&Node> {
        self.nodes
            .get(csid)
            .ok_or_else(|| CollaboratorError::UnknownChangeset(csid.to_string()))
    }
}

impl ChangesetSource for MemoryRepo {
    fn dag_id(&self) -> &str {
        "memory"
    }

    fn kind(&self) -> DagKind {
        self.kind
    }

    fn generation(&self, csid: &str) -> CollaboratorResult<u64> {
        Ok(self.node(csid)?.generation)
    }

    fn parents(&self, csid: &str) -> CollaboratorResult<Vec<ChangesetId>> {
        Ok(self.node(csid)?.parents.clone())
    }

    fn delta(&self, base: &str, target: &str) -> CollaboratorResult<Delta> {
        let base = &self.node(base)?.live;
        let target = &self.node(target)?.live;
        Ok(Delta::new(
            target.difference(base).cloned().collect(),
            base.difference(target).cloned().collect(),
        ))
    }

    fn delta_from_root(&self, csid: &str) -> CollaboratorResult<BTreeSet<Hidrec>> {
        Ok(self.node(csid)?.live.clone())
    }

    fn load(&self, csid: &str) -> CollaboratorResult<ChangesetData> {
        let node = self.node(csid)?;
        let deltas = if node.parents.is_empty() {
            vec![ParentDelta {
                parent: None,
                delta: Delta::from_root(node.live.clone()),
            }]
        } else {
            node.parents
                .iter()
                .map(|parent| {
                    Ok(ParentDelta {
                        parent: Some(parent.clone()),
                        delta: self.delta(parent, csid)?,
                    })
                })
                .collect::<CollaboratorResult<_>>()?
        };
        Ok(ChangesetData {
            csid: csid.to_string(),
            generation: node.generation,
            template_id: node.template.clone(),
            deltas,
            audits: node.audits.clone(),
        })
    }
}

impl BlobStore for MemoryRepo {
    fn fetch(&self, hidrec: &str) -> CollaboratorResult<StoredRecord> {
        self.blobs
            .get(hidrec)
            .cloned()
            .ok_or_else(|| CollaboratorError::UnknownRecord(hidrec.to_string()))
    }
}

impl TemplateSource for MemoryRepo {
    fn list_rectypes(&self, template_id: &str) -> CollaboratorResult<Vec<String>> {
        self.templates
            .get(template_id)
            .map(|rectypes| rectypes.keys().cloned().collect())
            .ok_or_else(|| CollaboratorError::UnknownTemplate(template_id.to_string()))
    }

    fn fields_for_rectype(
        &self,
        template_id: &str,
        rectype: &str,
    ) -> CollaboratorResult<BTreeMap<String, FieldSpec>> {
        self.templates
            .get(template_id)
            .and_then(|rectypes| rectypes.get(rectype))
            .cloned()
            .ok_or_else(|| CollaboratorError::UnknownTemplate(template_id.to_string()))
    }
}

pub type Repo = std::sync::Arc<MemoryRepo>;
pub type Index = RecordIndex<Repo, Repo, Repo>;

/// Route index logs to the test output; `RUST_LOG` picks the level
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dagindex=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

/// Open an index over a finished repository
pub fn open_index(repo: &Repo, root: &Path, config: IndexConfig) -> Index {
    init_tracing();
    RecordIndex::open(repo.clone(), repo.clone(), repo.clone(), root, config).unwrap()
}

/// Configuration with short waits for tests
pub fn test_config() -> IndexConfig {
    IndexConfig {
        filter_wait_timeout_ms: 5_000,
        filter_poll_interval_ms: 10,
        busy_retry_interval_ms: 10,
        busy_timeout_ms: 5_000,
        ..IndexConfig::default()
    }
}

/// The `item` record type used by most scenarios
pub fn item_template(repo: &mut MemoryRepo) {
    repo.define(
        "t1",
        "item",
        vec![
            ("name", FieldSpec::string().indexed()),
            ("code", FieldSpec::string().unique()),
            ("priority", FieldSpec::int()),
            ("body", FieldSpec::string().full_text()),
            ("owner", FieldSpec::reference("person")),
            ("editor", FieldSpec::userid()),
        ],
    );
    repo.define(
        "t1",
        "person",
        vec![("name", FieldSpec::string()), ("age", FieldSpec::int())],
    );
    repo.define(
        "t1",
        "tag",
        vec![
            ("item", FieldSpec::reference("item")),
            ("label", FieldSpec::string()),
        ],
    );
}

/// Names of records, in result order
pub fn names(records: &[dagindex::assemble::Record]) -> Vec<String> {
    records
        .iter()
        .filter_map(|r| r.get_str("name").map(str::to_string))
        .collect()
}
