//! Record index
//!
//! `RecordIndex` ties the subsystems together for one DAG: it ingests
//! changesets into the main database, materializes state filters on demand
//! and answers queries either over every indexed version or as of one
//! changeset.
//!
//! Layout under the index root:
//!
//! ```text
//! <root>/
//! ├── index.sqlite     record tables, full-text tables, logs
//! └── filters/         state filters, build locks
//! ```

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::{params, Connection, OpenFlags};
use serde_json::Value;
use tracing::{info, warn};

use crate::assemble::Record;
use crate::config::IndexConfig;
use crate::dag::{BlobStore, ChangesetData, ChangesetSource, TemplateSource};
use crate::error::{IndexError, IndexResult};
use crate::filter::{
    compare, evict, stored_hidrecs, EvictionPolicy, EvictionReport, FilterMismatch, FilterPaths,
    Materializer, StateFilter,
};
use crate::ingest::{IngestSession, IngestStats};
use crate::query::{
    render, CompileError, CompileResult, Criteria, Literal, Projection, Query, QueryCompiler,
    QueryExecutor, QueryPlan, RenderedQuery, SortSpec, RELEVANCE_KEY,
};
use crate::schema::{CompositeSchema, SchemaCatalog};
use crate::store::naming::MAIN_SCHEMA;
use crate::store::{with_busy_retry, RetryPolicy, Store, StoreError};

/// File name of the main database under the index root
pub const MAIN_DB_FILE: &str = "index.sqlite";

/// Versioned record index of one DAG
pub struct RecordIndex<D: ChangesetSource, B: BlobStore, T: TemplateSource> {
    dag: D,
    blobs: B,
    templates: T,
    root: PathBuf,
    store: Store,
    paths: FilterPaths,
    config: IndexConfig,
    schema: Arc<CompositeSchema>,
}

impl<D: ChangesetSource, B: BlobStore, T: TemplateSource> RecordIndex<D, B, T> {
    /// Open or create the index under `root`.
    ///
    /// The composite schema is rebuilt from the templates already ingested.
    pub fn open(dag: D, blobs: B, templates: T, root: &Path, config: IndexConfig) -> IndexResult<Self> {
        config.validate()?;
        let retry = RetryPolicy::from_config(&config);
        let store = Store::open(&root.join(MAIN_DB_FILE), retry)?;

        let known = known_templates(store.conn())?;
        let schema = if known.is_empty() {
            CompositeSchema::empty(dag.kind())
        } else {
            SchemaCatalog::new(&templates, dag.kind()).build_composite_schema(&known)?
        };

        info!(
            dag = %dag.dag_id(),
            root = %root.display(),
            templates = known.len(),
            "opened record index"
        );
        Ok(Self {
            dag,
            blobs,
            templates,
            root: root.to_path_buf(),
            store,
            paths: FilterPaths::new(root),
            config,
            schema: Arc::new(schema),
        })
    }

    /// Current composite schema
    pub fn schema(&self) -> &CompositeSchema {
        &self.schema
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dag(&self) -> &D {
        &self.dag
    }

    /// Index changesets in generation order, in one session.
    ///
    /// A new template recomputes the composite schema first. Any failure
    /// rolls back the whole batch.
    pub fn ingest<S: AsRef<str>>(&mut self, csids: &[S]) -> IndexResult<IngestStats> {
        let mut changesets: Vec<ChangesetData> = csids
            .iter()
            .map(|id| self.dag.load(id.as_ref()))
            .collect::<Result<_, _>>()?;
        changesets.sort_by(|a, b| {
            a.generation
                .cmp(&b.generation)
                .then_with(|| a.csid.cmp(&b.csid))
        });

        let mut templates: BTreeSet<String> = self.schema.templates.iter().cloned().collect();
        let known = templates.len();
        templates.extend(changesets.iter().map(|cs| cs.template_id.clone()));
        let schema = if templates.len() == known {
            Arc::clone(&self.schema)
        } else {
            let templates: Vec<String> = templates.into_iter().collect();
            let schema = SchemaCatalog::new(&self.templates, self.dag.kind())
                .build_composite_schema(&templates)?;
            info!(templates = templates.len(), "recomputed composite schema");
            Arc::new(schema)
        };

        let mut session =
            IngestSession::begin(self.store.conn(), &schema, &self.blobs, *self.store.retry())?;
        for cs in &changesets {
            if let Err(e) = session.ingest(cs) {
                if let Err(abort) = session.abort() {
                    warn!(error = %abort, "rollback after failed ingestion failed");
                }
                return Err(e);
            }
        }
        let stats = session.end()?;

        self.schema = schema;
        Ok(stats)
    }

    /// Insert or rename an entry of the identity table used by `username`
    pub fn upsert_user(&self, userid: &str, name: &str) -> IndexResult<()> {
        with_busy_retry(self.store.retry(), "upsert user", || {
            self.store.conn().execute(
                "INSERT INTO users (userid, name) VALUES (?1, ?2)
                 ON CONFLICT(userid) DO UPDATE SET name = excluded.name",
                params![userid, name],
            )
        })?;
        Ok(())
    }

    /// Make the state filter of `csid` available
    pub fn state_filter(&self, csid: &str) -> IndexResult<StateFilter> {
        let materializer =
            Materializer::new(&self.dag, self.store.path(), &self.paths, &self.config);
        Ok(materializer.ensure(self.store.conn(), csid, &self.schema)?)
    }

    /// Records matching `query`
    pub fn query(&self, query: &Query) -> IndexResult<Vec<Record>> {
        self.execute(
            query.as_of.as_deref(),
            |compiler| compiler.compile(query),
            |executor, plan| executor.run(plan),
        )
    }

    /// The record whose unique `field` equals `value`.
    ///
    /// In a snapshot more than one match is an error. Without one the most
    /// recently indexed version is returned.
    pub fn query_one(
        &self,
        as_of: Option<&str>,
        rectype: &str,
        field: &str,
        value: impl Into<Literal>,
        projection: &[Projection],
    ) -> IndexResult<Option<Record>> {
        let value = value.into();
        let mut records = self.execute(
            as_of,
            |compiler| compiler.compile_lookup(rectype, field, value, projection, as_of),
            |executor, plan| executor.run(plan),
        )?;
        if as_of.is_some() && records.len() > 1 {
            return Err(CompileError::invalid_argument(format!(
                "lookup of '{}.{}' matched more than one record",
                rectype, field
            ))
            .into());
        }
        Ok(records.pop())
    }

    /// Full-text search.
    ///
    /// `query` supplies record type, snapshot, pagination, projection and
    /// any further criteria. Results are sorted by relevance, highest first,
    /// unless the query sorts.
    pub fn full_text_query(
        &self,
        mut query: Query,
        field: Option<&str>,
        phrase: &str,
    ) -> IndexResult<Vec<Record>> {
        let matcher = match field {
            Some(field) => Criteria::matches(field, phrase),
            None => Criteria::matches_any(phrase),
        };
        query.criteria = Some(match query.criteria.take() {
            Some(criteria) => matcher.and(criteria),
            None => matcher,
        });
        if query.sort.is_empty() {
            query.sort.push(SortSpec::desc(RELEVANCE_KEY));
        }
        self.query(&query)
    }

    /// Number of logical records matching the criteria of `query`
    pub fn count(&self, query: &Query) -> IndexResult<u64> {
        self.execute(
            query.as_of.as_deref(),
            |compiler| compiler.compile_count(query),
            |executor, plan| executor.count(plan),
        )
    }

    /// Changeset trail of the given records, newest generation first
    pub fn history(
        &self,
        rectype: &str,
        recids: &[String],
        field: Option<&str>,
    ) -> IndexResult<Vec<Record>> {
        self.execute(
            None,
            |compiler| compiler.compile_history(rectype, recids, field),
            |executor, plan| executor.run(plan),
        )
    }

    /// Physical rows of `query` before regrouping
    pub fn physical_rows(&self, query: &Query) -> IndexResult<Vec<Vec<Value>>> {
        self.execute(
            query.as_of.as_deref(),
            |compiler| compiler.compile(query),
            |executor, plan| executor.physical_rows(plan),
        )
    }

    /// Statement `query` compiles to against the current schema
    pub fn explain(&self, query: &Query) -> IndexResult<RenderedQuery> {
        let compiler = QueryCompiler::new(&self.schema, self.config.inline_in_list_max);
        Ok(render(&compiler.compile(query)?))
    }

    /// Compare the filter of `csid` with the DAG's live set.
    ///
    /// With `strict_consistency` any mismatch is an error.
    pub fn verify_filter(&self, csid: &str) -> IndexResult<Vec<FilterMismatch>> {
        let filter = self.state_filter(csid)?;
        let conn = Connection::open_with_flags(
            &filter.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        let actual = stored_hidrecs(&conn, MAIN_SCHEMA, &filter.schema)?;
        let expected = self.dag.delta_from_root(csid)?;

        let mismatches = compare(&expected, &actual);
        for mismatch in &mismatches {
            warn!(csid, mismatch = ?mismatch, "state filter mismatch");
        }
        if self.config.strict_consistency && !mismatches.is_empty() {
            return Err(IndexError::ConsistencyViolation(format!(
                "state filter of {} differs from the DAG in {} records",
                csid,
                mismatches.len()
            )));
        }
        Ok(mismatches)
    }

    /// Run an eviction pass now
    pub fn evict_filters(&self) -> IndexResult<EvictionReport> {
        let policy = EvictionPolicy::from_config(&self.config);
        Ok(evict(&self.paths, &policy, self.config.filter_wait_timeout())?)
    }

    /// Delete the index: main database and every state filter
    pub fn remove(self) -> IndexResult<()> {
        let main = self.store.path().to_path_buf();
        let dag = self.dag.dag_id().to_string();
        self.store.close()?;

        for suffix in ["", "-wal", "-shm"] {
            let path = PathBuf::from(format!("{}{}", main.display(), suffix));
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::io(path, e).into()),
            }
        }
        match fs::remove_dir_all(self.paths.dir()) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io(self.paths.dir(), e).into()),
        }

        info!(dag = %dag, root = %self.root.display(), "removed record index");
        Ok(())
    }

    /// Compile against the schema of the snapshot (or the current schema)
    /// and execute on a connection with the snapshot attached
    fn execute<R>(
        &self,
        as_of: Option<&str>,
        compile: impl FnOnce(&QueryCompiler<'_>) -> CompileResult<QueryPlan>,
        run: impl FnOnce(&QueryExecutor<'_>, &QueryPlan) -> IndexResult<R>,
    ) -> IndexResult<R> {
        match as_of {
            None => {
                let compiler = QueryCompiler::new(&self.schema, self.config.inline_in_list_max);
                let plan = compile(&compiler)?;
                run(&QueryExecutor::new(self.store.conn()), &plan)
            }
            Some(csid) => {
                let filter = self.state_filter(csid)?;
                let compiler = QueryCompiler::new(&filter.schema, self.config.inline_in_list_max);
                let plan = compile(&compiler)?;
                let attached = self.store.attach_filter(&filter.path)?;
                run(&QueryExecutor::new(attached.conn()), &plan)
            }
        }
    }
}

fn known_templates(conn: &Connection) -> IndexResult<Vec<String>> {
    let mut stmt = conn.prepare("SELECT template_id FROM templates ORDER BY template_id")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    Ok(rows.collect::<Result<_, _>>()?)
}
