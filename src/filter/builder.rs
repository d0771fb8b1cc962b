//! Filter construction
//!
//! A filter is built in a temporary file and renamed into place. The base is
//! chosen by priority:
//!
//! 1. a filter of a direct parent, patched with the parent delta logged at
//!    ingestion
//! 2. the nearest ancestor with a filter, breadth-first up to a depth cap,
//!    patched with a delta from the DAG
//! 3. any filter of lower generation, most recently touched first, patched
//!    with a delta from the DAG
//! 4. nothing: the full live set is copied from the main database
//!
//! Only filters built under the current schema fingerprint are used as a
//! base. A base that cannot be read or copied is skipped.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Transaction};
use tracing::{debug, info, warn};

use super::errors::{MaterializeError, MaterializeResult};
use super::paths::{copy_with_fsync, fsync_dir, remove_quietly, FilterEntry, FilterPaths};
use crate::dag::{ChangesetSource, Delta, Hidrec};
use crate::schema::{CompositeSchema, RecordType};
use crate::store::ddl::{create_record_indexes, sync_record_tables};
use crate::store::naming::{
    field_column, fulltext_table, qualified, quote_ident, record_table, HIDREC_COLUMN,
    MAIN_SCHEMA, ROWID_COLUMN, SOURCE_SCHEMA,
};
use crate::store::{open_connection, read_only_uri, with_busy_retry, RetryPolicy, StoreError};

const META_TABLE: &str = "filter_meta";

/// Where a newly built filter started from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BaseKind {
    Parent,
    Ancestor,
    Any,
    Root,
}

impl BaseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BaseKind::Parent => "parent",
            BaseKind::Ancestor => "ancestor",
            BaseKind::Any => "any",
            BaseKind::Root => "root",
        }
    }
}

impl fmt::Display for BaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata embedded in every filter
#[derive(Debug, Clone, PartialEq)]
pub struct FilterMeta {
    pub csid: String,
    pub generation: u64,
    pub fingerprint: String,
    pub schema: CompositeSchema,
}

/// Read the embedded metadata of a finished filter
pub fn read_meta(path: &Path) -> MaterializeResult<FilterMeta> {
    let corrupt = |reason: String| MaterializeError::corrupt(path, reason);

    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|e| corrupt(e.to_string()))?;
    let mut values: HashMap<String, String> = HashMap::new();
    {
        let mut stmt = conn
            .prepare(&format!("SELECT key, value FROM {}", quote_ident(META_TABLE)))
            .map_err(|e| corrupt(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(|e| corrupt(e.to_string()))?;
        for row in rows {
            let (key, value) = row.map_err(|e| corrupt(e.to_string()))?;
            values.insert(key, value);
        }
    }

    let mut take = |key: &str| {
        values
            .remove(key)
            .ok_or_else(|| corrupt(format!("missing '{}'", key)))
    };
    let csid = take("csid")?;
    let generation = take("generation")?
        .parse()
        .map_err(|_| corrupt("bad generation".to_string()))?;
    let fingerprint = take("fingerprint")?;
    let schema = CompositeSchema::from_json(&take("schema")?)
        .map_err(|e| corrupt(e.to_string()))?;

    Ok(FilterMeta {
        csid,
        generation,
        fingerprint,
        schema,
    })
}

struct Candidate {
    entry: FilterEntry,
    kind: BaseKind,
}

/// How the delta to apply on top of the base is obtained
enum DeltaSource {
    /// Logged at ingestion against this parent
    Logged { parent: String },
    /// Computed by the DAG
    Computed(Delta),
}

/// Builds the filter of one changeset; the caller holds its lock
pub struct FilterBuilder<'a, D: ChangesetSource> {
    dag: &'a D,
    main_path: &'a Path,
    paths: &'a FilterPaths,
    schema: &'a CompositeSchema,
    retry: RetryPolicy,
    ancestor_depth: usize,
}

impl<'a, D: ChangesetSource> FilterBuilder<'a, D> {
    pub fn new(
        dag: &'a D,
        main_path: &'a Path,
        paths: &'a FilterPaths,
        schema: &'a CompositeSchema,
        retry: RetryPolicy,
        ancestor_depth: usize,
    ) -> Self {
        Self {
            dag,
            main_path,
            paths,
            schema,
            retry,
            ancestor_depth,
        }
    }

    /// Build and publish the filter of `csid`
    pub fn build(&self, csid: &str, generation: u64) -> MaterializeResult<BaseKind> {
        self.paths.ensure_dir()?;
        let fingerprint = self.schema.fingerprint()?;
        let target = self.paths.filter_path(generation, csid);

        for candidate in self.candidates(csid, generation)? {
            let tmp = self.paths.temp_path();
            match self.copy_base(&candidate, &fingerprint, &tmp) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!(
                        csid,
                        base = %candidate.entry.csid,
                        error = %e,
                        "base filter unusable, trying next"
                    );
                    remove_quietly(&tmp);
                    continue;
                }
            }

            let delta = match candidate.kind {
                BaseKind::Parent => DeltaSource::Logged {
                    parent: candidate.entry.csid.clone(),
                },
                _ => DeltaSource::Computed(self.dag.delta(&candidate.entry.csid, csid)?),
            };
            self.finish(&tmp, &target, csid, generation, &fingerprint, delta)?;
            info!(
                csid,
                generation,
                base = %candidate.kind,
                from = %candidate.entry.csid,
                "built state filter"
            );
            return Ok(candidate.kind);
        }

        let live = self.dag.delta_from_root(csid)?;
        let tmp = self.paths.temp_path();
        self.finish(
            &tmp,
            &target,
            csid,
            generation,
            &fingerprint,
            DeltaSource::Computed(Delta::from_root(live)),
        )?;
        info!(csid, generation, base = %BaseKind::Root, "built state filter");
        Ok(BaseKind::Root)
    }

    /// Bases in priority order; parents, then ancestors, then any other
    fn candidates(&self, csid: &str, generation: u64) -> MaterializeResult<Vec<Candidate>> {
        let mut existing: HashMap<String, FilterEntry> = self
            .paths
            .list()?
            .into_iter()
            .filter(|e| e.csid != csid && e.generation < generation)
            .map(|e| (e.csid.clone(), e))
            .collect();

        let mut out = Vec::new();
        let parents = self.dag.parents(csid)?;
        for parent in &parents {
            if let Some(entry) = existing.remove(parent) {
                out.push(Candidate {
                    entry,
                    kind: BaseKind::Parent,
                });
            }
        }

        let mut visited: HashSet<String> = parents.iter().cloned().collect();
        visited.insert(csid.to_string());
        let mut frontier: VecDeque<(String, usize)> =
            parents.into_iter().map(|p| (p, 1)).collect();
        while let Some((node, depth)) = frontier.pop_front() {
            if let Some(entry) = existing.remove(&node) {
                out.push(Candidate {
                    entry,
                    kind: BaseKind::Ancestor,
                });
            }
            if depth >= self.ancestor_depth {
                continue;
            }
            for parent in self.dag.parents(&node)? {
                if visited.insert(parent.clone()) {
                    frontier.push_back((parent, depth + 1));
                }
            }
        }

        let mut rest: Vec<FilterEntry> = existing.into_values().collect();
        rest.sort_by(|a, b| {
            b.modified
                .cmp(&a.modified)
                .then_with(|| b.generation.cmp(&a.generation))
        });
        out.extend(rest.into_iter().map(|entry| Candidate {
            entry,
            kind: BaseKind::Any,
        }));

        debug!(csid, candidates = out.len(), "filter base candidates");
        Ok(out)
    }

    /// Copy a compatible base to `tmp`; false if its schema differs
    fn copy_base(
        &self,
        candidate: &Candidate,
        fingerprint: &str,
        tmp: &Path,
    ) -> MaterializeResult<bool> {
        let meta = read_meta(&candidate.entry.path)?;
        if meta.fingerprint != fingerprint {
            debug!(base = %candidate.entry.csid, "base filter has another schema");
            return Ok(false);
        }
        copy_with_fsync(&candidate.entry.path, tmp)?;
        Ok(true)
    }

    /// Patch `tmp` and publish it; `tmp` never outlives a failure
    fn finish(
        &self,
        tmp: &Path,
        target: &Path,
        csid: &str,
        generation: u64,
        fingerprint: &str,
        delta: DeltaSource,
    ) -> MaterializeResult<()> {
        if let Err(e) = self.populate(tmp, csid, generation, fingerprint, &delta) {
            remove_quietly(tmp);
            return Err(e);
        }
        self.publish(tmp, target)
    }

    fn populate(
        &self,
        tmp: &Path,
        csid: &str,
        generation: u64,
        fingerprint: &str,
        delta: &DeltaSource,
    ) -> MaterializeResult<()> {
        let mut conn = open_connection(tmp, &self.retry)?;
        let _: String = conn.query_row("PRAGMA journal_mode=MEMORY", [], |row| row.get(0))?;
        conn.execute_batch("PRAGMA synchronous=OFF")?;

        let attach = format!("ATTACH DATABASE ?1 AS {}", quote_ident(SOURCE_SCHEMA));
        let uri = read_only_uri(self.main_path);
        with_busy_retry(&self.retry, "attach main", || conn.execute(&attach, [&uri]))?;

        {
            let tx = conn.transaction()?;
            self.apply(&tx, csid, generation, fingerprint, delta)?;
            tx.commit()?;
        }

        conn.execute_batch(&format!("DETACH DATABASE {}", quote_ident(SOURCE_SCHEMA)))?;
        conn.close().map_err(|(_, e)| StoreError::Sqlite(e))?;
        Ok(())
    }

    fn apply(
        &self,
        tx: &Transaction<'_>,
        csid: &str,
        generation: u64,
        fingerprint: &str,
        delta: &DeltaSource,
    ) -> MaterializeResult<()> {
        let indexed: Option<i64> = tx
            .query_row(
                &format!("SELECT generation FROM {} WHERE csid = ?1", qualified(SOURCE_SCHEMA, "csets")),
                [csid],
                |row| row.get(0),
            )
            .optional()?;
        if indexed.is_none() {
            return Err(MaterializeError::ChangesetNotIndexed(csid.to_string()));
        }

        sync_record_tables(tx, MAIN_SCHEMA, self.schema)?;
        tx.execute_batch(
            "CREATE TEMP TABLE delta_keys_add (hidrec TEXT PRIMARY KEY);
             CREATE TEMP TABLE delta_keys_remove (hidrec TEXT PRIMARY KEY);
             CREATE TEMP TABLE new_rows (id INTEGER PRIMARY KEY);",
        )?;
        load_delta(tx, csid, delta)?;

        let mut added = 0usize;
        let mut removed = 0usize;
        for rectype in self.schema.rectypes.values() {
            removed += remove_rows(tx, rectype)?;
            added += add_rows(tx, rectype)?;
        }

        let wanted: i64 =
            tx.query_row("SELECT COUNT(*) FROM temp.delta_keys_add", [], |row| row.get(0))?;
        let mut present: i64 = 0;
        for name in self.schema.rectypes.keys() {
            present += tx.query_row(
                &format!(
                    "SELECT COUNT(*) FROM {} WHERE {} IN (SELECT hidrec FROM temp.delta_keys_add)",
                    qualified(MAIN_SCHEMA, &record_table(name)),
                    quote_ident(HIDREC_COLUMN)
                ),
                [],
                |row| row.get::<_, i64>(0),
            )?;
        }
        if present < wanted {
            return Err(MaterializeError::MissingRecords {
                csid: csid.to_string(),
                count: (wanted - present) as usize,
            });
        }

        tx.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            qualified(MAIN_SCHEMA, META_TABLE)
        ))?;
        let schema_json = self.schema.to_json()?;
        let generation_text = generation.to_string();
        let mut meta = tx.prepare(&format!(
            "INSERT OR REPLACE INTO {} (key, value) VALUES (?1, ?2)",
            qualified(MAIN_SCHEMA, META_TABLE)
        ))?;
        for (key, value) in [
            ("csid", csid),
            ("generation", generation_text.as_str()),
            ("fingerprint", fingerprint),
            ("schema", schema_json.as_str()),
        ] {
            meta.execute(params![key, value])?;
        }
        drop(meta);

        create_record_indexes(tx, MAIN_SCHEMA, self.schema)?;
        tx.execute_batch(
            "DROP TABLE temp.delta_keys_add;
             DROP TABLE temp.delta_keys_remove;
             DROP TABLE temp.new_rows;",
        )?;

        debug!(csid, added, removed, "patched state filter");
        Ok(())
    }

    /// Rename into place unless someone else already did
    fn publish(&self, tmp: &Path, target: &Path) -> MaterializeResult<()> {
        if target.exists() {
            info!(path = %target.display(), "state filter already published");
            remove_quietly(tmp);
            return Ok(());
        }
        if let Err(e) = fs::rename(tmp, target) {
            remove_quietly(tmp);
            if target.exists() {
                info!(path = %target.display(), "state filter already published");
                return Ok(());
            }
            return Err(MaterializeError::io(PathBuf::from(target), e));
        }
        fsync_dir(self.paths.dir())
    }
}

fn load_delta(tx: &Transaction<'_>, csid: &str, delta: &DeltaSource) -> MaterializeResult<()> {
    match delta {
        DeltaSource::Logged { parent } => {
            for (table, log) in [("delta_keys_add", "delta_add"), ("delta_keys_remove", "delta_remove")] {
                tx.execute(
                    &format!(
                        "INSERT OR IGNORE INTO temp.{} (hidrec) SELECT hidrec FROM {} WHERE csid = ?1 AND parent = ?2",
                        table,
                        qualified(SOURCE_SCHEMA, log)
                    ),
                    params![csid, parent],
                )?;
            }
        }
        DeltaSource::Computed(delta) => {
            insert_keys(tx, "delta_keys_add", &delta.add)?;
            insert_keys(tx, "delta_keys_remove", &delta.remove)?;
        }
    }
    Ok(())
}

fn insert_keys(tx: &Transaction<'_>, table: &str, keys: &BTreeSet<Hidrec>) -> rusqlite::Result<()> {
    let mut stmt = tx.prepare(&format!(
        "INSERT OR IGNORE INTO temp.{} (hidrec) VALUES (?1)",
        table
    ))?;
    for key in keys {
        stmt.execute([key])?;
    }
    Ok(())
}

fn remove_rows(tx: &Transaction<'_>, rectype: &RecordType) -> rusqlite::Result<usize> {
    let rec = qualified(MAIN_SCHEMA, &record_table(&rectype.name));
    let removed_keys = format!(
        "{} IN (SELECT hidrec FROM temp.delta_keys_remove)",
        quote_ident(HIDREC_COLUMN)
    );
    if !rectype.full_text_fields().is_empty() {
        tx.execute(
            &format!(
                "DELETE FROM {} WHERE docid IN (SELECT {} FROM {} WHERE {})",
                qualified(MAIN_SCHEMA, &fulltext_table(&rectype.name)),
                quote_ident(ROWID_COLUMN),
                rec,
                removed_keys
            ),
            [],
        )?;
    }
    tx.execute(&format!("DELETE FROM {} WHERE {}", rec, removed_keys), [])
}

/// Copy added records, and their full-text rows, from the main database
fn add_rows(tx: &Transaction<'_>, rectype: &RecordType) -> rusqlite::Result<usize> {
    let rec = record_table(&rectype.name);
    let rowid = quote_ident(ROWID_COLUMN);
    let hidrec = quote_ident(HIDREC_COLUMN);

    tx.execute("DELETE FROM temp.new_rows", [])?;
    tx.execute(
        &format!(
            "INSERT INTO temp.new_rows (id) SELECT {rowid} FROM {src} WHERE {hidrec} IN (SELECT hidrec FROM temp.delta_keys_add) AND {hidrec} NOT IN (SELECT {hidrec} FROM {dst})",
            rowid = rowid,
            hidrec = hidrec,
            src = qualified(SOURCE_SCHEMA, &rec),
            dst = qualified(MAIN_SCHEMA, &rec),
        ),
        [],
    )?;

    let mut columns = vec![rowid.clone(), hidrec];
    columns.extend(rectype.fields.keys().map(|f| quote_ident(&field_column(f))));
    let columns = columns.join(", ");
    let added = tx.execute(
        &format!(
            "INSERT INTO {dst} ({cols}) SELECT {cols} FROM {src} WHERE {rowid} IN (SELECT id FROM temp.new_rows)",
            dst = qualified(MAIN_SCHEMA, &rec),
            src = qualified(SOURCE_SCHEMA, &rec),
            cols = columns,
            rowid = rowid,
        ),
        [],
    )?;

    let fts_fields = rectype.full_text_fields();
    if !fts_fields.is_empty() {
        let fts = fulltext_table(&rectype.name);
        let fts_columns = fts_fields
            .into_iter()
            .map(|f| quote_ident(&field_column(f)))
            .collect::<Vec<_>>()
            .join(", ");
        tx.execute(
            &format!(
                "INSERT INTO {dst} (docid, {cols}) SELECT docid, {cols} FROM {src} WHERE docid IN (SELECT id FROM temp.new_rows)",
                dst = qualified(MAIN_SCHEMA, &fts),
                src = qualified(SOURCE_SCHEMA, &fts),
                cols = fts_columns,
            ),
            [],
        )?;
    }
    Ok(added)
}
