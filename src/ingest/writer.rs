//! Ingestion session
//!
//! # API
//!
//! - `begin(conn, schema, blobs, retry)` - open a write transaction
//! - `ingest(changeset)` - index one changeset
//! - `end()` - build indexes and commit
//! - `abort()` - discard everything since `begin`
//!
//! Dropping a session without `end` rolls it back.

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Transaction, TransactionBehavior};
use tracing::{debug, info, warn};

use crate::dag::{BlobStore, ChangesetData, Hidrec, StoredRecord};
use crate::error::{IndexError, IndexResult};
use crate::schema::{CompositeSchema, RecordType, SchemaError, RECID_FIELD};
use crate::store::naming::{
    field_column, fulltext_table, qualified, quote_ident, record_table, HIDREC_COLUMN, MAIN_SCHEMA,
};
use crate::store::values::to_sql_value;
use crate::store::{ddl, with_busy_retry, RetryPolicy};

/// Counters for one session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    /// Changesets indexed by this session
    pub changesets: usize,
    /// Changesets skipped because they were already indexed
    pub skipped: usize,
    /// Record versions inserted into record tables
    pub records: usize,
    /// History entries written
    pub history: usize,
    /// Delta log rows written
    pub delta_rows: usize,
}

/// Result of ingesting one changeset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Indexed { new_records: usize },
    AlreadyIndexed,
}

/// An open ingestion transaction over the main database
pub struct IngestSession<'a, B: BlobStore> {
    tx: Transaction<'a>,
    schema: &'a CompositeSchema,
    blobs: &'a B,
    stats: IngestStats,
}

impl<'a, B: BlobStore> IngestSession<'a, B> {
    /// Start a write transaction and bring record tables up to `schema`.
    ///
    /// Taking the write lock is retried while the store is busy.
    pub fn begin(
        conn: &'a Connection,
        schema: &'a CompositeSchema,
        blobs: &'a B,
        retry: RetryPolicy,
    ) -> IndexResult<Self> {
        let tx = with_busy_retry(&retry, "begin ingestion", move || {
            Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
        })?;
        ddl::sync_record_tables(&tx, MAIN_SCHEMA, schema)?;

        Ok(Self {
            tx,
            schema,
            blobs,
            stats: IngestStats::default(),
        })
    }

    pub fn stats(&self) -> IngestStats {
        self.stats
    }

    /// Index one changeset.
    ///
    /// Parents must already be indexed. A changeset that is already indexed
    /// is skipped without touching any table.
    pub fn ingest(&mut self, cs: &ChangesetData) -> IndexResult<IngestOutcome> {
        let inserted = self.tx.execute(
            "INSERT OR IGNORE INTO csets (csid, generation, template_id) VALUES (?1, ?2, ?3)",
            params![cs.csid, cs.generation as i64, cs.template_id],
        )?;
        if inserted == 0 {
            debug!(csid = %cs.csid, "changeset already indexed");
            self.stats.skipped += 1;
            return Ok(IngestOutcome::AlreadyIndexed);
        }

        self.tx.execute(
            "INSERT OR IGNORE INTO templates (template_id) VALUES (?1)",
            [&cs.template_id],
        )?;

        self.check_parents(cs)?;
        self.write_deltas(cs)?;

        let new_records = cs.new_records();
        for hidrec in &new_records {
            self.index_record(&cs.csid, hidrec)?;
        }

        let mut audit = self.tx.prepare_cached(
            "INSERT OR IGNORE INTO audits (csid, userid, timestamp) VALUES (?1, ?2, ?3)",
        )?;
        for entry in &cs.audits {
            audit.execute(params![cs.csid, entry.userid, entry.timestamp])?;
        }
        drop(audit);

        self.stats.changesets += 1;
        debug!(
            csid = %cs.csid,
            generation = cs.generation,
            new_records = new_records.len(),
            "ingested changeset"
        );
        Ok(IngestOutcome::Indexed {
            new_records: new_records.len(),
        })
    }

    /// Build indexes and ordering tables, then commit
    pub fn end(self) -> IndexResult<IngestStats> {
        ddl::create_record_indexes(&self.tx, MAIN_SCHEMA, self.schema)?;
        ddl::create_log_indexes(&self.tx)?;
        ddl::sync_ordering_tables(&self.tx, self.schema)?;
        self.tx.commit()?;

        info!(
            changesets = self.stats.changesets,
            skipped = self.stats.skipped,
            records = self.stats.records,
            "ingestion committed"
        );
        Ok(self.stats)
    }

    /// Discard all work of this session
    pub fn abort(self) -> IndexResult<()> {
        self.tx.rollback()?;
        warn!(changesets = self.stats.changesets, "ingestion aborted");
        Ok(())
    }

    fn check_parents(&self, cs: &ChangesetData) -> IndexResult<()> {
        for parent in cs.parents() {
            let generation: Option<i64> = self
                .tx
                .query_row(
                    "SELECT generation FROM csets WHERE csid = ?1",
                    [parent],
                    |row| row.get(0),
                )
                .optional()?;
            match generation {
                None => {
                    return Err(IndexError::ConsistencyViolation(format!(
                        "changeset {} has unindexed parent {}",
                        cs.csid, parent
                    )))
                }
                Some(g) if g as u64 >= cs.generation => {
                    return Err(IndexError::ConsistencyViolation(format!(
                        "changeset {} at generation {} is not above parent {} at {}",
                        cs.csid, cs.generation, parent, g
                    )))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    fn write_deltas(&mut self, cs: &ChangesetData) -> IndexResult<()> {
        let mut add = self.tx.prepare_cached(
            "INSERT OR IGNORE INTO delta_add (csid, parent, hidrec) VALUES (?1, ?2, ?3)",
        )?;
        let mut remove = self.tx.prepare_cached(
            "INSERT OR IGNORE INTO delta_remove (csid, parent, hidrec) VALUES (?1, ?2, ?3)",
        )?;
        let mut known = self
            .tx
            .prepare_cached("SELECT EXISTS (SELECT 1 FROM hist WHERE hidrec = ?1)")?;

        for entry in &cs.deltas {
            let parent = entry.parent.as_deref().unwrap_or("");
            for hidrec in &entry.delta.add {
                self.stats.delta_rows += add.execute(params![cs.csid, parent, hidrec])?;
            }
            for hidrec in &entry.delta.remove {
                let indexed: bool = known.query_row([hidrec], |row| row.get(0))?;
                if !indexed {
                    return Err(IndexError::ConsistencyViolation(format!(
                        "changeset {} removes record {} that was never indexed",
                        cs.csid, hidrec
                    )));
                }
                self.stats.delta_rows += remove.execute(params![cs.csid, parent, hidrec])?;
            }
        }
        Ok(())
    }

    fn index_record(&mut self, csid: &str, hidrec: &Hidrec) -> IndexResult<()> {
        let indexed: bool = self.tx.query_row(
            "SELECT EXISTS (SELECT 1 FROM hist WHERE hidrec = ?1)",
            [hidrec],
            |row| row.get(0),
        )?;

        if !indexed {
            let record = self.blobs.fetch(hidrec)?;
            let rectype = self
                .schema
                .rectype(&record.rectype)
                .ok_or_else(|| SchemaError::unknown_rectype(&record.rectype))?;
            self.insert_record(rectype, hidrec, &record)?;
        }

        self.stats.history += self.tx.execute(
            "INSERT OR IGNORE INTO hist (hidrec, csid) VALUES (?1, ?2)",
            params![hidrec, csid],
        )?;
        Ok(())
    }

    fn insert_record(
        &mut self,
        rectype: &RecordType,
        hidrec: &str,
        record: &StoredRecord,
    ) -> IndexResult<()> {
        let mut columns = vec![quote_ident(HIDREC_COLUMN)];
        let mut values = vec![SqlValue::Text(hidrec.to_string())];

        for (name, spec) in &rectype.fields {
            let raw = if name == RECID_FIELD {
                match &record.recid {
                    Some(recid) => serde_json::Value::String(recid.clone()),
                    None => continue,
                }
            } else {
                match record.fields.get(name) {
                    Some(value) => value.clone(),
                    None => continue,
                }
            };

            let stored = to_sql_value(spec.field_type, &raw).unwrap_or_else(|reason| {
                warn!(
                    rectype = %rectype.name,
                    field = %name,
                    %reason,
                    "storing unconvertible value as text"
                );
                match &raw {
                    serde_json::Value::String(text) => SqlValue::Text(text.clone()),
                    other => SqlValue::Text(other.to_string()),
                }
            });
            columns.push(quote_ident(&field_column(name)));
            values.push(stored);
        }

        let placeholders = (1..=values.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT OR IGNORE INTO {} ({}) VALUES ({})",
            qualified(MAIN_SCHEMA, &record_table(&rectype.name)),
            columns.join(", "),
            placeholders
        );
        if self.tx.execute(&sql, params_from_iter(values.iter()))? == 0 {
            return Ok(());
        }
        let rowid = self.tx.last_insert_rowid();
        self.stats.records += 1;

        let full_text = rectype.full_text_fields();
        if full_text.is_empty() {
            return Ok(());
        }

        let mut fts_columns = vec!["docid".to_string()];
        let mut fts_values = vec![SqlValue::Integer(rowid)];
        for name in full_text {
            if let Some(serde_json::Value::String(text)) = record.fields.get(name) {
                fts_columns.push(quote_ident(&field_column(name)));
                fts_values.push(SqlValue::Text(text.clone()));
            }
        }
        let placeholders = (1..=fts_values.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            qualified(MAIN_SCHEMA, &fulltext_table(&rectype.name)),
            fts_columns.join(", "),
            placeholders
        );
        self.tx.execute(&sql, params_from_iter(fts_values.iter()))?;
        Ok(())
    }
}
