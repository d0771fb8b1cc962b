//! State-filter materializer
//!
//! Per changeset a filter is Missing, Building (its lock exists) or
//! Available (its file exists). `ensure` moves it to Available:
//!
//! - Available: touch the file and return its embedded schema
//! - Missing: take the lock and build
//! - Building: poll until the file appears, the lock can be taken over, or
//!   the wait deadline passes

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, warn};

use super::builder::{read_meta, BaseKind, FilterBuilder};
use super::errors::{MaterializeError, MaterializeResult};
use super::evict::{evict, EvictionPolicy};
use super::lock::BuildLock;
use super::paths::{touch, FilterPaths};
use crate::config::IndexConfig;
use crate::dag::ChangesetSource;
use crate::schema::CompositeSchema;
use crate::store::RetryPolicy;

/// How `ensure` obtained the filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOutcome {
    /// It already existed, or another party built it
    Attached,
    /// This call built it from the given base
    Built(BaseKind),
}

/// An available state filter
#[derive(Debug, Clone)]
pub struct StateFilter {
    pub csid: String,
    pub generation: u64,
    pub path: PathBuf,
    /// Schema the filter was built under; queries compile against it
    pub schema: Arc<CompositeSchema>,
    pub outcome: FilterOutcome,
}

/// Produces state filters for one index
pub struct Materializer<'a, D: ChangesetSource> {
    dag: &'a D,
    main_path: &'a Path,
    paths: &'a FilterPaths,
    config: &'a IndexConfig,
}

impl<'a, D: ChangesetSource> Materializer<'a, D> {
    pub fn new(
        dag: &'a D,
        main_path: &'a Path,
        paths: &'a FilterPaths,
        config: &'a IndexConfig,
    ) -> Self {
        Self {
            dag,
            main_path,
            paths,
            config,
        }
    }

    /// Make the filter of `csid` available, building it if needed.
    ///
    /// `conn` is a connection to the main database; `schema` is the current
    /// composite schema, used when this call builds.
    pub fn ensure(
        &self,
        conn: &Connection,
        csid: &str,
        schema: &CompositeSchema,
    ) -> MaterializeResult<StateFilter> {
        let generation = indexed_generation(conn, csid)?;
        let path = self.paths.filter_path(generation, csid);
        if path.exists() {
            return attach(csid, generation, path);
        }
        self.paths.ensure_dir()?;

        let lock_path = self.paths.lock_path(csid);
        let started = Instant::now();
        let deadline = started + self.config.filter_wait_timeout();
        let mut contended = false;

        loop {
            if path.exists() {
                return attach(csid, generation, path);
            }

            if let Some(lock) = BuildLock::try_acquire(&lock_path)? {
                if contended {
                    warn!(csid, "previous builder vanished, taking over build lock");
                }
                // Finished between the existence check and the lock.
                if path.exists() {
                    lock.release()?;
                    return attach(csid, generation, path);
                }
                return self.build(lock, csid, generation, path, schema);
            }

            if !contended {
                debug!(csid, "state filter is being built elsewhere, waiting");
                contended = true;
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(MaterializeError::FilterBuildTimeout {
                    csid: csid.to_string(),
                    waited_ms: now.duration_since(started).as_millis() as u64,
                });
            }
            thread::sleep(
                self.config
                    .filter_poll_interval()
                    .min(deadline.saturating_duration_since(now)),
            );
        }
    }

    fn build(
        &self,
        lock: BuildLock,
        csid: &str,
        generation: u64,
        path: PathBuf,
        schema: &CompositeSchema,
    ) -> MaterializeResult<StateFilter> {
        let builder = FilterBuilder::new(
            self.dag,
            self.main_path,
            self.paths,
            schema,
            RetryPolicy::from_config(self.config),
            self.config.ancestor_search_depth,
        );
        let built = builder.build(csid, generation);
        if let Err(e) = lock.release() {
            warn!(csid, error = %e, "failed to release build lock");
        }
        let base = built?;

        if generation % self.config.evict_every_generations == 0 {
            self.evict();
        }

        Ok(StateFilter {
            csid: csid.to_string(),
            generation,
            path,
            schema: Arc::new(schema.clone()),
            outcome: FilterOutcome::Built(base),
        })
    }

    /// Opportunistic eviction; failures are logged, never returned
    pub fn evict(&self) {
        let policy = EvictionPolicy::from_config(self.config);
        if let Err(e) = evict(self.paths, &policy, self.config.filter_wait_timeout()) {
            warn!(error = %e, "filter eviction failed");
        }
    }
}

/// Generation of an ingested changeset
pub fn indexed_generation(conn: &Connection, csid: &str) -> MaterializeResult<u64> {
    let generation: Option<i64> = conn
        .query_row(
            "SELECT generation FROM main.csets WHERE csid = ?1",
            [csid],
            |row| row.get(0),
        )
        .optional()?;
    match generation {
        Some(g) => Ok(g.max(0) as u64),
        None => Err(MaterializeError::ChangesetNotIndexed(csid.to_string())),
    }
}

fn attach(csid: &str, generation: u64, path: PathBuf) -> MaterializeResult<StateFilter> {
    touch(&path);
    let meta = read_meta(&path)?;
    if meta.csid != csid {
        return Err(MaterializeError::corrupt(
            &path,
            format!("filter belongs to changeset {}", meta.csid),
        ));
    }
    debug!(csid, generation, "attached existing state filter");
    Ok(StateFilter {
        csid: csid.to_string(),
        generation,
        path,
        schema: Arc::new(meta.schema),
        outcome: FilterOutcome::Attached,
    })
}
