//! Connection to the main database and read-only filter attachment

use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::Connection;
use tracing::{debug, warn};

use super::ddl;
use super::errors::{StoreError, StoreResult};
use super::functions;
use super::naming::FILTER_SCHEMA;
use super::retry::{with_busy_retry, RetryPolicy};

/// Open a connection with the crate's functions registered.
///
/// Used for the main database and for filter build connections.
pub fn open_connection(path: &Path, retry: &RetryPolicy) -> StoreResult<Connection> {
    let conn = with_busy_retry(retry, "open", || Connection::open(path))?;
    conn.busy_timeout(retry.interval)?;
    functions::register(&conn)?;
    Ok(conn)
}

/// `file:` URI opening `path` read-only
pub fn read_only_uri(path: &Path) -> String {
    let raw = path.to_string_lossy();
    let mut uri = String::with_capacity(raw.len() + 16);
    uri.push_str("file:");
    for ch in raw.chars() {
        match ch {
            '%' => uri.push_str("%25"),
            '?' => uri.push_str("%3f"),
            '#' => uri.push_str("%23"),
            other => uri.push(other),
        }
    }
    uri.push_str("?mode=ro");
    uri
}

/// The main index database of one DAG
pub struct Store {
    conn: Connection,
    path: PathBuf,
    retry: RetryPolicy,
}

impl Store {
    /// Open or create the main database and its log tables
    pub fn open(path: &Path, retry: RetryPolicy) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }

        let conn = open_connection(path, &retry)?;
        let mode: String = with_busy_retry(&retry, "journal mode", || {
            conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
        })?;
        with_busy_retry(&retry, "create log tables", || {
            ddl::create_log_tables(&conn)
        })?;

        debug!(path = %path.display(), journal = %mode, "opened index store");
        Ok(Self {
            conn,
            path: path.to_path_buf(),
            retry,
        })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Attach a state filter read-only under the filter schema name.
    ///
    /// The filter stays attached until the returned guard is dropped.
    pub fn attach_filter(&self, filter: &Path) -> StoreResult<AttachedFilter<'_>> {
        let uri = read_only_uri(filter);
        let sql = format!("ATTACH DATABASE ?1 AS {}", FILTER_SCHEMA);
        with_busy_retry(&self.retry, "attach filter", || {
            self.conn.execute(&sql, [&uri])
        })?;
        Ok(AttachedFilter { conn: &self.conn })
    }

    /// Close the connection, reporting any error
    pub fn close(self) -> StoreResult<()> {
        self.conn.close().map_err(|(_, e)| StoreError::Sqlite(e))
    }
}

/// Detaches the filter schema on drop
pub struct AttachedFilter<'a> {
    conn: &'a Connection,
}

impl AttachedFilter<'_> {
    pub fn conn(&self) -> &Connection {
        self.conn
    }
}

impl Drop for AttachedFilter<'_> {
    fn drop(&mut self) {
        let sql = format!("DETACH DATABASE {}", FILTER_SCHEMA);
        if let Err(e) = self.conn.execute(&sql, []) {
            warn!(error = %e, "failed to detach state filter");
        }
    }
}
