//! Filter consistency check
//!
//! Diagnostic only: compares the records physically present in a filter
//! with the live set the DAG reports for its changeset.

use std::collections::BTreeSet;

use rusqlite::Connection;
use serde::Serialize;

use crate::dag::Hidrec;
use crate::schema::CompositeSchema;
use crate::store::naming::{qualified, quote_ident, record_table, HIDREC_COLUMN};

/// One record on which a filter and the DAG disagree
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum FilterMismatch {
    /// Live in the changeset, absent from the filter
    Missing(Hidrec),
    /// Present in the filter, not live in the changeset
    Unexpected(Hidrec),
}

/// Content hashes stored in every record table of `db`
pub fn stored_hidrecs(
    conn: &Connection,
    db: &str,
    schema: &CompositeSchema,
) -> rusqlite::Result<BTreeSet<Hidrec>> {
    let mut all = BTreeSet::new();
    for name in schema.rectypes.keys() {
        let sql = format!(
            "SELECT {} FROM {}",
            quote_ident(HIDREC_COLUMN),
            qualified(db, &record_table(name))
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        for hidrec in rows {
            all.insert(hidrec?);
        }
    }
    Ok(all)
}

pub fn compare(expected: &BTreeSet<Hidrec>, actual: &BTreeSet<Hidrec>) -> Vec<FilterMismatch> {
    let missing = expected
        .difference(actual)
        .cloned()
        .map(FilterMismatch::Missing);
    let unexpected = actual
        .difference(expected)
        .cloned()
        .map(FilterMismatch::Unexpected);
    missing.chain(unexpected).collect()
}
