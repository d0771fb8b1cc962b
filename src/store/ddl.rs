//! Table, index and ordering-table definitions
//!
//! The same record-table layout is used by the main database and by every
//! state filter, so functions here take the schema name to act on.

use std::collections::BTreeSet;

use rusqlite::{params, Connection};
use tracing::debug;

use super::naming::{
    field_column, fulltext_table, index_name, ordering_table, qualified, quote_ident,
    record_table, HIDREC_COLUMN, ROWID_COLUMN,
};
use super::values::to_sql_value;
use crate::schema::{CompositeSchema, RecordType, RECID_FIELD};

const LOG_TABLES: &str = "
    CREATE TABLE IF NOT EXISTS csets (
        csid TEXT PRIMARY KEY,
        generation INTEGER NOT NULL,
        template_id TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS templates (
        template_id TEXT PRIMARY KEY
    );
    CREATE TABLE IF NOT EXISTS hist (
        hidrec TEXT NOT NULL,
        csid TEXT NOT NULL,
        PRIMARY KEY (hidrec, csid)
    );
    CREATE TABLE IF NOT EXISTS delta_add (
        csid TEXT NOT NULL,
        parent TEXT NOT NULL,
        hidrec TEXT NOT NULL,
        PRIMARY KEY (csid, parent, hidrec)
    );
    CREATE TABLE IF NOT EXISTS delta_remove (
        csid TEXT NOT NULL,
        parent TEXT NOT NULL,
        hidrec TEXT NOT NULL,
        PRIMARY KEY (csid, parent, hidrec)
    );
    CREATE TABLE IF NOT EXISTS audits (
        csid TEXT NOT NULL,
        userid TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        PRIMARY KEY (csid, userid, timestamp)
    );
    CREATE TABLE IF NOT EXISTS users (
        userid TEXT PRIMARY KEY,
        name TEXT NOT NULL
    );
";

const LOG_INDEXES: &str = "
    CREATE INDEX IF NOT EXISTS ix_hist__csid ON hist(csid);
    CREATE INDEX IF NOT EXISTS ix_csets__generation ON csets(generation);
    CREATE INDEX IF NOT EXISTS ix_delta_add__hidrec ON delta_add(hidrec);
    CREATE INDEX IF NOT EXISTS ix_delta_remove__hidrec ON delta_remove(hidrec);
";

/// Changeset, history, delta, audit and identity tables of the main database
pub fn create_log_tables(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(LOG_TABLES)
}

pub fn create_log_indexes(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(LOG_INDEXES)
}

/// Column names of `db.table`; empty if the table does not exist
pub fn table_columns(conn: &Connection, db: &str, table: &str) -> rusqlite::Result<Vec<String>> {
    let sql = format!("PRAGMA {}.table_info({})", quote_ident(db), quote_ident(table));
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    rows.collect()
}

/// Create missing record and full-text tables and add missing columns.
///
/// Full-text tables cannot gain columns, so one whose column set changed is
/// dropped and repopulated from its record table.
pub fn sync_record_tables(
    conn: &Connection,
    db: &str,
    schema: &CompositeSchema,
) -> rusqlite::Result<()> {
    for rectype in schema.rectypes.values() {
        sync_record_table(conn, db, rectype)?;
        sync_fulltext_table(conn, db, rectype)?;
    }
    Ok(())
}

fn sync_record_table(conn: &Connection, db: &str, rectype: &RecordType) -> rusqlite::Result<()> {
    let table = record_table(&rectype.name);
    let existing: BTreeSet<String> = table_columns(conn, db, &table)?.into_iter().collect();

    if existing.is_empty() {
        let mut columns = vec![
            format!("{} INTEGER PRIMARY KEY", quote_ident(ROWID_COLUMN)),
            format!("{} TEXT NOT NULL UNIQUE", quote_ident(HIDREC_COLUMN)),
        ];
        for (name, spec) in &rectype.fields {
            columns.push(format!(
                "{} {}",
                quote_ident(&field_column(name)),
                spec.field_type.sql_affinity()
            ));
        }
        let sql = format!(
            "CREATE TABLE {} ({})",
            qualified(db, &table),
            columns.join(", ")
        );
        conn.execute_batch(&sql)?;
        debug!(db, table = %table, "created record table");
        return Ok(());
    }

    for (name, spec) in &rectype.fields {
        let column = field_column(name);
        if existing.contains(&column) {
            continue;
        }
        let sql = format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            qualified(db, &table),
            quote_ident(&column),
            spec.field_type.sql_affinity()
        );
        conn.execute_batch(&sql)?;
        debug!(db, table = %table, column = %column, "added column");
    }
    Ok(())
}

fn sync_fulltext_table(conn: &Connection, db: &str, rectype: &RecordType) -> rusqlite::Result<()> {
    let table = fulltext_table(&rectype.name);
    let wanted: Vec<String> = rectype
        .full_text_fields()
        .into_iter()
        .map(field_column)
        .collect();
    let existing = table_columns(conn, db, &table)?;

    if existing == wanted {
        return Ok(());
    }
    if !existing.is_empty() {
        conn.execute_batch(&format!("DROP TABLE {}", qualified(db, &table)))?;
    }
    if wanted.is_empty() {
        return Ok(());
    }

    // Column names are validated identifiers with an f_ prefix.
    let sql = format!(
        "CREATE VIRTUAL TABLE {} USING fts4({})",
        qualified(db, &table),
        wanted.join(", ")
    );
    conn.execute_batch(&sql)?;

    let columns = wanted
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let repopulate = format!(
        "INSERT INTO {fts} (docid, {columns}) SELECT {rowid}, {columns} FROM {rec}",
        fts = qualified(db, &table),
        rec = qualified(db, &record_table(&rectype.name)),
        rowid = quote_ident(ROWID_COLUMN),
        columns = columns,
    );
    let rows = conn.execute(&repopulate, [])?;
    debug!(db, table = %table, rows, "rebuilt full-text table");
    Ok(())
}

/// Indexes on indexed, unique and recid fields of every record table
pub fn create_record_indexes(
    conn: &Connection,
    db: &str,
    schema: &CompositeSchema,
) -> rusqlite::Result<()> {
    for rectype in schema.rectypes.values() {
        let table = record_table(&rectype.name);
        for (name, spec) in &rectype.fields {
            if !(spec.indexed || spec.unique || name == RECID_FIELD || spec.ref_target.is_some()) {
                continue;
            }
            let column = field_column(name);
            let sql = format!(
                "CREATE INDEX IF NOT EXISTS {} ON {}({})",
                qualified(db, &index_name(&table, &column)),
                quote_ident(&table),
                quote_ident(&column)
            );
            conn.execute_batch(&sql)?;
        }
    }
    Ok(())
}

/// Rewrite every ordering table from the schema.
///
/// The rank of a value is its position in the ordering's value list.
pub fn sync_ordering_tables(conn: &Connection, schema: &CompositeSchema) -> rusqlite::Result<()> {
    for rectype in schema.rectypes.values() {
        for (name, spec) in &rectype.fields {
            for ordering in &spec.orderings {
                let table = qualified(
                    "main",
                    &ordering_table(&rectype.name, name, &ordering.name),
                );
                conn.execute_batch(&format!(
                    "CREATE TABLE IF NOT EXISTS {table} (value PRIMARY KEY, rank INTEGER NOT NULL);
                     DELETE FROM {table};",
                    table = table
                ))?;

                let mut insert =
                    conn.prepare(&format!("INSERT OR IGNORE INTO {} (value, rank) VALUES (?1, ?2)", table))?;
                for (rank, value) in ordering.values.iter().enumerate() {
                    let Ok(stored) = to_sql_value(spec.field_type, value) else {
                        continue;
                    };
                    insert.execute(params![stored, rank as i64])?;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::DagKind;
    use crate::schema::FieldSpec;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn schema_with(fields: &[(&str, FieldSpec)]) -> CompositeSchema {
        let mut item = RecordType::new("item");
        for (name, spec) in fields {
            item.fields.insert(name.to_string(), spec.clone());
        }
        let mut rectypes = BTreeMap::new();
        rectypes.insert("item".to_string(), item);
        CompositeSchema {
            kind: DagKind::with_recid(),
            templates: vec!["t".into()],
            rectypes,
        }
    }

    #[test]
    fn test_schema_evolution_adds_columns() {
        let conn = Connection::open_in_memory().unwrap();
        let v1 = schema_with(&[("name", FieldSpec::string())]);
        sync_record_tables(&conn, "main", &v1).unwrap();

        let v2 = schema_with(&[("name", FieldSpec::string()), ("size", FieldSpec::int())]);
        sync_record_tables(&conn, "main", &v2).unwrap();

        let columns = table_columns(&conn, "main", "rec_item").unwrap();
        assert_eq!(columns, vec!["_rowid", "_hidrec", "f_name", "f_size"]);
    }

    #[test]
    fn test_fulltext_table_rebuilt_on_column_change() {
        let conn = Connection::open_in_memory().unwrap();
        let v1 = schema_with(&[("title", FieldSpec::string().full_text()), ("body", FieldSpec::string())]);
        sync_record_tables(&conn, "main", &v1).unwrap();
        conn.execute(
            "INSERT INTO rec_item (_hidrec, f_title, f_body) VALUES ('h1', 'red fox', 'lazy dog')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO fts_item (docid, f_title) SELECT _rowid, f_title FROM rec_item",
            [],
        )
        .unwrap();

        let v2 = schema_with(&[
            ("title", FieldSpec::string().full_text()),
            ("body", FieldSpec::string().full_text()),
        ]);
        sync_record_tables(&conn, "main", &v2).unwrap();

        let hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM fts_item WHERE fts_item MATCH 'dog'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(hits, 1);
    }

    #[test]
    fn test_ordering_ranks_follow_value_position() {
        let conn = Connection::open_in_memory().unwrap();
        let schema = schema_with(&[(
            "priority",
            FieldSpec::int().with_ordering("rank", vec![json!(5), json!(1), json!(3)]),
        )]);
        sync_ordering_tables(&conn, &schema).unwrap();

        let rank: i64 = conn
            .query_row(
                "SELECT rank FROM ord_item__priority__rank WHERE value = 3",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(rank, 2);
    }
}
