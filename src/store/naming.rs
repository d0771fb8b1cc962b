//! Table and column naming
//!
//! Every identifier that reaches SQL text is produced here and quoted with
//! [`quote_ident`]. Values never reach SQL text; they are bound parameters.

/// Row id of a record version; shared between a record table and its filters
pub const ROWID_COLUMN: &str = "_rowid";

/// Content hash of a record version
pub const HIDREC_COLUMN: &str = "_hidrec";

/// Schema name of the main database
pub const MAIN_SCHEMA: &str = "main";

/// Schema name a state filter is attached under
pub const FILTER_SCHEMA: &str = "sf";

/// Schema name of the main database when attached to a filter build
pub const SOURCE_SCHEMA: &str = "src";

pub fn record_table(rectype: &str) -> String {
    format!("rec_{}", rectype)
}

pub fn fulltext_table(rectype: &str) -> String {
    format!("fts_{}", rectype)
}

pub fn field_column(field: &str) -> String {
    format!("f_{}", field)
}

pub fn ordering_table(rectype: &str, field: &str, ordering: &str) -> String {
    format!("ord_{}__{}__{}", rectype, field, ordering)
}

pub fn index_name(table: &str, column: &str) -> String {
    format!("ix_{}__{}", table, column)
}

/// Double-quote an identifier, doubling embedded quotes
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `"schema"."table"`
pub fn qualified(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}
