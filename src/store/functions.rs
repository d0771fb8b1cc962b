//! SQL functions registered on every connection

use rusqlite::functions::FunctionFlags;
use rusqlite::types::ValueRef;
use rusqlite::Connection;

use crate::query::rank_from_matchinfo;

/// `dagindex_rank(matchinfo(fts, 'pcx'))` -> relevance of one full-text hit
pub const RANK_FUNCTION: &str = "dagindex_rank";

pub fn register(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        RANK_FUNCTION,
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let blob = match ctx.get_raw(0) {
                ValueRef::Blob(blob) => blob,
                ValueRef::Null => return Ok(0.0),
                _ => {
                    return Err(rusqlite::Error::UserFunctionError(
                        "dagindex_rank expects a matchinfo blob".into(),
                    ))
                }
            };
            let info: Vec<u32> = blob
                .chunks_exact(4)
                .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            Ok(rank_from_matchinfo(&info))
        },
    )
}
