//! Index Writer
//!
//! Consumes changesets in generation order into the main database: record
//! versions into per-record-type tables and full-text indexes, plus the
//! append-only delta, history and audit logs that state filters are later
//! built from.
//!
//! Ingestion is idempotent per changeset and per content hash.

mod writer;

pub use writer::{IngestOutcome, IngestSession, IngestStats};
