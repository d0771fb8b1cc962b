//! Result Assembler
//!
//! Reconstructs logical records from the physical rows of a compiled query:
//! scalar fields, nested sub-collections and the audit history.

mod assembler;
mod record;

pub use assembler::Assembler;
pub use record::{HistoryEntry, Record};
