//! State-Filter Materializer
//!
//! A state filter is a small database holding exactly the records live in
//! one changeset, plus the schema it was built under. Filters are immutable
//! once published and are shared by any number of readers.
//!
//! Guarantees:
//! - at most one party builds a given filter (create-new lock file)
//! - a partially built filter is never visible (build, then rename)
//! - the records of a filter equal the DAG's live set, whichever base it
//!   was built from

mod builder;
mod errors;
mod evict;
mod lock;
mod materializer;
mod paths;
mod verify;

pub use builder::{read_meta, BaseKind, FilterBuilder, FilterMeta};
pub use errors::{MaterializeError, MaterializeResult};
pub use evict::{evict, EvictionPolicy, EvictionReport};
pub use lock::BuildLock;
pub use materializer::{indexed_generation, FilterOutcome, Materializer, StateFilter};
pub use paths::{parse_filter_name, FilterEntry, FilterPaths, FILTERS_DIR};
pub use verify::{compare, stored_hidrecs, FilterMismatch};
