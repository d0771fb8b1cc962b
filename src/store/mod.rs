//! Backing relational store
//!
//! SQLite holds the main index database of a DAG and every state filter.
//! This module owns connection setup, busy retry, table layout and naming;
//! nothing outside it formats identifiers.

mod connection;
mod errors;
mod retry;

pub mod ddl;
pub mod functions;
pub mod naming;
pub mod values;

pub use connection::{open_connection, read_only_uri, AttachedFilter, Store};
pub use errors::{StoreError, StoreResult};
pub use retry::{is_busy, with_busy_retry, RetryPolicy};
