//! dagindex - versioned record index for DAG-versioned record stores
//!
//! Every committed state of the store is a changeset in a directed acyclic
//! graph. This crate keeps a relational secondary index over the records those
//! changesets carry and answers queries against it, either over every indexed
//! version or "as of" one changeset through a materialized state filter.
//!
//! # Subsystems
//!
//! - `schema`: merges template field definitions into one composite schema
//! - `ingest`: consumes changesets in generation order into the main database
//! - `query`: compiles criteria, sort and projection into a typed plan
//! - `filter`: materializes per-changeset snapshots of live records
//! - `assemble`: regroups physical rows into logical records
//! - `engine`: the caller-facing `RecordIndex`

pub mod assemble;
pub mod config;
pub mod dag;
pub mod engine;
pub mod error;
pub mod filter;
pub mod ingest;
pub mod query;
pub mod schema;
pub mod store;

pub use config::IndexConfig;
pub use engine::RecordIndex;
pub use error::{IndexError, IndexResult};
