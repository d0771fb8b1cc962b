//! Ingestion and index lifecycle
//!
//! Covers:
//! 1. Idempotent, order-independent ingestion
//! 2. Batches that fail leave nothing behind
//! 3. Schema growth across templates
//! 4. Reopening, configuration and removal

mod common;

use std::io::Write;
use std::sync::Arc;

use rusqlite::Connection;
use serde_json::json;
use tempfile::{NamedTempFile, TempDir};

use common::{item_template, names, open_index, test_config, MemoryRepo};
use dagindex::dag::DagKind;
use dagindex::engine::MAIN_DB_FILE;
use dagindex::query::{Query, SortSpec};
use dagindex::schema::{FieldSpec, SchemaErrorCode};
use dagindex::{IndexConfig, IndexError, RecordIndex};

fn count(dir: &TempDir, table: &str) -> i64 {
    let conn = Connection::open(dir.path().join(MAIN_DB_FILE)).unwrap();
    conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
        .unwrap()
}

/// Three changesets on a line: c0 adds a and b, c1 edits a, c2 adds c
fn line(repo: &mut MemoryRepo) -> (String, String, String) {
    let a = repo.put("item", Some("a"), json!({"name": "a0"}));
    let b = repo.put("item", Some("b"), json!({"name": "b0"}));
    let c0 = repo.commit(&[], "t1", &[a.clone(), b], &[]);
    let a1 = repo.put("item", Some("a"), json!({"name": "a1"}));
    let c1 = repo.commit(&[&c0], "t1", &[a1], &[a]);
    let c = repo.put("item", Some("c"), json!({"name": "c0"}));
    let c2 = repo.commit(&[&c1], "t1", &[c], &[]);
    (c0, c1, c2)
}

// =============================================================================
// IDEMPOTENCE
// =============================================================================

/// Test: Re-ingesting indexed changesets changes nothing.
#[test]
fn test_reingestion_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    let mut repo = MemoryRepo::new(DagKind::with_recid());
    item_template(&mut repo);
    let (c0, c1, c2) = line(&mut repo);
    let repo = Arc::new(repo);
    let mut index = open_index(&repo, dir.path(), test_config());

    let stats = index.ingest(&[&c0, &c1]).unwrap();
    assert_eq!(stats.changesets, 2);
    assert_eq!(stats.records, 3);
    let before = (count(&dir, "rec_item"), count(&dir, "hist"), count(&dir, "delta_add"));

    let stats = index.ingest(&[&c1, &c0]).unwrap();
    assert_eq!(stats.changesets, 0);
    assert_eq!(stats.skipped, 2);
    assert_eq!(
        (count(&dir, "rec_item"), count(&dir, "hist"), count(&dir, "delta_add")),
        before
    );

    let stats = index.ingest(&[&c2, &c1]).unwrap();
    assert_eq!(stats.changesets, 1);
    assert_eq!(stats.skipped, 1);
    assert_eq!(count(&dir, "rec_item"), 4);
}

/// Test: A batch is indexed in generation order, whatever order it is given in.
#[test]
fn test_batch_order_does_not_matter() {
    let dir = TempDir::new().unwrap();
    let mut repo = MemoryRepo::new(DagKind::with_recid());
    item_template(&mut repo);
    let (c0, c1, c2) = line(&mut repo);
    let repo = Arc::new(repo);
    let mut index = open_index(&repo, dir.path(), test_config());

    index.ingest(&[&c2, &c0, &c1]).unwrap();
    let records = index
        .query(&Query::new("item").with_sort(SortSpec::asc("name")).as_of(c2.as_str()))
        .unwrap();
    assert_eq!(names(&records), vec!["a1", "b0", "c0"]);
}

// =============================================================================
// FAILED BATCHES
// =============================================================================

/// Test: A changeset whose parent is not indexed aborts the whole batch.
#[test]
fn test_unindexed_parent_aborts_batch() {
    let dir = TempDir::new().unwrap();
    let mut repo = MemoryRepo::new(DagKind::with_recid());
    item_template(&mut repo);
    let (c0, _c1, c2) = line(&mut repo);
    let repo = Arc::new(repo);
    let mut index = open_index(&repo, dir.path(), test_config());

    let err = index.ingest(&[&c0, &c2]).unwrap_err();
    assert!(matches!(err, IndexError::ConsistencyViolation(_)), "{err}");
    assert_eq!(count(&dir, "csets"), 0);
    assert_eq!(count(&dir, "hist"), 0);
}

/// Test: A record of a type no template defines is a schema error.
#[test]
fn test_unknown_record_type_aborts_batch() {
    let dir = TempDir::new().unwrap();
    let mut repo = MemoryRepo::new(DagKind::with_recid());
    item_template(&mut repo);
    let a = repo.put("item", Some("a"), json!({"name": "a"}));
    let c0 = repo.commit(&[], "t1", &[a], &[]);
    let ghost = repo.put("ghost", Some("g"), json!({"name": "boo"}));
    let c1 = repo.commit(&[&c0], "t1", &[ghost], &[]);
    let repo = Arc::new(repo);
    let mut index = open_index(&repo, dir.path(), test_config());

    match index.ingest(&[&c0, &c1]) {
        Err(IndexError::Schema(e)) => assert_eq!(e.code(), SchemaErrorCode::UnknownRecordType),
        other => panic!("expected a schema error, got {other:?}"),
    }
    assert_eq!(count(&dir, "csets"), 0);

    // The good prefix still ingests on its own.
    index.ingest(&[&c0]).unwrap();
    assert_eq!(count(&dir, "csets"), 1);
}

/// Test: Templates that disagree on a field are rejected before anything is written.
#[test]
fn test_conflicting_templates_are_rejected() {
    let dir = TempDir::new().unwrap();
    let mut repo = MemoryRepo::new(DagKind::with_recid());
    item_template(&mut repo);
    repo.define("t2", "item", vec![("name", FieldSpec::int())]);
    let a = repo.put("item", Some("a"), json!({"name": "a"}));
    let c0 = repo.commit(&[], "t1", &[a], &[]);
    let b = repo.put("item", Some("b"), json!({"name": 7}));
    let c1 = repo.commit(&[&c0], "t2", &[b], &[]);
    let repo = Arc::new(repo);
    let mut index = open_index(&repo, dir.path(), test_config());

    index.ingest(&[&c0]).unwrap();
    match index.ingest(&[&c1]) {
        Err(IndexError::Schema(e)) => assert_eq!(e.code(), SchemaErrorCode::ConflictingField),
        other => panic!("expected a schema error, got {other:?}"),
    }
    assert_eq!(index.schema().templates, vec!["t1".to_string()]);
    assert_eq!(count(&dir, "csets"), 1);
}

// =============================================================================
// SCHEMA GROWTH
// =============================================================================

/// Test: A new template adds columns without disturbing indexed records.
#[test]
fn test_new_template_adds_columns() {
    let dir = TempDir::new().unwrap();
    let mut repo = MemoryRepo::new(DagKind::with_recid());
    item_template(&mut repo);
    repo.define(
        "t2",
        "item",
        vec![("name", FieldSpec::string().indexed()), ("color", FieldSpec::string())],
    );
    let a = repo.put("item", Some("a"), json!({"name": "a"}));
    let c0 = repo.commit(&[], "t1", &[a], &[]);
    let b = repo.put("item", Some("b"), json!({"name": "b", "color": "red"}));
    let c1 = repo.commit(&[&c0], "t2", &[b], &[]);
    let repo = Arc::new(repo);
    let mut index = open_index(&repo, dir.path(), test_config());

    index.ingest(&[&c0]).unwrap();
    index.ingest(&[&c1]).unwrap();

    let records = index
        .query(&Query::new("item").with_sort(SortSpec::asc("name")))
        .unwrap();
    assert_eq!(names(&records), vec!["a", "b"]);
    assert_eq!(records[0].get("color"), Some(&serde_json::Value::Null));
    assert_eq!(records[1].get_str("color"), Some("red"));
}

/// Test: A value that does not fit its field type is kept as text.
#[test]
fn test_unconvertible_value_is_stored_as_text() {
    let dir = TempDir::new().unwrap();
    let mut repo = MemoryRepo::new(DagKind::with_recid());
    item_template(&mut repo);
    let a = repo.put("item", Some("a"), json!({"name": "a", "priority": "high"}));
    let b = repo.put("item", Some("b"), json!({"name": "b", "priority": "4"}));
    let c0 = repo.commit(&[], "t1", &[a, b], &[]);
    let repo = Arc::new(repo);
    let mut index = open_index(&repo, dir.path(), test_config());
    index.ingest(&[&c0]).unwrap();

    let records = index
        .query(&Query::new("item").with_sort(SortSpec::asc("name")))
        .unwrap();
    assert_eq!(records[0].get("priority"), Some(&json!("high")));
    assert_eq!(records[1].get("priority"), Some(&json!(4)));
}

// =============================================================================
// LIFECYCLE
// =============================================================================

/// Test: Reopening an index restores its schema from the ingested templates.
#[test]
fn test_reopen_restores_schema() {
    let dir = TempDir::new().unwrap();
    let mut repo = MemoryRepo::new(DagKind::with_recid());
    item_template(&mut repo);
    let (c0, c1, _c2) = line(&mut repo);
    let repo = Arc::new(repo);

    {
        let mut index = open_index(&repo, dir.path(), test_config());
        index.ingest(&[&c0, &c1]).unwrap();
        index.state_filter(&c1).unwrap();
    }

    let index = open_index(&repo, dir.path(), test_config());
    assert_eq!(index.schema().templates, vec!["t1".to_string()]);
    let records = index.query(&Query::new("item").as_of(c1.as_str())).unwrap();
    assert_eq!(records.len(), 2);
}

/// Test: An empty index answers with an empty schema.
#[test]
fn test_fresh_index_has_empty_schema() {
    let dir = TempDir::new().unwrap();
    let repo = Arc::new(MemoryRepo::new(DagKind::with_recid()));
    let index = open_index(&repo, dir.path(), test_config());

    assert!(index.schema().rectypes.is_empty());
    assert!(matches!(
        index.query(&Query::new("item")),
        Err(IndexError::Compile(_))
    ));
}

/// Test: Invalid configuration is rejected when the index opens.
#[test]
fn test_invalid_config_rejected_on_open() {
    let dir = TempDir::new().unwrap();
    let repo = Arc::new(MemoryRepo::new(DagKind::with_recid()));
    let config = IndexConfig {
        evict_keep_recent: 0,
        ..test_config()
    };
    let result = RecordIndex::open(repo.clone(), repo.clone(), repo, dir.path(), config);
    assert!(matches!(result, Err(IndexError::Config(_))));
}

/// Test: Configuration files only need the values they change.
#[test]
fn test_partial_config_file() {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, r#"{{"filter_wait_timeout_ms": 250, "strict_consistency": true}}"#).unwrap();

    let config = IndexConfig::load(file.path()).unwrap();
    assert_eq!(config.filter_wait_timeout_ms, 250);
    assert!(config.strict_consistency);
    assert_eq!(config.evict_keep_recent, IndexConfig::default().evict_keep_recent);
}

/// Test: Removing the index deletes the main database and every filter.
#[test]
fn test_remove_deletes_everything() {
    let dir = TempDir::new().unwrap();
    let mut repo = MemoryRepo::new(DagKind::with_recid());
    item_template(&mut repo);
    let (c0, c1, _c2) = line(&mut repo);
    let repo = Arc::new(repo);
    let mut index = open_index(&repo, dir.path(), test_config());
    index.ingest(&[&c0, &c1]).unwrap();
    let filter = index.state_filter(&c1).unwrap();
    assert!(filter.path.exists());

    index.remove().unwrap();
    assert!(!dir.path().join(MAIN_DB_FILE).exists());
    assert!(!filter.path.exists());
    assert!(!dir.path().join("filters").exists());
}
