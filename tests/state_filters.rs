//! State-filter materialization
//!
//! Covers:
//! 1. Filter contents equal the DAG's live set for every kind of base
//! 2. Concurrent callers share one build
//! 3. Waiting on a held lock: timeout and takeover
//! 4. Filters built under another schema are never used as a base
//! 5. Eviction of old filters

mod common;

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, SystemTime};

use serde_json::json;
use tempfile::TempDir;

use common::{item_template, names, open_index, test_config, MemoryRepo, Repo};
use dagindex::dag::{DagKind, Hidrec};
use dagindex::filter::{
    evict, parse_filter_name, BaseKind, EvictionPolicy, FilterOutcome, FilterPaths,
    MaterializeError,
};
use dagindex::query::Query;
use dagindex::schema::FieldSpec;
use dagindex::{IndexConfig, IndexError};

/// Names of the items a snapshot query returns
fn live_names(index: &common::Index, csid: &str) -> BTreeSet<String> {
    let records = index
        .query(&Query::new("item").as_of(csid))
        .unwrap();
    names(&records).into_iter().collect()
}

fn expected_names(repo: &MemoryRepo, csid: &str, all: &[(Hidrec, &str)]) -> BTreeSet<String> {
    let live = repo.live(csid);
    all.iter()
        .filter(|(hidrec, _)| live.contains(hidrec))
        .map(|(_, name)| name.to_string())
        .collect()
}

// =============================================================================
// EQUIVALENCE ACROSS BASES
// =============================================================================

/// Main line c0..c4 and a branch b1..b3 off c0.
struct Dag {
    repo: Repo,
    main: Vec<String>,
    branch: Vec<String>,
    records: Vec<(Hidrec, &'static str)>,
}

fn dag() -> Dag {
    let mut repo = MemoryRepo::new(DagKind::with_recid());
    item_template(&mut repo);
    let mut records = Vec::new();
    let mut put = |repo: &mut MemoryRepo, recid: &str, name: &'static str| {
        let h = repo.put("item", Some(recid), json!({ "name": name }));
        records.push((h.clone(), name));
        h
    };

    let a = put(&mut repo, "a", "a0");
    let b = put(&mut repo, "b", "b0");
    let c0 = repo.commit(&[], "t1", &[a.clone(), b.clone()], &[]);

    let a1 = put(&mut repo, "a", "a1");
    let c1 = repo.commit(&[&c0], "t1", &[a1.clone()], &[a]);
    let c = put(&mut repo, "c", "c0");
    let c2 = repo.commit(&[&c1], "t1", &[c.clone()], &[b.clone()]);
    let d = put(&mut repo, "d", "d0");
    let c3 = repo.commit(&[&c2], "t1", &[d], &[]);
    let c4 = repo.commit(&[&c3], "t1", &[], &[c]);

    let x = put(&mut repo, "x", "x0");
    let b1 = repo.commit(&[&c0], "t1", &[x.clone()], &[]);
    let y = put(&mut repo, "y", "y0");
    let b2 = repo.commit(&[&b1], "t1", &[y], &[b]);
    let b3 = repo.commit(&[&b2], "t1", &[], &[x]);

    Dag {
        repo: Arc::new(repo),
        main: vec![c0, c1, c2, c3, c4],
        branch: vec![b1, b2, b3],
        records,
    }
}

fn ingest_all(dag: &Dag, index: &mut common::Index) {
    let mut all: Vec<&String> = dag.main.iter().collect();
    all.extend(dag.branch.iter());
    index.ingest(&all).unwrap();
}

/// Test: Filters built from root, parent, ancestor and any base agree with the DAG.
#[test]
fn test_every_base_kind_matches_live_set() {
    let dir = TempDir::new().unwrap();
    let dag = dag();
    let mut index = open_index(&dag.repo, dir.path(), test_config());
    ingest_all(&dag, &mut index);
    let (main, branch) = (&dag.main, &dag.branch);

    let built = |csid: &str| index.state_filter(csid).unwrap().outcome;
    assert_eq!(built(&main[1]), FilterOutcome::Built(BaseKind::Root));
    assert_eq!(built(&main[2]), FilterOutcome::Built(BaseKind::Parent));
    assert_eq!(built(&main[4]), FilterOutcome::Built(BaseKind::Ancestor));
    assert_eq!(built(&branch[2]), FilterOutcome::Built(BaseKind::Any));
    assert_eq!(built(&main[2]), FilterOutcome::Attached);

    for csid in [&main[1], &main[2], &main[4], &branch[2]] {
        assert!(index.verify_filter(csid).unwrap().is_empty());
        assert_eq!(
            live_names(&index, csid),
            expected_names(&dag.repo, csid, &dag.records)
        );
    }
}

/// Test: Strict consistency turns a tampered filter into an error.
#[test]
fn test_strict_verification_rejects_tampered_filter() {
    let dir = TempDir::new().unwrap();
    let dag = dag();
    let config = IndexConfig {
        strict_consistency: true,
        ..test_config()
    };
    let mut index = open_index(&dag.repo, dir.path(), config);
    ingest_all(&dag, &mut index);

    let filter = index.state_filter(&dag.main[1]).unwrap();
    let conn = rusqlite::Connection::open(&filter.path).unwrap();
    conn.execute("DELETE FROM rec_item WHERE f_recid = 'a'", [])
        .unwrap();
    drop(conn);

    match index.verify_filter(&dag.main[1]) {
        Err(IndexError::ConsistencyViolation(_)) => {}
        other => panic!("expected a consistency violation, got {other:?}"),
    }
}

/// Test: Asking for a changeset that was never ingested fails.
#[test]
fn test_unindexed_changeset_has_no_filter() {
    let dir = TempDir::new().unwrap();
    let dag = dag();
    let mut index = open_index(&dag.repo, dir.path(), test_config());
    index.ingest(&[&dag.main[0]]).unwrap();

    match index.state_filter(&dag.main[1]) {
        Err(IndexError::Materialize(MaterializeError::ChangesetNotIndexed(csid))) => {
            assert_eq!(csid, dag.main[1]);
        }
        other => panic!("expected ChangesetNotIndexed, got {other:?}"),
    }
}

// =============================================================================
// CONCURRENCY
// =============================================================================

/// Test: Two callers racing for one filter build it exactly once.
#[test]
fn test_concurrent_callers_build_once() {
    let dir = TempDir::new().unwrap();
    let dag = dag();
    let mut first = open_index(&dag.repo, dir.path(), test_config());
    ingest_all(&dag, &mut first);
    let second = open_index(&dag.repo, dir.path(), test_config());

    let target = dag.main[3].clone();
    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = [first, second]
        .into_iter()
        .map(|index| {
            let barrier = Arc::clone(&barrier);
            let target = target.clone();
            thread::spawn(move || {
                barrier.wait();
                index.state_filter(&target).unwrap().outcome
            })
        })
        .collect();
    let outcomes: Vec<FilterOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let builds = outcomes
        .iter()
        .filter(|o| matches!(o, FilterOutcome::Built(_)))
        .count();
    assert_eq!(builds, 1, "outcomes: {outcomes:?}");
    assert!(outcomes.contains(&FilterOutcome::Attached));
}

/// Test: A lock that is never released ends in a timeout.
#[test]
fn test_wait_on_held_lock_times_out() {
    let dir = TempDir::new().unwrap();
    let dag = dag();
    let config = IndexConfig {
        filter_wait_timeout_ms: 200,
        ..test_config()
    };
    let mut index = open_index(&dag.repo, dir.path(), config);
    ingest_all(&dag, &mut index);

    let paths = FilterPaths::new(dir.path());
    fs::create_dir_all(paths.dir()).unwrap();
    File::create(paths.lock_path(&dag.main[2])).unwrap();

    match index.state_filter(&dag.main[2]) {
        Err(IndexError::Materialize(MaterializeError::FilterBuildTimeout { csid, waited_ms })) => {
            assert_eq!(csid, dag.main[2]);
            assert!(waited_ms >= 200);
        }
        other => panic!("expected a timeout, got {other:?}"),
    }
}

/// Test: A waiter takes over when the lock holder vanishes.
#[test]
fn test_waiter_takes_over_released_lock() {
    let dir = TempDir::new().unwrap();
    let dag = dag();
    let mut index = open_index(&dag.repo, dir.path(), test_config());
    ingest_all(&dag, &mut index);

    let paths = FilterPaths::new(dir.path());
    fs::create_dir_all(paths.dir()).unwrap();
    let lock = paths.lock_path(&dag.main[2]);
    File::create(&lock).unwrap();

    let remover = thread::spawn(move || {
        thread::sleep(Duration::from_millis(150));
        fs::remove_file(lock).unwrap();
    });
    let filter = index.state_filter(&dag.main[2]).unwrap();
    remover.join().unwrap();

    assert_eq!(filter.outcome, FilterOutcome::Built(BaseKind::Root));
    assert!(!paths.lock_path(&dag.main[2]).exists());
    assert!(index.verify_filter(&dag.main[2]).unwrap().is_empty());
}

// =============================================================================
// SCHEMA CHANGES
// =============================================================================

/// Test: A filter built under an older schema keeps it, and is not reused as a base.
#[test]
fn test_filters_keep_their_schema() {
    let dir = TempDir::new().unwrap();
    let mut repo = MemoryRepo::new(DagKind::with_recid());
    item_template(&mut repo);
    repo.define("t2", "item", vec![("name", FieldSpec::string().indexed())]);
    repo.define("t2", "item", vec![("color", FieldSpec::string())]);

    let a = repo.put("item", Some("a"), json!({"name": "a"}));
    let c0 = repo.commit(&[], "t1", &[a], &[]);
    let b = repo.put("item", Some("b"), json!({"name": "b", "color": "red"}));
    let c1 = repo.commit(&[&c0], "t2", &[b], &[]);
    let repo = Arc::new(repo);

    let mut index = open_index(&repo, dir.path(), test_config());
    index.ingest(&[&c0]).unwrap();
    let old = index.state_filter(&c0).unwrap();
    assert!(old.schema.field("item", "color").is_none());

    index.ingest(&[&c1]).unwrap();
    assert!(index.schema().field("item", "color").is_some());

    let new = index.state_filter(&c1).unwrap();
    assert_eq!(new.outcome, FilterOutcome::Built(BaseKind::Root));
    assert!(new.schema.field("item", "color").is_some());

    // The old snapshot still compiles against its own schema.
    let records = index.query(&Query::new("item").as_of(c0.as_str())).unwrap();
    assert_eq!(names(&records), vec!["a"]);
    assert!(records[0].get("color").is_none());

    let records = index.query(&Query::new("item").as_of(c1.as_str())).unwrap();
    assert_eq!(records.len(), 2);
}

// =============================================================================
// EVICTION
// =============================================================================

fn place_filter(paths: &FilterPaths, generation: u64, age_secs: u64) {
    let path = paths.filter_path(generation, &format!("cs{:04}", generation));
    let file = File::create(&path).unwrap();
    file.set_modified(SystemTime::now() - Duration::from_secs(age_secs))
        .unwrap();
}

/// Test: Eviction keeps the most recent filters and those near the oldest kept.
#[test]
fn test_eviction_window() {
    let dir = TempDir::new().unwrap();
    let paths = FilterPaths::new(dir.path());
    paths.ensure_dir().unwrap();

    // Twenty filters, ten generations and a hundred seconds apart; newest is gen 200.
    for i in 1..=20u64 {
        place_filter(&paths, i * 10, (20 - i) * 100 + 10);
    }
    // Within two generations of the oldest kept filter (gen 50).
    place_filter(&paths, 49, 5_000);

    let policy = EvictionPolicy {
        keep_recent: 16,
        generation_window: 2,
        age_window: Duration::from_secs(60),
    };
    let report = evict(&paths, &policy, Duration::from_secs(60)).unwrap();

    let mut removed: Vec<u64> = report
        .removed
        .iter()
        .filter_map(|p| p.file_name().and_then(|n| n.to_str()))
        .filter_map(parse_filter_name)
        .map(|(generation, _)| generation)
        .collect();
    removed.sort_unstable();
    assert_eq!(removed, vec![10, 20, 30, 40]);
    assert_eq!(report.kept, 17);

    let left = paths.list().unwrap();
    assert_eq!(left.len(), 17);
    assert!(left.iter().any(|e| e.generation == 49));
}

/// Test: Eviction clears out build files abandoned by crashed builders.
#[test]
fn test_eviction_removes_stale_temps() {
    let dir = TempDir::new().unwrap();
    let paths = FilterPaths::new(dir.path());
    paths.ensure_dir().unwrap();

    let stale = paths.temp_path();
    File::create(&stale)
        .unwrap()
        .set_modified(SystemTime::now() - Duration::from_secs(600))
        .unwrap();
    let fresh = paths.temp_path();
    File::create(&fresh).unwrap();

    let policy = EvictionPolicy {
        keep_recent: 16,
        generation_window: 2,
        age_window: Duration::from_secs(60),
    };
    let report = evict(&paths, &policy, Duration::from_secs(60)).unwrap();

    assert_eq!(report.stale_temps, 1);
    assert!(!stale.exists());
    assert!(fresh.exists());
}
