//! Integration tests for concurrent sessions committing to one branch.
//!
//! Every test drives the public API the way a SQL layer would: open
//! sessions, apply statements, commit, and inspect the branch afterwards.

use std::sync::Arc;
use std::thread;

use vtab_core::errors::TransactionError;
use vtab_core::{
    AppConfig, CommitOptions, Key, MergeState, Repository, RevSpec, Schema, SessionState, StorageKind, Value,
};

// ===========================================================================
// Helpers
// ===========================================================================

/// A repository with `t(pk int primary key, x int, y int)` holding rows
/// (1, 1, 0), (2, 2, 0), (3, 3, 0).
fn seeded(config: AppConfig) -> Arc<Repository> {
    let repo = Repository::init(config).unwrap();
    let mut s = repo.session("main").unwrap();
    let schema = Schema::builder("t")
        .key("pk", StorageKind::Int)
        .column("x", StorageKind::Int)
        .column("y", StorageKind::Int)
        .build()
        .unwrap();
    s.create_table("t", schema).unwrap();
    s.insert_many(
        "t",
        (1..=3i64).map(|i| vec![i.into(), i.into(), 0i64.into()]).collect(),
    )
    .unwrap();
    s.commit("seed", &CommitOptions::default()).unwrap();
    repo
}

fn column(repo: &Arc<Repository>, idx: usize) -> Vec<Value> {
    let s = repo.session("main").unwrap();
    s.scan("t").unwrap().into_iter().map(|r| r[idx].clone()).collect()
}

fn commit(s: &mut vtab_core::Session, msg: &str) -> Result<vtab_core::CommitResult, TransactionError> {
    s.commit(msg, &CommitOptions::default())
}

// ===========================================================================
// Tests
// ===========================================================================

#[test]
fn test_identical_concurrent_updates_both_commit() {
    let repo = seeded(AppConfig::default());
    let mut a = repo.session("main").unwrap();
    let mut b = repo.session("main").unwrap();

    a.update_where("t", |_| true, &[("y", 2.into())]).unwrap();
    b.update_where("t", |_| true, &[("y", 2.into())]).unwrap();

    commit(&mut a, "a sets y=2").unwrap();
    let res = commit(&mut b, "b sets y=2").unwrap();
    assert_eq!(b.state(), SessionState::Committed);
    assert_ne!(res.state, MergeState::MergedWithConflicts);
    assert_eq!(column(&repo, 2), vec![Value::Int(2); 3]);
}

#[test]
fn test_divergent_concurrent_updates_conflict() {
    let repo = seeded(AppConfig::default());
    let mut a = repo.session("main").unwrap();
    let mut b = repo.session("main").unwrap();

    a.update_where("t", |_| true, &[("y", 3.into())]).unwrap();
    b.update_where("t", |_| true, &[("y", 4.into())]).unwrap();

    commit(&mut a, "a sets y=3").unwrap();
    let tip = repo.branch_tip("main").unwrap();
    let err = commit(&mut b, "b sets y=4").unwrap_err();
    let TransactionError::Conflict { keys, .. } = &err else {
        panic!("unexpected error: {err}");
    };
    let blocked: Vec<Key> = (1..=3i64).map(Key::from).collect();
    assert_eq!(keys, &vec![("t".to_string(), blocked)]);
    assert_eq!(err.tables(), ["t".to_string()]);
    assert_eq!(b.state(), SessionState::ConflictBlocked);
    assert_eq!(repo.branch_tip("main").unwrap(), tip);

    b.rollback().unwrap();
    assert_eq!(b.state(), SessionState::Active);
    let ys: Vec<Value> = b.scan("t").unwrap().into_iter().map(|r| r[2].clone()).collect();
    assert_eq!(ys, vec![Value::Int(3); 3]);
}

#[test]
fn test_disjoint_keys_commit_in_either_order() {
    let repo = seeded(AppConfig::default());
    let mut a = repo.session("main").unwrap();
    let mut b = repo.session("main").unwrap();

    a.update("t", 1, &[("y", 10.into())]).unwrap();
    b.update("t", 3, &[("y", 30.into())]).unwrap();
    b.insert("t", vec![4.into(), 4.into(), 40.into()]).unwrap();

    commit(&mut b, "b").unwrap();
    let res = commit(&mut a, "a").unwrap();
    assert_eq!(res.state, MergeState::Merged);
    assert_eq!(
        column(&repo, 2),
        vec![Value::Int(10), Value::Int(0), Value::Int(30), Value::Int(40)]
    );
}

#[test]
fn test_disjoint_columns_of_same_row_merge() {
    let repo = seeded(AppConfig::default());
    let mut a = repo.session("main").unwrap();
    let mut b = repo.session("main").unwrap();

    a.update("t", 2, &[("x", 20.into())]).unwrap();
    b.update("t", 2, &[("y", 200.into())]).unwrap();

    commit(&mut a, "a").unwrap();
    commit(&mut b, "b").unwrap();
    let s = repo.session("main").unwrap();
    assert_eq!(
        s.get("t", 2).unwrap(),
        Some(vec![Value::Int(2), Value::Int(20), Value::Int(200)])
    );
}

#[test]
fn test_noop_commit_is_fast_forward_with_empty_diff() {
    let repo = seeded(AppConfig::default());
    let tip = repo.branch_tip("main").unwrap();
    let mut s = repo.session("main").unwrap();

    let res = commit(&mut s, "nothing").unwrap();
    assert_eq!(res.state, MergeState::FastForward);
    assert!(!res.created);
    assert_eq!(repo.branch_tip("main").unwrap(), tip);

    let mut diff = repo.diff("t", &RevSpec::Commit(tip), &RevSpec::from("main")).unwrap();
    assert!(diff.collect_rows().unwrap().is_empty());
}

#[test]
fn test_constraint_violation_from_concurrent_inserts_rolls_back() {
    let repo = Repository::init(AppConfig::default()).unwrap();
    let mut setup = repo.session("main").unwrap();
    let schema = Schema::builder("users")
        .key("id", StorageKind::Int)
        .required("email", StorageKind::String)
        .unique("uq_email", &["email"])
        .build()
        .unwrap();
    setup.create_table("users", schema).unwrap();
    commit(&mut setup, "create users").unwrap();

    let mut a = repo.session("main").unwrap();
    let mut b = repo.session("main").unwrap();
    a.insert("users", vec![1.into(), "x@example.com".into()]).unwrap();
    b.insert("users", vec![2.into(), "x@example.com".into()]).unwrap();

    commit(&mut a, "a").unwrap();
    let tip = repo.branch_tip("main").unwrap();
    let err = commit(&mut b, "b").unwrap_err();
    match &err {
        TransactionError::ConstraintViolations { tables, details } => {
            assert_eq!(tables, &vec!["users".to_string()]);
            assert!(details.iter().any(|d| d.contains("uq_email")));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(b.state(), SessionState::Aborted);
    assert_eq!(b.base(), tip);
    assert_eq!(b.scan("users").unwrap().len(), 1);
    assert_eq!(repo.branch_tip("main").unwrap(), tip);
}

#[test]
fn test_statement_violations_are_rejected_immediately() {
    let repo = seeded(AppConfig::default());
    let mut s = repo.session("main").unwrap();
    s.add_unique("t", "uq_x", &["x"]).unwrap();

    let err = s.insert("t", vec![9.into(), 1.into(), 0.into()]).unwrap_err();
    assert!(err.to_string().contains("uq_x"));
    assert_eq!(s.scan("t").unwrap().len(), 3);
    assert!(s.violations("t").unwrap().is_empty());
}

#[test]
fn test_savepoint_rollback_before_commit() {
    let repo = seeded(AppConfig::default());
    let mut s = repo.session("main").unwrap();
    s.update("t", 1, &[("y", 1.into())]).unwrap();
    s.savepoint("before_delete");
    s.delete_where("t", |_| true).unwrap();
    assert!(s.scan("t").unwrap().is_empty());

    s.rollback_to_savepoint("before_delete").unwrap();
    commit(&mut s, "keep rows").unwrap();
    assert_eq!(column(&repo, 2), vec![Value::Int(1), Value::Int(0), Value::Int(0)]);
}

#[test]
fn test_parallel_sessions_all_commit() {
    let repo = seeded(AppConfig::default());
    let handles: Vec<_> = (10..18i64)
        .map(|pk| {
            let repo = Arc::clone(&repo);
            thread::spawn(move || {
                let mut s = repo.session("main").unwrap();
                s.insert("t", vec![pk.into(), pk.into(), 0i64.into()]).unwrap();
                s.commit(&format!("insert {pk}"), &CommitOptions::default()).unwrap()
            })
        })
        .collect();
    for h in handles {
        assert!(h.join().unwrap().created);
    }

    let s = repo.session("main").unwrap();
    assert_eq!(s.scan("t").unwrap().len(), 11);
    // seed + init + eight inserts
    assert_eq!(repo.log(&RevSpec::from("main")).unwrap().len(), 10);
}

#[test]
fn test_committed_conflicts_when_permitted() {
    let mut config = AppConfig::default();
    config.transaction.allow_commit_conflicts = true;
    let repo = seeded(config);
    let mut a = repo.session("main").unwrap();
    let mut b = repo.session("main").unwrap();
    a.update("t", 1, &[("y", 3.into())]).unwrap();
    b.update("t", 1, &[("y", 4.into())]).unwrap();
    commit(&mut a, "a").unwrap();

    let opts = CommitOptions {
        allow_commit_with_conflicts: true,
        author: Some(("bob".into(), "bob@example.com".into())),
        ..Default::default()
    };
    let res = b.commit("b with conflicts", &opts).unwrap();
    assert_eq!(res.state, MergeState::MergedWithConflicts);

    let log = repo.log(&RevSpec::from("main")).unwrap();
    assert_eq!(log[0].author, "bob");
    let mut reader = repo.session("main").unwrap();
    let conflicts = reader.conflicts("t").unwrap();
    assert_eq!(conflicts.len(), 1);

    // Unresolved conflicts block the next ordinary commit.
    reader.update("t", 2, &[("y", 5.into())]).unwrap();
    assert!(matches!(
        commit(&mut reader, "blocked"),
        Err(TransactionError::Conflict { .. })
    ));
}
