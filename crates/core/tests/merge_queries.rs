//! Integration tests for branch merges, merge previews and conflict
//! resolution through sessions.

use std::sync::Arc;

use vtab_core::errors::{MergeError, TransactionError};
use vtab_core::merge::TableOperation;
use vtab_core::{
    AppConfig, CheckOp, CommitOptions, ConflictType, Key, MergeState, Repository, Resolution, RevSpec, Schema,
    Session, StorageKind, Value, ViolationKind,
};

// ===========================================================================
// Helpers
// ===========================================================================

/// `t(pk, v)` with rows (1, 10), (2, 20) on main, plus a `dev` branch at
/// the same commit.
fn repo_with_branch() -> Arc<Repository> {
    let repo = Repository::init(AppConfig::default()).unwrap();
    let mut s = repo.session("main").unwrap();
    let schema = Schema::builder("t")
        .key("pk", StorageKind::Int)
        .column("v", StorageKind::Int)
        .build()
        .unwrap();
    s.create_table("t", schema).unwrap();
    s.insert_many("t", vec![vec![1.into(), 10.into()], vec![2.into(), 20.into()]])
        .unwrap();
    s.commit("seed", &CommitOptions::default()).unwrap();
    repo.create_branch("dev", &RevSpec::from("main")).unwrap();
    repo
}

fn on_branch(repo: &Arc<Repository>, branch: &str, edit: impl FnOnce(&mut Session)) {
    let mut s = repo.session(branch).unwrap();
    edit(&mut s);
    s.commit(&format!("edit on {branch}"), &CommitOptions::default())
        .unwrap();
}

fn dev() -> RevSpec {
    RevSpec::from("dev")
}

// ===========================================================================
// Tests
// ===========================================================================

#[test]
fn test_clean_branch_merge_records_two_parents() {
    let repo = repo_with_branch();
    on_branch(&repo, "dev", |s| s.insert("t", vec![3.into(), 30.into()]).unwrap());
    on_branch(&repo, "main", |s| s.update("t", 1, &[("v", 11.into())]).unwrap());

    let mut s = repo.session("main").unwrap();
    let result = s.merge(&dev()).unwrap();
    assert_eq!(result.state, MergeState::Merged);
    assert!(s.working().pending_merge().is_some());

    let res = s.commit("merge dev", &CommitOptions::default()).unwrap();
    let merged = repo.graph().get(&res.commit).unwrap();
    assert_eq!(merged.parents().len(), 2);
    assert_eq!(merged.parents()[1], repo.branch_tip("dev").unwrap());
    assert_eq!(
        s.scan("t").unwrap(),
        vec![
            vec![Value::Int(1), Value::Int(11)],
            vec![Value::Int(2), Value::Int(20)],
            vec![Value::Int(3), Value::Int(30)],
        ]
    );
}

#[test]
fn test_squash_merge_records_one_parent() {
    let repo = repo_with_branch();
    on_branch(&repo, "dev", |s| s.delete("t", 2).map(|_| ()).unwrap());

    let mut s = repo.session("main").unwrap();
    let result = s.merge(&dev()).unwrap();
    assert_eq!(result.state, MergeState::FastForward);
    let opts = CommitOptions {
        squash: true,
        ..Default::default()
    };
    let res = s.commit("squash dev", &opts).unwrap();
    assert_eq!(repo.graph().get(&res.commit).unwrap().parents().len(), 1);
    assert_eq!(s.scan("t").unwrap().len(), 1);
}

#[test]
fn test_merging_an_ancestor_changes_nothing() {
    let repo = repo_with_branch();
    on_branch(&repo, "main", |s| s.insert("t", vec![5.into(), 50.into()]).unwrap());

    let mut s = repo.session("main").unwrap();
    s.merge(&dev()).unwrap();
    assert!(s.working().pending_merge().is_none());
    let res = s.commit("no-op", &CommitOptions::default()).unwrap();
    assert!(!res.created);
}

#[test]
fn test_conflicting_merge_blocks_until_resolved() {
    let repo = repo_with_branch();
    on_branch(&repo, "dev", |s| s.update("t", 1, &[("v", 100.into())]).unwrap());
    on_branch(&repo, "main", |s| s.update("t", 1, &[("v", 200.into())]).unwrap());

    let mut s = repo.session("main").unwrap();
    let result = s.merge(&dev()).unwrap();
    assert_eq!(result.state, MergeState::MergedWithConflicts);
    assert_eq!(result.conflicted_tables(), vec!["t".to_string()]);

    let conflicts = s.conflicts("t").unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].conflict_type, ConflictType::Content);

    assert!(matches!(
        s.commit("too early", &CommitOptions::default()),
        Err(TransactionError::Conflict { .. })
    ));

    assert_eq!(s.resolve_conflicts("t", Resolution::Theirs).unwrap(), 1);
    assert!(s.conflicts("t").unwrap().is_empty());
    let res = s.commit("resolved", &CommitOptions::default()).unwrap();
    assert!(res.created);
    assert_eq!(s.get("t", 1).unwrap(), Some(vec![Value::Int(1), Value::Int(100)]));
    assert_eq!(repo.graph().get(&res.commit).unwrap().parents().len(), 2);
}

#[test]
fn test_preview_merge_moves_nothing() {
    let repo = repo_with_branch();
    on_branch(&repo, "dev", |s| s.update("t", 2, &[("v", 1.into())]).unwrap());
    on_branch(&repo, "main", |s| s.update("t", 2, &[("v", 2.into())]).unwrap());
    let main_tip = repo.branch_tip("main").unwrap();
    let dev_tip = repo.branch_tip("dev").unwrap();

    let preview = repo.preview_merge(&RevSpec::from("main"), &dev()).unwrap();
    assert_eq!(preview.state, MergeState::MergedWithConflicts);
    assert_eq!(repo.branch_tip("main").unwrap(), main_tip);
    assert_eq!(repo.branch_tip("dev").unwrap(), dev_tip);
}

#[test]
fn test_merge_records_new_violations() {
    let repo = repo_with_branch();
    on_branch(&repo, "main", |s| {
        s.add_check("t", "v_small", "v", CheckOp::Lt, 1000).unwrap();
    });
    on_branch(&repo, "dev", |s| s.update("t", 2, &[("v", 5000.into())]).unwrap());

    let mut s = repo.session("main").unwrap();
    let result = s.merge(&dev()).unwrap();
    assert_eq!(result.state, MergeState::MergedWithConflicts);
    assert_eq!(result.violated_tables(), vec!["t".to_string()]);
    let violations = s.violations("t").unwrap();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].kind, ViolationKind::Check);
    assert_eq!(violations[0].constraint, "v_small");

    assert_eq!(s.clear_violations("t").unwrap(), 1);
    s.update("t", 2, &[("v", 5.into())]).unwrap();
    s.commit("fixed", &CommitOptions::default()).unwrap();
}

#[test]
fn test_schema_changes_merge_with_data() {
    let repo = repo_with_branch();
    on_branch(&repo, "dev", |s| {
        s.add_column("t", "note", StorageKind::String, true, None).unwrap();
        s.update("t", 1, &[("note", "hello".into())]).unwrap();
    });
    on_branch(&repo, "main", |s| s.insert("t", vec![3.into(), 30.into()]).unwrap());

    let mut s = repo.session("main").unwrap();
    let result = s.merge(&dev()).unwrap();
    assert_eq!(result.state, MergeState::Merged);
    assert_eq!(
        s.scan("t").unwrap(),
        vec![
            vec![Value::Int(1), Value::Int(10), Value::from("hello")],
            vec![Value::Int(2), Value::Int(20), Value::Null],
            vec![Value::Int(3), Value::Int(30), Value::Null],
        ]
    );
}

#[test]
fn test_theirs_drop_wins_over_our_update() {
    let repo = repo_with_branch();
    on_branch(&repo, "dev", |s| s.drop_table("t").unwrap());
    on_branch(&repo, "main", |s| s.update("t", 1, &[("v", 11.into())]).unwrap());

    let mut s = repo.session("main").unwrap();
    let result = s.merge(&dev()).unwrap();
    assert_eq!(result.state, MergeState::MergedWithConflicts);
    assert_eq!(result.tables[0].operation, TableOperation::SchemaConflict);

    assert_eq!(s.resolve_conflicts("t", Resolution::Theirs).unwrap(), 1);
    assert!(s.table_names().is_empty());
    s.commit("take dev's drop", &CommitOptions::default()).unwrap();
    assert!(repo.session("main").unwrap().table_names().is_empty());
}

#[test]
fn test_ours_drop_wins_over_their_update() {
    let repo = repo_with_branch();
    on_branch(&repo, "dev", |s| s.update("t", 1, &[("v", 11.into())]).unwrap());
    on_branch(&repo, "main", |s| s.drop_table("t").unwrap());

    let mut s = repo.session("main").unwrap();
    s.merge(&dev()).unwrap();
    assert_eq!(s.table_names(), vec!["t".to_string()]);

    s.resolve_conflicts("t", Resolution::Ours).unwrap();
    assert!(s.table_names().is_empty());
}

#[test]
fn test_tables_added_on_both_sides_resolve_to_either() {
    let repo = repo_with_branch();
    on_branch(&repo, "dev", |s| {
        let schema = Schema::builder("u")
            .key("id", StorageKind::Int)
            .column("label", StorageKind::String)
            .build()
            .unwrap();
        s.create_table("u", schema).unwrap();
        s.insert("u", vec![1.into(), "from dev".into()]).unwrap();
    });
    on_branch(&repo, "main", |s| {
        let schema = Schema::builder("u")
            .key("id", StorageKind::Int)
            .column("amount", StorageKind::Int)
            .build()
            .unwrap();
        s.create_table("u", schema).unwrap();
        s.insert("u", vec![1.into(), 5.into()]).unwrap();
    });

    let mut ours = repo.session("main").unwrap();
    let result = ours.merge(&dev()).unwrap();
    assert_eq!(result.conflicted_tables(), vec!["u".to_string()]);
    ours.resolve_conflicts("u", Resolution::Ours).unwrap();
    assert_eq!(ours.scan("u").unwrap(), vec![vec![Value::Int(1), Value::Int(5)]]);

    let mut theirs = repo.session("main").unwrap();
    theirs.merge(&dev()).unwrap();
    theirs.resolve_conflicts("u", Resolution::Theirs).unwrap();
    assert!(theirs.schema("u").unwrap().column_by_name("label").is_some());
    assert_eq!(theirs.scan("u").unwrap(), vec![vec![Value::Int(1), Value::from("from dev")]]);
    let res = theirs.commit("take dev's u", &CommitOptions::default()).unwrap();
    assert_eq!(repo.graph().get(&res.commit).unwrap().parents().len(), 2);
}

#[test]
fn test_primary_key_change_reports_unmerged_rows() {
    let repo = repo_with_branch();
    on_branch(&repo, "dev", |s| {
        s.insert("t", vec![3.into(), 30.into()]).unwrap();
        s.set_primary_key("t", &["pk", "v"]).unwrap();
    });
    on_branch(&repo, "main", |s| s.update("t", 1, &[("v", 11.into())]).unwrap());

    let mut s = repo.session("main").unwrap();
    let result = s.merge(&dev()).unwrap();
    assert_eq!(result.state, MergeState::MergedWithConflicts);
    let stats = &result.tables[0];
    assert_eq!(stats.operation, TableOperation::KeyChangeAborted);
    assert!(stats.partial_rows.contains(&Key::new(vec![Value::Int(3), Value::Int(30)])));
    assert!(result.warnings.messages()[0].contains("primary key set change"));
    // Ours stays in place.
    assert_eq!(s.get("t", 1).unwrap(), Some(vec![Value::Int(1), Value::Int(11)]));

    s.resolve_conflicts("t", Resolution::Theirs).unwrap();
    let pk: Vec<&str> = s.schema("t").unwrap().pk_columns().map(|c| c.name.as_str()).collect();
    assert_eq!(pk, vec!["pk", "v"]);
    assert_eq!(s.scan("t").unwrap().len(), 3);
}

#[test]
fn test_second_merge_cannot_replace_unresolved_conflicts() {
    let repo = repo_with_branch();
    on_branch(&repo, "dev", |s| s.update("t", 1, &[("v", 100.into())]).unwrap());
    on_branch(&repo, "main", |s| s.update("t", 1, &[("v", 200.into())]).unwrap());

    let mut s = repo.session("main").unwrap();
    s.merge(&dev()).unwrap();
    s.update("t", 2, &[("v", 22.into())]).unwrap();
    on_branch(&repo, "dev", |d| d.update("t", 2, &[("v", 23.into())]).unwrap());

    match s.merge(&dev()) {
        Err(TransactionError::Merge(MergeError::WouldOverwriteConflicts { tables })) => {
            assert_eq!(tables, vec!["t".to_string()]);
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(result) => panic!("merge unexpectedly succeeded: {}", result.state),
    }
    assert_eq!(s.conflicts("t").unwrap().len(), 1);
    assert_eq!(s.get("t", 2).unwrap(), Some(vec![Value::Int(2), Value::Int(22)]));
}
