//! Integration tests for row diffs, table deltas and history between
//! commits produced through sessions.

use std::sync::Arc;

use vtab_core::diff::TableDeltaKind;
use vtab_core::{
    AppConfig, CommitOptions, DiffRow, DiffType, Hash, Repository, RevSpec, Schema, Session, StorageKind, Value,
};

// ===========================================================================
// Helpers
// ===========================================================================

fn repo() -> Arc<Repository> {
    Repository::init(AppConfig::default()).unwrap()
}

fn create_t(s: &mut Session) {
    let schema = Schema::builder("t")
        .key("pk", StorageKind::Int)
        .column("c1", StorageKind::Int)
        .column("c2", StorageKind::Int)
        .build()
        .unwrap();
    s.create_table("t", schema).unwrap();
}

fn commit(s: &mut Session, msg: &str) -> Hash {
    s.commit(msg, &CommitOptions::default()).unwrap().commit
}

fn diff(repo: &Repository, table: &str, from: Hash, to: Hash) -> Vec<DiffRow> {
    repo.diff(table, &RevSpec::Commit(from), &RevSpec::Commit(to))
        .unwrap()
        .collect_rows()
        .unwrap()
}

fn ints(values: &[i64]) -> Vec<Value> {
    values.iter().map(|v| Value::Int(*v)).collect()
}

// ===========================================================================
// Tests
// ===========================================================================

#[test]
fn test_single_update_yields_one_modified_row() {
    let repo = repo();
    let mut s = repo.session("main").unwrap();
    create_t(&mut s);
    s.insert("t", ints(&[1, 2, 3])).unwrap();
    s.insert("t", ints(&[4, 5, 6])).unwrap();
    let c1 = commit(&mut s, "C1");

    s.update_where("t", |r| r.get("pk") == &Value::Int(1), &[("c2", 0.into())])
        .unwrap();
    let c2 = commit(&mut s, "C2");

    let rows = diff(&repo, "t", c1, c2);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].diff_type, DiffType::Modified);
    assert_eq!(rows[0].from, Some(ints(&[1, 2, 3])));
    assert_eq!(rows[0].to, Some(ints(&[1, 2, 0])));

    let stat = repo.diff_stat("t", &RevSpec::Commit(c1), &RevSpec::Commit(c2)).unwrap();
    assert_eq!(stat.rows_modified, 1);
    assert_eq!(stat.cells_modified, 1);
    assert_eq!(stat.new_row_count, 2);
}

#[test]
fn test_swapped_diff_is_symmetric() {
    let repo = repo();
    let mut s = repo.session("main").unwrap();
    create_t(&mut s);
    s.insert_many("t", vec![ints(&[1, 1, 1]), ints(&[2, 2, 2])]).unwrap();
    let a = commit(&mut s, "A");
    s.delete("t", 1).unwrap();
    s.insert("t", ints(&[3, 3, 3])).unwrap();
    s.update("t", 2, &[("c1", 20.into())]).unwrap();
    let b = commit(&mut s, "B");

    let forward = diff(&repo, "t", a, b);
    let backward = diff(&repo, "t", b, a);
    assert_eq!(forward.len(), backward.len());
    for (f, r) in forward.iter().zip(&backward) {
        let flipped = match f.diff_type {
            DiffType::Added => DiffType::Removed,
            DiffType::Removed => DiffType::Added,
            DiffType::Modified => DiffType::Modified,
        };
        assert_eq!(r.diff_type, flipped);
        assert_eq!(r.key, f.key);
        assert_eq!(r.from, f.to);
        assert_eq!(r.to, f.from);
    }
}

#[test]
fn test_rename_produces_no_rows() {
    let repo = repo();
    let mut s = repo.session("main").unwrap();
    create_t(&mut s);
    s.insert("t", ints(&[1, 2, 3])).unwrap();
    let before = commit(&mut s, "before");
    s.rename_column("t", "c2", "renamed").unwrap();
    let after = commit(&mut s, "rename");

    let mut d = repo
        .diff("t", &RevSpec::Commit(before), &RevSpec::Commit(after))
        .unwrap();
    assert_eq!(d.columns(), vec!["pk", "c1", "renamed"]);
    assert!(d.collect_rows().unwrap().is_empty());
}

#[test]
fn test_drop_and_recreate_column_is_visible() {
    let repo = repo();
    let mut s = repo.session("main").unwrap();
    create_t(&mut s);
    s.insert("t", ints(&[1, 2, 3])).unwrap();
    let base = commit(&mut s, "base");

    s.drop_column("t", "c2").unwrap();
    let dropped = commit(&mut s, "drop c2");
    let rows = diff(&repo, "t", base, dropped);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].diff_type, DiffType::Modified);
    assert_eq!(rows[0].from, Some(ints(&[1, 2, 3])));
    assert_eq!(rows[0].to, Some(vec![Value::Int(1), Value::Int(2), Value::Null]));

    s.add_column("t", "c2", StorageKind::Int, true, Some(9.into())).unwrap();
    let readded = commit(&mut s, "re-add c2");
    let rows = diff(&repo, "t", dropped, readded);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].diff_type, DiffType::Modified);
    assert_eq!(rows[0].from, Some(vec![Value::Int(1), Value::Int(2), Value::Null]));
    assert_eq!(rows[0].to, Some(ints(&[1, 2, 9])));
}

#[test]
fn test_working_and_empty_revisions() {
    let repo = repo();
    let mut s = repo.session("main").unwrap();
    create_t(&mut s);
    s.insert_many("t", vec![ints(&[1, 1, 1]), ints(&[2, 2, 2])]).unwrap();
    let c1 = commit(&mut s, "C1");

    let all = repo
        .diff("t", &RevSpec::Empty, &RevSpec::Commit(c1))
        .unwrap()
        .collect_rows()
        .unwrap();
    assert!(all.iter().all(|r| r.diff_type == DiffType::Added));
    assert_eq!(all.len(), 2);

    s.delete("t", 2).unwrap();
    let pending = s
        .diff("t", &RevSpec::from("main"), &RevSpec::Working)
        .unwrap()
        .collect_rows()
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].diff_type, DiffType::Removed);
    assert!(repo.diff("t", &RevSpec::from("main"), &RevSpec::Working).is_err());
}

#[test]
fn test_keyless_duplicates_expand() {
    let repo = repo();
    let mut s = repo.session("main").unwrap();
    let schema = Schema::builder("events").column("name", StorageKind::String).build().unwrap();
    s.create_table("events", schema).unwrap();
    let c0 = commit(&mut s, "create");
    s.insert_many("events", vec![vec!["x".into()], vec!["x".into()], vec!["y".into()]])
        .unwrap();
    let c1 = commit(&mut s, "insert");

    let rows = diff(&repo, "events", c0, c1);
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|r| r.diff_type == DiffType::Added));
    let xs = rows.iter().filter(|r| r.to == Some(vec![Value::from("x")])).count();
    assert_eq!(xs, 2);
}

#[test]
fn test_table_deltas() {
    let repo = repo();
    let mut s = repo.session("main").unwrap();
    create_t(&mut s);
    let other = Schema::builder("u").key("id", StorageKind::Int).build().unwrap();
    s.create_table("u", other).unwrap();
    let c1 = commit(&mut s, "C1");
    s.drop_table("u").unwrap();
    s.insert("t", ints(&[1, 1, 1])).unwrap();
    let c2 = commit(&mut s, "C2");

    let deltas = repo.table_deltas(&RevSpec::Commit(c1), &RevSpec::Commit(c2)).unwrap();
    let kinds: Vec<_> = deltas.iter().map(|d| (d.name.as_str(), d.kind)).collect();
    assert_eq!(kinds, vec![("t", TableDeltaKind::Modified), ("u", TableDeltaKind::Dropped)]);
    assert!(deltas[0].data_changed());
    assert!(!deltas[0].schema_changed());
}

#[test]
fn test_history_has_one_group_per_changing_commit() {
    let repo = repo();
    let mut s = repo.session("main").unwrap();
    create_t(&mut s);
    let mut expected = 0;
    commit(&mut s, "create empty table");

    for i in 1..=4i64 {
        s.insert("t", ints(&[i, i, i])).unwrap();
        commit(&mut s, &format!("insert {i}"));
        expected += 1;
    }
    // Touches another table only.
    let side = Schema::builder("side").key("id", StorageKind::Int).build().unwrap();
    s.create_table("side", side).unwrap();
    s.insert("side", vec![1.into()]).unwrap();
    commit(&mut s, "side table");

    s.rename_column("t", "c1", "first").unwrap();
    commit(&mut s, "rename only");
    s.update("t", 2, &[("first", 22.into())]).unwrap();
    commit(&mut s, "update");
    expected += 1;

    let history = repo.history("t", &RevSpec::from("main")).unwrap();
    assert_eq!(history.len(), expected);
    assert_eq!(history.columns, vec!["pk", "first", "c2"]);
    assert_eq!(history.groups[0].commit.message, "update");
    assert_eq!(history.groups[0].rows, vec![ints(&[2, 22, 2])]);
    assert_eq!(history.rows().count(), 5);

    let log = repo.log(&RevSpec::from("main")).unwrap();
    assert_eq!(log.len(), 9);
}

#[test]
fn test_history_spans_a_dropped_and_recreated_table() {
    let repo = repo();
    let mut s = repo.session("main").unwrap();
    create_t(&mut s);
    s.insert("t", ints(&[1, 1, 1])).unwrap();
    commit(&mut s, "first lineage");
    s.drop_table("t").unwrap();
    commit(&mut s, "drop t");
    create_t(&mut s);
    s.insert("t", ints(&[2, 2, 2])).unwrap();
    commit(&mut s, "second lineage");

    // History follows the name, so the earlier table's rows are included.
    let history = repo.history("t", &RevSpec::from("main")).unwrap();
    let messages: Vec<&str> = history.groups.iter().map(|g| g.commit.message.as_str()).collect();
    assert_eq!(messages, vec!["second lineage", "drop t", "first lineage"]);
    assert_eq!(history.groups[1].removed, vec![vtab_core::Key::from(1)]);
    let rows: Vec<&[Value]> = history.rows().map(|(_, r)| r).collect();
    assert_eq!(rows, vec![ints(&[2, 2, 2]).as_slice(), ints(&[1, 1, 1]).as_slice()]);
}
