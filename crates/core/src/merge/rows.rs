//! Row-level three-way merge of one table.
//!
//! The base→ours and base→theirs changes are computed with the map diff and
//! joined by key. Keys changed on one side only take that side's row; keys
//! changed on both sides go through the [`ConflictDetector`]. The merged map
//! is ours with theirs' changes applied, so the cost is proportional to the
//! size of the two change sets.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use tracing::debug;

use crate::conflict::{Conflict, ConflictDetector, RowMerge};
use crate::diff::DiffWarnings;
use crate::errors::StoreError;
use crate::prolly::{MapDiffEntry, OrderedMap};
use crate::row::{Key, Row};
use crate::schema::{Schema, KEYLESS_CARDINALITY_TAG};
use crate::table::{keyless_key, TableSnapshot};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RowMergeCounts {
    pub added: u64,
    pub modified: u64,
    pub deleted: u64,
}

pub(crate) struct RowMergeOutput {
    pub rows: OrderedMap,
    pub conflicts: Vec<Conflict>,
    pub counts: RowMergeCounts,
}

/// Rewrite a row into the merged schema: drop cells of columns that no
/// longer exist and coerce cells whose column changed kind.
pub(crate) fn normalize(row: &Row, schema: &Schema, warnings: &mut DiffWarnings) -> Row {
    let mut out = Row::new();
    for (tag, value) in row.iter() {
        if tag == KEYLESS_CARDINALITY_TAG {
            out.set(tag, value.clone());
            continue;
        }
        let Some(col) = schema.column_by_tag(tag) else {
            continue;
        };
        if col.primary_key {
            continue;
        }
        match value.kind() {
            Some(kind) if kind != col.kind => match value.coerce(col.kind) {
                Ok(v) => out.set(tag, v),
                Err(_) => warnings.coercion(&col.name, kind, col.kind),
            },
            _ => out.set(tag, value.clone()),
        }
    }
    out
}

fn collect(diff: impl Iterator<Item = Result<MapDiffEntry, StoreError>>) -> Result<Vec<MapDiffEntry>, StoreError> {
    diff.collect()
}

pub(crate) fn merge_rows(
    table: &str,
    base: &TableSnapshot,
    ours: &TableSnapshot,
    theirs: &TableSnapshot,
    merged: &Schema,
    warnings: &mut DiffWarnings,
) -> Result<RowMergeOutput, StoreError> {
    let ours_changes = collect(base.rows.diff(&ours.rows))?;
    let theirs_changes = collect(base.rows.diff(&theirs.rows))?;
    let keyless = merged.is_keyless();

    debug!(
        table,
        ours_changes = ours_changes.len(),
        theirs_changes = theirs_changes.len(),
        "merging rows"
    );

    let mut edits: BTreeMap<Key, Option<Row>> = BTreeMap::new();
    let mut conflicts = Vec::new();
    let mut counts = RowMergeCounts::default();

    let norm = |row: &Option<Row>, w: &mut DiffWarnings| row.as_ref().map(|r| normalize(r, merged, w));

    let mut oi = ours_changes.into_iter().peekable();
    let mut ti = theirs_changes.into_iter().peekable();
    loop {
        let order = match (oi.peek(), ti.peek()) {
            (None, None) => break,
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some(o), Some(t)) => o.key.cmp(&t.key),
        };
        match order {
            Ordering::Less => {
                let Some(o) = oi.next() else { break };
                let normalized = norm(&o.to, warnings);
                if normalized != o.to {
                    edits.insert(o.key, normalized);
                }
            }
            Ordering::Greater => {
                let Some(t) = ti.next() else { break };
                let normalized = norm(&t.to, warnings);
                match (&t.from, &normalized) {
                    (None, Some(_)) => counts.added += 1,
                    (Some(_), None) => counts.deleted += 1,
                    _ => counts.modified += 1,
                }
                edits.insert(t.key, normalized);
            }
            Ordering::Equal => {
                let (Some(o), Some(t)) = (oi.next(), ti.next()) else { break };
                let b = norm(&o.from, warnings);
                let ov = norm(&o.to, warnings);
                let tv = norm(&t.to, warnings);
                match ConflictDetector::merge_row(b.as_ref(), ov.as_ref(), tv.as_ref(), keyless) {
                    RowMerge::Merged(value) => {
                        if value != o.to {
                            match (&o.to, &value) {
                                (None, Some(_)) => counts.added += 1,
                                (Some(_), None) => counts.deleted += 1,
                                _ => counts.modified += 1,
                            }
                            edits.insert(o.key, value);
                        }
                    }
                    RowMerge::Conflict {
                        conflict_type,
                        columns,
                    } => {
                        if ov != o.to {
                            edits.insert(o.key.clone(), ov.clone());
                        }
                        conflicts.push(ConflictDetector::conflict(table, o.key, conflict_type, columns, b, ov, tv));
                    }
                }
            }
        }
    }

    let mut rows = ours.rows.edit(edits)?;
    if keyless && ours.schema != *merged {
        rows = rekey_keyless(&rows, merged, warnings)?;
    }

    Ok(RowMergeOutput {
        rows,
        conflicts,
        counts,
    })
}

/// Recompute content keys of a keyless table after its schema changed,
/// folding rows that became identical into one entry.
pub(crate) fn rekey_keyless(rows: &OrderedMap, schema: &Schema, warnings: &mut DiffWarnings) -> Result<OrderedMap, StoreError> {
    let mut out: BTreeMap<Key, Row> = BTreeMap::new();
    for entry in rows.iter() {
        let (_, row) = entry?;
        let count = row.cardinality();
        let normalized = normalize(&row, schema, warnings).without_cardinality();
        let key = keyless_key(&normalized);
        let slot = out.entry(key).or_insert_with(|| {
            let mut r = normalized.clone();
            r.set_cardinality(0);
            r
        });
        let total = slot.cardinality() + count;
        slot.set_cardinality(total);
    }
    Ok(OrderedMap::from_entries(std::sync::Arc::clone(rows.store()), out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::conflict::ConflictType;
    use crate::prolly::{MemoryNodeStore, NodeStore};
    use crate::value::{StorageKind, Value};

    fn schema() -> Schema {
        Schema::builder("t")
            .key("pk", StorageKind::Int)
            .column("a", StorageKind::Int)
            .column("b", StorageKind::Int)
            .build()
            .unwrap()
    }

    fn put(snap: &TableSnapshot, rows: &[(i64, i64, i64)]) -> TableSnapshot {
        let edits = rows.iter().map(|(k, a, b)| {
            let (key, row) = snap.split_row(&[Value::Int(*k), Value::Int(*a), Value::Int(*b)]);
            (key, Some(row))
        });
        snap.with_rows(snap.rows.edit(edits).unwrap())
    }

    fn del(snap: &TableSnapshot, k: i64) -> TableSnapshot {
        snap.with_rows(snap.rows.edit(vec![(Key::from(k), None)]).unwrap())
    }

    #[test]
    fn test_disjoint_and_overlapping_changes() {
        let store: Arc<dyn NodeStore> = Arc::new(MemoryNodeStore::new());
        let empty = TableSnapshot::empty(schema(), store);
        let base = put(&empty, &[(1, 1, 1), (2, 2, 2), (3, 3, 3), (4, 4, 4)]);
        let ours = del(&put(&base, &[(1, 10, 1), (3, 30, 3), (5, 5, 5)]), 4);
        let theirs = put(&base, &[(1, 1, 11), (2, 20, 2), (3, 31, 3), (4, 40, 4)]);

        let mut w = DiffWarnings::new(4);
        let out = merge_rows("t", &base, &ours, &theirs, &base.schema, &mut w).unwrap();
        let merged = base.with_rows(out.rows);
        let all = merged.scan().unwrap();

        // pk 1 merges cell-wise, pk 2 takes theirs, pk 3 conflicts and keeps
        // ours, pk 4 is modify/delete and stays deleted, pk 5 is ours' insert.
        assert_eq!(
            all,
            vec![
                vec![Value::Int(1), Value::Int(10), Value::Int(11)],
                vec![Value::Int(2), Value::Int(20), Value::Int(2)],
                vec![Value::Int(3), Value::Int(30), Value::Int(3)],
                vec![Value::Int(5), Value::Int(5), Value::Int(5)],
            ]
        );
        let kinds: Vec<_> = out.conflicts.iter().map(|c| (c.key.clone(), c.conflict_type)).collect();
        assert_eq!(
            kinds,
            vec![
                (Key::from(3), ConflictType::Content),
                (Key::from(4), ConflictType::ModifyDelete),
            ]
        );
        assert_eq!(out.counts.modified, 2);
    }

    #[test]
    fn test_normalize_drops_and_coerces() {
        let mut merged = schema();
        let a = merged.tag_of("a").unwrap();
        let b = merged.tag_of("b").unwrap();
        merged.drop_column("b").unwrap();
        merged.modify_column_kind("a", StorageKind::String).unwrap();
        let mut w = DiffWarnings::new(4);
        let row = Row::new().with(a, 5).with(b, 6);
        let out = normalize(&row, &merged, &mut w);
        assert_eq!(out, Row::new().with(a, "5"));
        assert!(w.is_empty());
    }
}
