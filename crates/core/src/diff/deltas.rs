//! Table-level deltas and diff statistics between two table sets.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;

use crate::errors::DiffError;
use crate::prolly::NodeStore;
use crate::table::{TableSet, TableSnapshot};

use super::{DiffType, RowDiff};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TableDeltaKind {
    Added,
    Dropped,
    Modified,
}

/// How one table differs between two table sets.
#[derive(Debug, Clone)]
pub struct TableDelta {
    pub name: String,
    pub kind: TableDeltaKind,
    pub from: Option<TableSnapshot>,
    pub to: Option<TableSnapshot>,
}

impl TableDelta {
    pub fn schema_changed(&self) -> bool {
        match (&self.from, &self.to) {
            (Some(f), Some(t)) => f.schema != t.schema,
            _ => true,
        }
    }

    pub fn data_changed(&self) -> bool {
        match (&self.from, &self.to) {
            (Some(f), Some(t)) => f.rows.root() != t.rows.root(),
            _ => true,
        }
    }

    /// Whether the primary key column set differs between the two sides.
    pub fn key_set_changed(&self) -> bool {
        match (&self.from, &self.to) {
            (Some(f), Some(t)) => !f.schema.same_key_set(&t.schema),
            _ => false,
        }
    }
}

/// Every table that was added, dropped or changed between `from` and `to`,
/// by name.
pub fn table_deltas(from: &TableSet, to: &TableSet) -> Vec<TableDelta> {
    let names: BTreeSet<&str> = from.names().chain(to.names()).collect();
    names
        .into_iter()
        .filter_map(|name| {
            let f = from.snapshot(name);
            let t = to.snapshot(name);
            let kind = match (f, t) {
                (None, Some(_)) => TableDeltaKind::Added,
                (Some(_), None) => TableDeltaKind::Dropped,
                (Some(a), Some(b)) if a.content_hash() != b.content_hash() => TableDeltaKind::Modified,
                _ => return None,
            };
            Some(TableDelta {
                name: name.to_string(),
                kind,
                from: f.cloned(),
                to: t.cloned(),
            })
        })
        .collect()
}

/// Row and cell counts of a table diff.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiffStat {
    pub rows_added: u64,
    pub rows_removed: u64,
    pub rows_modified: u64,
    pub cells_modified: u64,
    pub old_row_count: u64,
    pub new_row_count: u64,
}

pub fn diff_stat(
    table: &str,
    from: Option<&TableSnapshot>,
    to: Option<&TableSnapshot>,
    store: &Arc<dyn NodeStore>,
) -> Result<DiffStat, DiffError> {
    let mut stat = DiffStat {
        old_row_count: from.map(|s| s.len()).transpose()?.unwrap_or(0),
        new_row_count: to.map(|s| s.len()).transpose()?.unwrap_or(0),
        ..DiffStat::default()
    };
    for row in RowDiff::new(table, from, to, store, 1)? {
        let row = row?;
        match row.diff_type {
            DiffType::Added => stat.rows_added += 1,
            DiffType::Removed => stat.rows_removed += 1,
            DiffType::Modified => {
                stat.rows_modified += 1;
                if let (Some(f), Some(t)) = (&row.from, &row.to) {
                    stat.cells_modified += f.iter().zip(t).filter(|(a, b)| a != b).count() as u64;
                }
            }
        }
    }
    Ok(stat)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prolly::MemoryNodeStore;
    use crate::schema::Schema;
    use crate::table::Table;
    use crate::value::{StorageKind, Value};

    #[test]
    fn test_deltas_and_stat() {
        let store: Arc<dyn NodeStore> = Arc::new(MemoryNodeStore::new());
        let schema = Schema::builder("t")
            .key("pk", StorageKind::Int)
            .column("v", StorageKind::Int)
            .build()
            .unwrap();
        let empty = TableSnapshot::empty(schema.clone(), Arc::clone(&store));
        let fill = |snap: &TableSnapshot, rows: &[(i64, i64)]| {
            let edits = rows.iter().map(|(k, v)| {
                let (key, row) = snap.split_row(&[Value::Int(*k), Value::Int(*v)]);
                (key, Some(row))
            });
            snap.with_rows(snap.rows.edit(edits).unwrap())
        };
        let a = fill(&empty, &[(1, 1), (2, 2)]);
        let b = fill(&a, &[(2, 20), (3, 3)]);

        let mut from = TableSet::new();
        from.insert("t", Table::new(a.clone()));
        from.insert("gone", Table::new(empty.clone()));
        let mut to = TableSet::new();
        to.insert("t", Table::new(b.clone()));
        to.insert("new", Table::new(empty));

        let deltas = table_deltas(&from, &to);
        let kinds: Vec<_> = deltas.iter().map(|d| (d.name.as_str(), d.kind)).collect();
        assert_eq!(
            kinds,
            vec![
                ("gone", TableDeltaKind::Dropped),
                ("new", TableDeltaKind::Added),
                ("t", TableDeltaKind::Modified),
            ]
        );
        let t = &deltas[2];
        assert!(t.data_changed());
        assert!(!t.schema_changed());
        assert!(!t.key_set_changed());

        let stat = diff_stat("t", Some(&a), Some(&b), &store).unwrap();
        assert_eq!(stat.rows_added, 1);
        assert_eq!(stat.rows_modified, 1);
        assert_eq!(stat.cells_modified, 1);
        assert_eq!(stat.old_row_count, 2);
        assert_eq!(stat.new_row_count, 3);
    }
}
