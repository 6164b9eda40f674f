//! Conflict resolution actions.
//!
//! The [`ConflictResolver`] clears merge artifacts from a working table set,
//! either keeping the merged (ours) data or applying theirs.

use tracing::{debug, info};

use crate::errors::EditError;
use crate::merge::{union_violations, ConstraintValidator};
use crate::row::Key;
use crate::table::TableSet;

/// Named resolution strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Keep the row currently in the working set.
    Ours,
    /// Replace it with theirs, deleting the row when theirs deleted it.
    Theirs,
}

/// Stateless conflict resolution operations over a working table set.
pub struct ConflictResolver;

impl ConflictResolver {
    /// Resolve every data conflict and any schema conflict of `table`.
    /// Returns how many conflicts were cleared.
    ///
    /// Foreign keys touching the table are re-checked afterwards, since
    /// taking theirs can orphan or restore child rows.
    pub fn resolve_table(
        tables: &mut TableSet,
        table: &str,
        resolution: Resolution,
        validator: &dyn ConstraintValidator,
    ) -> Result<usize, EditError> {
        let entry = tables
            .get_mut(table)
            .ok_or_else(|| EditError::TableNotFound(table.to_string()))?;
        if !entry.has_conflicts() {
            return Err(EditError::NoConflicts(table.to_string()));
        }

        let conflicts = std::mem::take(&mut entry.conflicts);
        let schema_conflict = entry.schema_conflict.take();
        let count = conflicts.len() + usize::from(schema_conflict.is_some());

        // A schema conflict decides the whole table: either side may have
        // dropped it, and theirs' rows only make sense under theirs' schema.
        if let Some(sc) = schema_conflict {
            let dropped = match resolution {
                Resolution::Ours => sc.ours.is_none(),
                Resolution::Theirs => sc.theirs_table.is_none(),
            };
            if dropped {
                tables.remove(table);
                info!(table, resolution = ?resolution, "schema conflict resolved by dropping table");
                return Ok(count);
            }
            if let (Resolution::Theirs, Some(theirs)) = (resolution, sc.theirs_table) {
                entry.snapshot = theirs;
                entry.violations.clear();
                debug!(table, "schema conflict resolved with theirs' table");
            }
        } else if resolution == Resolution::Theirs && !conflicts.is_empty() {
            let edits = conflicts.into_iter().map(|c| (c.key, c.theirs));
            let rows = entry.snapshot.rows.edit(edits)?;
            entry.snapshot = entry.snapshot.with_rows(rows);
        }

        Self::revalidate(tables, table, validator)?;
        info!(table, resolution = ?resolution, count, "conflicts resolved");
        Ok(count)
    }

    /// Resolve a single row conflict.
    pub fn resolve_row(
        tables: &mut TableSet,
        table: &str,
        key: &Key,
        resolution: Resolution,
        validator: &dyn ConstraintValidator,
    ) -> Result<(), EditError> {
        let entry = tables
            .get_mut(table)
            .ok_or_else(|| EditError::TableNotFound(table.to_string()))?;
        let pos = entry
            .conflicts
            .iter()
            .position(|c| &c.key == key)
            .ok_or_else(|| EditError::NoConflicts(table.to_string()))?;
        let conflict = entry.conflicts.remove(pos);

        if resolution == Resolution::Theirs {
            let rows = entry.snapshot.rows.edit(vec![(conflict.key, conflict.theirs)])?;
            entry.snapshot = entry.snapshot.with_rows(rows);
        }
        debug!(table, key = %key, resolution = ?resolution, "row conflict resolved");
        Self::revalidate(tables, table, validator)
    }

    /// Drop the constraint violations recorded on `table`.
    pub fn clear_violations(tables: &mut TableSet, table: &str) -> Result<usize, EditError> {
        let entry = tables
            .get_mut(table)
            .ok_or_else(|| EditError::TableNotFound(table.to_string()))?;
        let n = entry.violations.len();
        entry.violations.clear();
        debug!(table, cleared = n, "constraint violations cleared");
        Ok(n)
    }

    /// Re-check the table and the children of its foreign keys, recording
    /// any violation not already present.
    fn revalidate(tables: &mut TableSet, table: &str, validator: &dyn ConstraintValidator) -> Result<(), EditError> {
        let mut targets = vec![table.to_string()];
        for fk in tables.foreign_keys() {
            if fk.parent_table == table && !targets.contains(&fk.child_table) {
                targets.push(fk.child_table.clone());
            }
        }
        for name in targets {
            let found = validator.validate_table(tables, &name)?;
            if let Some(t) = tables.get_mut(&name) {
                union_violations(&mut t.violations, found);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::conflict::{ConflictDetector, ConflictType};
    use crate::merge::SchemaValidator;
    use crate::prolly::{MemoryNodeStore, NodeStore};
    use crate::schema::Schema;
    use crate::table::{SchemaConflict, Table, TableSnapshot};
    use crate::value::{StorageKind, Value};

    fn conflicted() -> TableSet {
        let store: Arc<dyn NodeStore> = Arc::new(MemoryNodeStore::new());
        let schema = Schema::builder("t")
            .key("pk", StorageKind::Int)
            .column("c", StorageKind::Int)
            .build()
            .unwrap();
        let snap = TableSnapshot::empty(schema, store);
        let (k1, ours1) = snap.split_row(&[Value::Int(1), Value::Int(3)]);
        let (_, theirs1) = snap.split_row(&[Value::Int(1), Value::Int(4)]);
        let (k2, ours2) = snap.split_row(&[Value::Int(2), Value::Int(5)]);
        let rows = snap
            .rows
            .edit(vec![(k1.clone(), Some(ours1.clone())), (k2.clone(), Some(ours2.clone()))])
            .unwrap();
        let mut table = Table::new(snap.with_rows(rows));
        table.conflicts.push(ConflictDetector::conflict(
            "t",
            k1,
            ConflictType::Content,
            vec![],
            None,
            Some(ours1),
            Some(theirs1),
        ));
        table.conflicts.push(ConflictDetector::conflict(
            "t",
            k2,
            ConflictType::ModifyDelete,
            vec![],
            None,
            Some(ours2),
            None,
        ));
        let mut set = TableSet::new();
        set.insert("t", table);
        set
    }

    #[test]
    fn test_resolve_theirs_applies_rows() {
        let mut set = conflicted();
        let n = ConflictResolver::resolve_table(&mut set, "t", Resolution::Theirs, &SchemaValidator).unwrap();
        assert_eq!(n, 2);
        let t = set.get("t").unwrap();
        assert!(!t.has_conflicts());
        assert_eq!(t.snapshot.scan().unwrap(), vec![vec![Value::Int(1), Value::Int(4)]]);
    }

    #[test]
    fn test_resolve_ours_keeps_rows() {
        let mut set = conflicted();
        ConflictResolver::resolve_table(&mut set, "t", Resolution::Ours, &SchemaValidator).unwrap();
        let t = set.get("t").unwrap();
        assert_eq!(t.snapshot.len().unwrap(), 2);
        assert!(matches!(
            ConflictResolver::resolve_table(&mut set, "t", Resolution::Ours, &SchemaValidator),
            Err(EditError::NoConflicts(_))
        ));
    }

    #[test]
    fn test_resolve_single_row() {
        let mut set = conflicted();
        ConflictResolver::resolve_row(&mut set, "t", &Key::from(1), Resolution::Theirs, &SchemaValidator).unwrap();
        let t = set.get("t").unwrap();
        assert_eq!(t.conflicts.len(), 1);
        assert_eq!(t.conflicts[0].key, Key::from(2));
    }

    #[test]
    fn test_ours_honours_table_drop() {
        let mut set = conflicted();
        let t = set.get_mut("t").unwrap();
        t.conflicts.clear();
        t.schema_conflict = Some(SchemaConflict::new(
            None,
            Some(&t.snapshot),
            "table was deleted in ours and modified in theirs",
        ));
        ConflictResolver::resolve_table(&mut set, "t", Resolution::Ours, &SchemaValidator).unwrap();
        assert!(!set.contains("t"));
    }

    #[test]
    fn test_theirs_honours_table_drop() {
        let mut set = conflicted();
        let t = set.get_mut("t").unwrap();
        t.schema_conflict = Some(SchemaConflict::new(
            Some(&t.snapshot),
            None,
            "table was modified in ours and deleted in theirs",
        ));
        let n = ConflictResolver::resolve_table(&mut set, "t", Resolution::Theirs, &SchemaValidator).unwrap();
        assert_eq!(n, 3);
        assert!(!set.contains("t"));
    }

    #[test]
    fn test_theirs_replaces_table_on_schema_conflict() {
        let mut set = conflicted();
        let t = set.get_mut("t").unwrap();
        let schema = Schema::builder("t")
            .key("pk", StorageKind::Int)
            .column("label", StorageKind::String)
            .build()
            .unwrap();
        let empty = TableSnapshot::empty(schema, Arc::clone(t.snapshot.rows.store()));
        let (k, r) = empty.split_row(&[Value::Int(7), Value::from("seven")]);
        let theirs = empty.with_rows(empty.rows.edit(vec![(k, Some(r))]).unwrap());
        t.schema_conflict = Some(SchemaConflict::new(
            Some(&t.snapshot),
            Some(&theirs),
            "table was added on both sides with different schemas",
        ));

        ConflictResolver::resolve_table(&mut set, "t", Resolution::Theirs, &SchemaValidator).unwrap();
        let t = set.get("t").unwrap();
        assert!(!t.has_conflicts());
        assert_eq!(t.snapshot.schema, theirs.schema);
        assert_eq!(t.snapshot.scan().unwrap(), vec![vec![Value::Int(7), Value::from("seven")]]);
    }
}
