//! Table snapshots and the root table set.
//!
//! A [`TableSnapshot`] pairs a schema with the ordered map holding its rows.
//! The [`TableSet`] is the root value of a commit or working set: every
//! table by name, together with the merge artifacts (conflicts, constraint
//! violations, schema conflicts) recorded against it and the foreign keys
//! that span tables.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::conflict::Conflict;
use crate::errors::StoreError;
use crate::hash::{ContentHasher, Hash};
use crate::merge::ConstraintViolation;
use crate::prolly::{NodeStore, OrderedMap};
use crate::row::{Key, Row};
use crate::schema::{Schema, Tag};
use crate::value::Value;

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// A schema plus the rows stored under it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSnapshot {
    pub schema: Schema,
    pub rows: OrderedMap,
}

impl TableSnapshot {
    pub fn new(schema: Schema, rows: OrderedMap) -> Self {
        Self { schema, rows }
    }

    pub fn empty(schema: Schema, store: Arc<dyn NodeStore>) -> Self {
        Self {
            schema,
            rows: OrderedMap::empty(store),
        }
    }

    pub fn with_rows(&self, rows: OrderedMap) -> Self {
        Self {
            schema: self.schema.clone(),
            rows,
        }
    }

    pub fn content_hash(&self) -> Hash {
        let mut h = ContentHasher::with_domain("table");
        h.write_hash(&self.schema.content_hash());
        h.write_hash(&self.rows.root());
        h.finish()
    }

    /// Number of stored entries. Keyless duplicates count once.
    pub fn len(&self) -> Result<u64, StoreError> {
        self.rows.len()
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        self.rows.is_empty()
    }

    /// Build the stored key for a full row given in schema column order.
    pub fn split_row(&self, values: &[Value]) -> (Key, Row) {
        let mut key = Vec::with_capacity(self.schema.pk_tags().len());
        let mut row = Row::new();
        for tag in self.schema.pk_tags() {
            let idx = self.schema.columns().iter().position(|c| c.tag == *tag);
            key.push(idx.and_then(|i| values.get(i)).cloned().unwrap_or(Value::Null));
        }
        for (col, v) in self.schema.columns().iter().zip(values) {
            if !col.primary_key {
                row.set(col.tag, v.clone());
            }
        }
        if self.schema.is_keyless() {
            return (keyless_key(&row), row);
        }
        (Key::new(key), row)
    }

    /// Full row in schema column order.
    pub fn join_row(&self, key: &Key, row: &Row) -> Vec<Value> {
        self.schema
            .columns()
            .iter()
            .map(|c| match self.schema.pk_position(c.tag) {
                Some(i) => key.values().get(i).cloned().unwrap_or(Value::Null),
                None => row.get(c.tag).clone(),
            })
            .collect()
    }

    /// Value of `tag` in a stored entry, looking in the key for key columns.
    pub fn cell<'a>(&self, key: &'a Key, row: &'a Row, tag: Tag) -> &'a Value {
        static NULL: Value = Value::Null;
        match self.schema.pk_position(tag) {
            Some(i) => key.values().get(i).unwrap_or(&NULL),
            None => row.get(tag),
        }
    }

    /// Every row in schema column order, keyless duplicates expanded.
    pub fn scan(&self) -> Result<Vec<Vec<Value>>, StoreError> {
        let mut out = Vec::new();
        for entry in self.rows.iter() {
            let (key, row) = entry?;
            let copies = if self.schema.is_keyless() { row.cardinality() } else { 1 };
            let full = self.join_row(&key, &row);
            for _ in 0..copies {
                out.push(full.clone());
            }
        }
        Ok(out)
    }
}

/// The synthesized key of a keyless row: the hash of its cells.
pub fn keyless_key(row: &Row) -> Key {
    Key::new(vec![Value::Binary(row.keyless_hash().as_bytes().to_vec())])
}

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

/// A table whose schemas could not be merged. The stored snapshot is the
/// one the merge kept; both sides are recorded for resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaConflict {
    pub ours: Option<Schema>,
    pub theirs: Option<Schema>,
    /// Theirs' table as of the merge, `None` when theirs dropped it.
    #[serde(skip)]
    pub theirs_table: Option<TableSnapshot>,
    pub description: String,
}

impl SchemaConflict {
    pub fn new(ours: Option<&TableSnapshot>, theirs: Option<&TableSnapshot>, description: impl Into<String>) -> Self {
        Self {
            ours: ours.map(|s| s.schema.clone()),
            theirs: theirs.map(|s| s.schema.clone()),
            theirs_table: theirs.cloned(),
            description: description.into(),
        }
    }
}

/// A foreign key from `child_table(child_columns)` to
/// `parent_table(parent_columns)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub name: String,
    pub child_table: String,
    pub child_columns: Vec<Tag>,
    pub parent_table: String,
    pub parent_columns: Vec<Tag>,
}

/// A table in a table set: its snapshot plus unresolved merge artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub snapshot: TableSnapshot,
    pub conflicts: Vec<Conflict>,
    pub violations: Vec<ConstraintViolation>,
    pub schema_conflict: Option<SchemaConflict>,
}

impl Table {
    pub fn new(snapshot: TableSnapshot) -> Self {
        Self {
            snapshot,
            conflicts: Vec::new(),
            violations: Vec::new(),
            schema_conflict: None,
        }
    }

    /// Conflicts of either kind, data or schema.
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty() || self.schema_conflict.is_some()
    }

    pub fn has_violations(&self) -> bool {
        !self.violations.is_empty()
    }

    pub fn has_artifacts(&self) -> bool {
        self.has_conflicts() || self.has_violations()
    }

    fn artifact_hash(&self, h: &mut ContentHasher) {
        // Artifacts are plain data; serialization cannot fail.
        let bytes = serde_json::to_vec(&(&self.conflicts, &self.violations, &self.schema_conflict))
            .unwrap_or_default();
        h.write_bytes(&bytes);
        if let Some(theirs) = self.schema_conflict.as_ref().and_then(|sc| sc.theirs_table.as_ref()) {
            h.write_hash(&theirs.content_hash());
        }
    }
}

// ---------------------------------------------------------------------------
// Table set
// ---------------------------------------------------------------------------

/// The root value of a commit: all tables by name.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TableSet {
    tables: BTreeMap<String, Table>,
    foreign_keys: Vec<ForeignKey>,
}

impl TableSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Table> {
        self.tables.get_mut(name)
    }

    pub fn snapshot(&self, name: &str) -> Option<&TableSnapshot> {
        self.tables.get(name).map(|t| &t.snapshot)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, table: Table) {
        self.tables.insert(name.into(), table);
    }

    /// Replace a table's snapshot, keeping its artifacts.
    pub fn put_snapshot(&mut self, name: &str, snapshot: TableSnapshot) {
        match self.tables.get_mut(name) {
            Some(t) => t.snapshot = snapshot,
            None => {
                self.tables.insert(name.to_string(), Table::new(snapshot));
            }
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<Table> {
        self.foreign_keys
            .retain(|fk| fk.child_table != name && fk.parent_table != name);
        self.tables.remove(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(|s| s.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Table)> {
        self.tables.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn foreign_keys(&self) -> &[ForeignKey] {
        &self.foreign_keys
    }

    pub fn set_foreign_keys(&mut self, fks: Vec<ForeignKey>) {
        self.foreign_keys = fks;
    }

    pub fn add_foreign_key(&mut self, fk: ForeignKey) {
        self.foreign_keys.retain(|f| f.name != fk.name);
        self.foreign_keys.push(fk);
    }

    /// Tables with data or schema conflicts, sorted by name.
    pub fn tables_with_conflicts(&self) -> Vec<String> {
        self.tables
            .iter()
            .filter(|(_, t)| t.has_conflicts())
            .map(|(n, _)| n.clone())
            .collect()
    }

    pub fn tables_with_violations(&self) -> Vec<String> {
        self.tables
            .iter()
            .filter(|(_, t)| t.has_violations())
            .map(|(n, _)| n.clone())
            .collect()
    }

    pub fn has_artifacts(&self) -> bool {
        self.tables.values().any(|t| t.has_artifacts())
    }

    /// Hash of the data alone, ignoring artifacts.
    pub fn data_hash(&self) -> Hash {
        let mut h = ContentHasher::with_domain("table-set-data");
        h.write_u64(self.tables.len() as u64);
        for (name, t) in &self.tables {
            h.write_str(name);
            h.write_hash(&t.snapshot.content_hash());
        }
        h.finish()
    }

    /// Hash of everything, artifacts and foreign keys included.
    pub fn content_hash(&self) -> Hash {
        let mut h = ContentHasher::with_domain("table-set");
        h.write_hash(&self.data_hash());
        for t in self.tables.values() {
            t.artifact_hash(&mut h);
        }
        let fks = serde_json::to_vec(&self.foreign_keys).unwrap_or_default();
        h.write_bytes(&fks);
        h.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prolly::MemoryNodeStore;
    use crate::value::StorageKind;

    fn schema() -> Schema {
        Schema::builder("t")
            .key("pk", StorageKind::Int)
            .column("c1", StorageKind::Int)
            .column("c2", StorageKind::Int)
            .build()
            .unwrap()
    }

    #[test]
    fn test_split_and_join_row() {
        let snap = TableSnapshot::empty(schema(), Arc::new(MemoryNodeStore::new()));
        let values = vec![Value::Int(1), Value::Int(2), Value::Null];
        let (key, row) = snap.split_row(&values);
        assert_eq!(key, Key::from(1));
        assert_eq!(row.iter().count(), 1);
        assert_eq!(snap.join_row(&key, &row), values);
    }

    #[test]
    fn test_keyless_split_uses_row_hash() {
        let s = Schema::builder("k")
            .column("a", StorageKind::Int)
            .build()
            .unwrap();
        let snap = TableSnapshot::empty(s, Arc::new(MemoryNodeStore::new()));
        let (k1, _) = snap.split_row(&[Value::Int(1)]);
        let (k2, _) = snap.split_row(&[Value::Int(1)]);
        let (k3, _) = snap.split_row(&[Value::Int(2)]);
        assert_eq!(k1, k2);
        assert_ne!(k1, k3);
    }

    #[test]
    fn test_hash_tracks_artifacts() {
        let store: Arc<dyn NodeStore> = Arc::new(MemoryNodeStore::new());
        let mut set = TableSet::new();
        set.insert("t", Table::new(TableSnapshot::empty(schema(), store)));
        let data = set.data_hash();
        let full = set.content_hash();

        set.get_mut("t").unwrap().schema_conflict = Some(SchemaConflict::new(None, None, "x"));
        assert_eq!(set.data_hash(), data);
        assert_ne!(set.content_hash(), full);
        assert_eq!(set.tables_with_conflicts(), vec!["t".to_string()]);
    }
}
