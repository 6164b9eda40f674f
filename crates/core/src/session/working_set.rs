//! A session's private copy of the database.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::errors::EditError;
use crate::hash::Hash;
use crate::prolly::OrderedMap;
use crate::row::{Key, Row};
use crate::schema::Schema;
use crate::table::{TableSet, TableSnapshot};
use crate::value::Value;

/// The working root plus the commit it was branched from.
#[derive(Debug, Clone)]
pub struct WorkingSet {
    base: Hash,
    root: TableSet,
    /// Commit merged in by [`Session::merge`](super::Session::merge), recorded
    /// as a second parent on commit.
    pending_merge: Option<Hash>,
}

impl WorkingSet {
    pub fn new(base: Hash, root: TableSet) -> Self {
        Self {
            base,
            root,
            pending_merge: None,
        }
    }

    pub fn base(&self) -> Hash {
        self.base
    }

    pub fn root(&self) -> &TableSet {
        &self.root
    }

    pub fn pending_merge(&self) -> Option<Hash> {
        self.pending_merge
    }

    pub(crate) fn root_mut(&mut self) -> &mut TableSet {
        &mut self.root
    }

    pub(crate) fn set_root(&mut self, root: TableSet) {
        self.root = root;
    }

    pub(crate) fn set_pending_merge(&mut self, merge: Option<Hash>) {
        self.pending_merge = merge;
    }

    /// Start over from `base`, dropping any pending merge.
    pub(crate) fn reset(&mut self, base: Hash, root: TableSet) {
        self.base = base;
        self.root = root;
        self.pending_merge = None;
    }
}

/// Read access to one row by column name, for statement predicates.
pub struct RowView<'a> {
    schema: &'a Schema,
    values: &'a [Value],
}

impl<'a> RowView<'a> {
    pub(crate) fn new(schema: &'a Schema, values: &'a [Value]) -> Self {
        Self { schema, values }
    }

    /// Value of `column`, NULL for unknown names.
    pub fn get(&self, column: &str) -> &Value {
        static NULL: Value = Value::Null;
        self.schema
            .columns()
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(column))
            .and_then(|i| self.values.get(i))
            .unwrap_or(&NULL)
    }

    pub fn values(&self) -> &[Value] {
        self.values
    }
}

// ---------------------------------------------------------------------------
// Statement helpers
// ---------------------------------------------------------------------------

pub(crate) fn snapshot(root: &TableSet, table: &str) -> Result<TableSnapshot, EditError> {
    root.snapshot(table)
        .cloned()
        .ok_or_else(|| EditError::TableNotFound(table.to_string()))
}

/// Check a full row against the schema, coercing values to column kinds.
pub(crate) fn check_values(table: &str, schema: &Schema, values: &[Value]) -> Result<Vec<Value>, EditError> {
    if values.len() != schema.columns().len() {
        return Err(EditError::InvalidValue {
            table: table.to_string(),
            column: "*".into(),
            detail: format!("expected {} values, got {}", schema.columns().len(), values.len()),
        });
    }
    schema
        .columns()
        .iter()
        .zip(values)
        .map(|(col, v)| {
            if v.is_null() {
                if col.primary_key || !col.nullable {
                    return Err(EditError::NullViolation {
                        table: table.to_string(),
                        column: col.name.clone(),
                    });
                }
                return Ok(Value::Null);
            }
            if v.kind() == Some(col.kind) {
                return Ok(v.clone());
            }
            v.coerce(col.kind).map_err(|e| EditError::InvalidValue {
                table: table.to_string(),
                column: col.name.clone(),
                detail: e.to_string(),
            })
        })
        .collect()
}

/// Coerce a caller-supplied key to the table's key column kinds.
pub(crate) fn check_key(table: &str, schema: &Schema, key: Key) -> Result<Key, EditError> {
    let pk: Vec<_> = schema.pk_columns().collect();
    if key.len() != pk.len() {
        return Err(EditError::KeyArity {
            table: table.to_string(),
            expected: pk.len(),
            actual: key.len(),
        });
    }
    let values = pk
        .iter()
        .zip(key.values())
        .map(|(col, v)| {
            if v.kind() == Some(col.kind) || v.is_null() {
                return Ok(v.clone());
            }
            v.coerce(col.kind).map_err(|e| EditError::InvalidValue {
                table: table.to_string(),
                column: col.name.clone(),
                detail: e.to_string(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Key::new(values))
}

/// Apply `column = value` assignments to a full row.
pub(crate) fn assign(table: &str, schema: &Schema, values: &mut [Value], assignments: &[(&str, Value)]) -> Result<(), EditError> {
    for (name, v) in assignments {
        let idx = schema
            .columns()
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| EditError::InvalidValue {
                table: table.to_string(),
                column: name.to_string(),
                detail: "no such column".into(),
            })?;
        values[idx] = v.clone();
    }
    Ok(())
}

/// Re-encode every row of `old` under `schema`, passing each full row
/// through `f`. Keyless copies are folded by content; a keyed table whose
/// new keys collide is rejected.
pub(crate) fn rebuild(
    table: &str,
    old: &TableSnapshot,
    schema: Schema,
    mut f: impl FnMut(Vec<Value>) -> Result<Vec<Value>, EditError>,
) -> Result<TableSnapshot, EditError> {
    let store = Arc::clone(old.rows.store());
    let target = TableSnapshot::empty(schema, Arc::clone(&store));
    let keyless = target.schema.is_keyless();
    let mut entries: BTreeMap<Key, Row> = BTreeMap::new();

    for entry in old.rows.iter() {
        let (key, row) = entry?;
        let copies = if old.schema.is_keyless() { row.cardinality() } else { 1 };
        let values = f(old.join_row(&key, &row))?;
        let values = check_values(table, &target.schema, &values)?;
        let (k, mut r) = target.split_row(&values);
        if keyless {
            let total = entries.get(&k).map(|e| e.cardinality()).unwrap_or(0) + copies;
            r.set_cardinality(total);
        } else if copies > 1 || entries.contains_key(&k) {
            return Err(EditError::DuplicateKey {
                table: table.to_string(),
                key: k.to_string(),
            });
        }
        entries.insert(k, r);
    }
    Ok(target.with_rows(OrderedMap::from_entries(store, entries)))
}
