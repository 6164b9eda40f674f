//! Constraint validation.
//!
//! After a data merge every touched table is re-checked against its NOT
//! NULL, CHECK and UNIQUE constraints and the foreign keys that reference
//! it. Sessions run the same validator after each statement, so committed
//! data only ever violates a constraint through a merge.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::StoreError;
use crate::row::{Key, Row};
use crate::schema::Tag;
use crate::table::{ForeignKey, TableSet, TableSnapshot};
use crate::value::Value;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    ForeignKey,
    Unique,
    NotNull,
    Check,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ForeignKey => write!(f, "foreign key"),
            Self::Unique => write!(f, "unique index"),
            Self::NotNull => write!(f, "not null"),
            Self::Check => write!(f, "check constraint"),
        }
    }
}

/// A row that fails a constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintViolation {
    pub kind: ViolationKind,
    /// Constraint or column name.
    pub constraint: String,
    pub key: Key,
    pub row: Row,
    /// Offending column values by name.
    pub values: Vec<(String, Value)>,
}

impl ConstraintViolation {
    /// Violations are identified by kind, constraint and key.
    pub fn same_identity(&self, other: &ConstraintViolation) -> bool {
        self.kind == other.kind && self.constraint == other.constraint && self.key == other.key
    }

    pub fn describe(&self, table: &str) -> String {
        let values = self
            .values
            .iter()
            .map(|(n, v)| format!("{n}={v}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "{} violation '{}' in table '{}' at key {} ({})",
            self.kind, self.constraint, table, self.key, values
        )
    }
}

/// Merge `incoming` into `existing`, skipping ones already present.
pub fn union_violations(existing: &mut Vec<ConstraintViolation>, incoming: impl IntoIterator<Item = ConstraintViolation>) {
    for v in incoming {
        if !existing.iter().any(|e| e.same_identity(&v)) {
            existing.push(v);
        }
    }
}

// ---------------------------------------------------------------------------
// Validator
// ---------------------------------------------------------------------------

/// Checks one table of a table set.
pub trait ConstraintValidator: Send + Sync {
    fn validate_table(&self, tables: &TableSet, table: &str) -> Result<Vec<ConstraintViolation>, StoreError>;

    /// Violations carried by the rows of `table` stored under `keys`.
    /// Missing keys are ignored.
    fn validate_rows(
        &self,
        tables: &TableSet,
        table: &str,
        keys: &BTreeSet<Key>,
    ) -> Result<Vec<ConstraintViolation>, StoreError> {
        Ok(self
            .validate_table(tables, table)?
            .into_iter()
            .filter(|v| keys.contains(&v.key))
            .collect())
    }
}

/// Enforces the constraints declared in schemas and foreign keys.
#[derive(Debug, Default, Clone, Copy)]
pub struct SchemaValidator;

impl ConstraintValidator for SchemaValidator {
    fn validate_table(&self, tables: &TableSet, table: &str) -> Result<Vec<ConstraintViolation>, StoreError> {
        let Some(snap) = tables.snapshot(table) else {
            return Ok(Vec::new());
        };
        let schema = &snap.schema;
        let fks = child_foreign_keys(tables, table);
        if !has_row_checks(snap, &fks) {
            return Ok(Vec::new());
        }
        let parents = fks
            .iter()
            .map(|fk| Parent::load(tables, fk))
            .collect::<Result<Vec<_>, _>>()?;

        let mut out = Vec::new();
        let mut unique_groups: Vec<HashMap<Vec<Value>, Vec<(Key, Row)>>> =
            vec![HashMap::new(); schema.uniques().len()];

        for entry in snap.rows.iter() {
            let (key, row) = entry?;
            row_violations(snap, &key, &row, &mut out);
            for (fk, parent) in fks.iter().zip(&parents) {
                out.extend(orphan(snap, fk, parent, &key, &row)?);
            }
            for (idx, uq) in schema.uniques().iter().enumerate() {
                if let Some(vals) = unique_values(snap, &uq.tags, &key, &row) {
                    unique_groups[idx]
                        .entry(vals)
                        .or_default()
                        .push((key.clone(), row.clone()));
                }
            }
        }

        for (uq, groups) in schema.uniques().iter().zip(unique_groups) {
            for (vals, rows) in groups {
                if rows.len() < 2 {
                    continue;
                }
                for (key, row) in rows {
                    out.push(violation(ViolationKind::Unique, &uq.name, &key, &row, named(snap, &uq.tags, &vals)));
                }
            }
        }

        finish(table, out)
    }

    /// Point lookups for the rows themselves and their foreign keys; unique
    /// constraints take one pass over the table, and only when a given row
    /// has a non-null value for them.
    fn validate_rows(
        &self,
        tables: &TableSet,
        table: &str,
        keys: &BTreeSet<Key>,
    ) -> Result<Vec<ConstraintViolation>, StoreError> {
        let Some(snap) = tables.snapshot(table) else {
            return Ok(Vec::new());
        };
        let schema = &snap.schema;
        let fks = child_foreign_keys(tables, table);
        if !has_row_checks(snap, &fks) {
            return Ok(Vec::new());
        }

        let mut rows = Vec::new();
        for key in keys {
            if let Some(row) = snap.rows.get(key)? {
                rows.push((key.clone(), row));
            }
        }
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        for fk in &fks {
            let parent = Parent::load(tables, fk)?;
            for (key, row) in &rows {
                out.extend(orphan(snap, fk, &parent, key, row)?);
            }
        }
        for (key, row) in &rows {
            row_violations(snap, key, row, &mut out);
        }

        for uq in schema.uniques() {
            let wanted: HashMap<Vec<Value>, Vec<&(Key, Row)>> =
                rows.iter().fold(HashMap::new(), |mut acc, entry| {
                    if let Some(vals) = unique_values(snap, &uq.tags, &entry.0, &entry.1) {
                        acc.entry(vals).or_insert_with(Vec::new).push(entry);
                    }
                    acc
                });
            if wanted.is_empty() {
                continue;
            }
            let mut seen: HashMap<&Vec<Value>, usize> = HashMap::new();
            for entry in snap.rows.iter() {
                let (key, row) = entry?;
                if let Some(vals) = unique_values(snap, &uq.tags, &key, &row) {
                    if let Some((group, _)) = wanted.get_key_value(&vals) {
                        *seen.entry(group).or_default() += 1;
                    }
                }
            }
            for (vals, given) in &wanted {
                if seen.get(vals).copied().unwrap_or(0) < 2 {
                    continue;
                }
                for (key, row) in given {
                    out.push(violation(ViolationKind::Unique, &uq.name, key, row, named(snap, &uq.tags, vals)));
                }
            }
        }

        finish(table, out)
    }
}

/// Foreign keys whose child is `table`.
fn child_foreign_keys<'a>(tables: &'a TableSet, table: &str) -> Vec<&'a ForeignKey> {
    tables
        .foreign_keys()
        .iter()
        .filter(|fk| fk.child_table == table)
        .collect()
}

fn has_row_checks(snap: &TableSnapshot, fks: &[&ForeignKey]) -> bool {
    let schema = &snap.schema;
    schema.columns().iter().any(|c| !c.nullable && !c.primary_key)
        || !schema.checks().is_empty()
        || !schema.uniques().is_empty()
        || !fks.is_empty()
}

/// NOT NULL and CHECK failures of one row.
fn row_violations(snap: &TableSnapshot, key: &Key, row: &Row, out: &mut Vec<ConstraintViolation>) {
    for col in snap.schema.columns().iter().filter(|c| !c.nullable && !c.primary_key) {
        if row.get(col.tag).is_null() {
            out.push(violation(ViolationKind::NotNull, &col.name, key, row, vec![(col.name.clone(), Value::Null)]));
        }
    }
    for chk in snap.schema.checks() {
        let v = snap.cell(key, row, chk.tag);
        if !chk.holds(v) {
            let name = column_name(snap, chk.tag);
            out.push(violation(ViolationKind::Check, &chk.name, key, row, vec![(name, v.clone())]));
        }
    }
}

/// The row's values for a unique constraint, `None` when any is null.
fn unique_values(snap: &TableSnapshot, tags: &[Tag], key: &Key, row: &Row) -> Option<Vec<Value>> {
    let vals: Vec<Value> = tags.iter().map(|t| snap.cell(key, row, *t).clone()).collect();
    (!vals.iter().any(|v| v.is_null())).then_some(vals)
}

fn named(snap: &TableSnapshot, tags: &[Tag], vals: &[Value]) -> Vec<(String, Value)> {
    tags.iter()
        .map(|t| column_name(snap, *t))
        .zip(vals.iter().cloned())
        .collect()
}

fn orphan(
    snap: &TableSnapshot,
    fk: &ForeignKey,
    parent: &Parent<'_>,
    key: &Key,
    row: &Row,
) -> Result<Option<ConstraintViolation>, StoreError> {
    let vals: Vec<Value> = fk
        .child_columns
        .iter()
        .map(|t| snap.cell(key, row, *t).clone())
        .collect();
    if vals.iter().any(|v| v.is_null()) || parent.contains(&vals)? {
        return Ok(None);
    }
    let values = named(snap, &fk.child_columns, &vals);
    Ok(Some(violation(ViolationKind::ForeignKey, &fk.name, key, row, values)))
}

fn finish(table: &str, mut out: Vec<ConstraintViolation>) -> Result<Vec<ConstraintViolation>, StoreError> {
    out.sort_by(|a, b| a.key.cmp(&b.key).then_with(|| a.constraint.cmp(&b.constraint)));
    if !out.is_empty() {
        debug!(table, violations = out.len(), "constraint violations found");
    }
    Ok(out)
}

fn violation(kind: ViolationKind, constraint: &str, key: &Key, row: &Row, values: Vec<(String, Value)>) -> ConstraintViolation {
    ConstraintViolation {
        kind,
        constraint: constraint.to_string(),
        key: key.clone(),
        row: row.clone(),
        values,
    }
}

fn column_name(snap: &TableSnapshot, tag: u64) -> String {
    snap.schema
        .column_by_tag(tag)
        .map(|c| c.name.clone())
        .unwrap_or_else(|| tag.to_string())
}

/// Lookup of the value tuples a foreign key's parent table holds.
enum Parent<'a> {
    /// The parent table is gone.
    Missing,
    /// The referenced columns are the parent's primary key.
    ByKey(&'a TableSnapshot),
    Values(HashSet<Vec<Value>>),
}

impl<'a> Parent<'a> {
    fn load(tables: &'a TableSet, fk: &ForeignKey) -> Result<Self, StoreError> {
        let Some(parent) = tables.snapshot(&fk.parent_table) else {
            return Ok(Parent::Missing);
        };
        if !fk.parent_columns.is_empty() && parent.schema.pk_tags() == fk.parent_columns.as_slice() {
            return Ok(Parent::ByKey(parent));
        }
        let mut set = HashSet::new();
        for entry in parent.rows.iter() {
            let (key, row) = entry?;
            set.insert(
                fk.parent_columns
                    .iter()
                    .map(|t| parent.cell(&key, &row, *t).clone())
                    .collect(),
            );
        }
        Ok(Parent::Values(set))
    }

    fn contains(&self, vals: &[Value]) -> Result<bool, StoreError> {
        match self {
            Parent::Missing => Ok(false),
            Parent::ByKey(snap) => snap.rows.contains_key(&Key::new(vals.to_vec())),
            Parent::Values(set) => Ok(set.contains(vals)),
        }
    }
}

/// The tuples of `candidates` that `fk`'s parent no longer holds.
pub fn missing_parent_values(
    tables: &TableSet,
    fk: &ForeignKey,
    candidates: HashSet<Vec<Value>>,
) -> Result<HashSet<Vec<Value>>, StoreError> {
    let parent = Parent::load(tables, fk)?;
    let mut missing = HashSet::new();
    for vals in candidates {
        if !parent.contains(&vals)? {
            missing.insert(vals);
        }
    }
    Ok(missing)
}

/// Keys of `fk`'s child rows that reference one of `values`.
pub fn referencing_keys(
    tables: &TableSet,
    fk: &ForeignKey,
    values: &HashSet<Vec<Value>>,
) -> Result<BTreeSet<Key>, StoreError> {
    let mut keys = BTreeSet::new();
    let Some(child) = tables.snapshot(&fk.child_table) else {
        return Ok(keys);
    };
    for entry in child.rows.iter() {
        let (key, row) = entry?;
        let vals: Vec<Value> = fk
            .child_columns
            .iter()
            .map(|t| child.cell(&key, &row, *t).clone())
            .collect();
        if values.contains(&vals) {
            keys.insert(key);
        }
    }
    Ok(keys)
}
