//! Sessions: a private working set over one branch.
//!
//! Each statement (insert, update, DDL, ...) is applied to the working set
//! immediately and then checked against the table's constraints; a
//! statement that would introduce a new violation is undone and rejected.
//! Nothing is visible to other sessions until [`Session::commit`] succeeds.

pub mod working_set;

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::conflict::{Conflict, ConflictResolver, Resolution};
use crate::diff::RowDiff;
use crate::errors::{DiffError, EditError, MergeError, SchemaError, StoreError, TransactionError};
use crate::hash::Hash;
use crate::history::History;
use crate::merge::{missing_parent_values, referencing_keys, ConstraintViolation, MergeResult, ViolationKind};
use crate::prolly::NodeStore;
use crate::repository::{Repository, RevSpec};
use crate::row::{Key, Row};
use crate::schema::{CheckOp, Schema, Tag};
use crate::table::{ForeignKey, Table, TableSet, TableSnapshot};
use crate::transaction::{self, CommitOptions, CommitResult};
use crate::value::{StorageKind, Value};

pub use working_set::{RowView, WorkingSet};

use working_set::{assign, check_key, check_values, rebuild, snapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Committed,
    /// The last commit hit conflicts; the working set is untouched.
    ConflictBlocked,
    /// The last commit was refused and the working set reset to the tip.
    Aborted,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Committed => write!(f, "committed"),
            Self::ConflictBlocked => write!(f, "conflict_blocked"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

pub struct Session {
    pub(crate) id: Uuid,
    pub(crate) repo: Arc<Repository>,
    pub(crate) branch: String,
    pub(crate) working: WorkingSet,
    pub(crate) state: SessionState,
    pub(crate) savepoints: Vec<(String, WorkingSet)>,
}

impl Session {
    pub(crate) fn new(repo: Arc<Repository>, branch: &str, base: Hash, root: TableSet) -> Self {
        let id = Uuid::new_v4();
        info!(session = %id, branch, base = %base.short(), "session opened");
        Self {
            id,
            repo,
            branch: branch.to_string(),
            working: WorkingSet::new(base, root),
            state: SessionState::Active,
            savepoints: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The commit this session's working set started from.
    pub fn base(&self) -> Hash {
        self.working.base()
    }

    pub fn working(&self) -> &WorkingSet {
        &self.working
    }

    pub fn repository(&self) -> &Arc<Repository> {
        &self.repo
    }

    /// Whether the working set differs from its base commit.
    pub fn is_dirty(&self) -> Result<bool, TransactionError> {
        let base = self.repo.graph().get(&self.working.base())?;
        Ok(base.root().content_hash() != self.working.root().content_hash() || self.working.pending_merge().is_some())
    }

    pub fn table_names(&self) -> Vec<String> {
        self.working.root().names().map(str::to_string).collect()
    }

    pub fn schema(&self, table: &str) -> Result<&Schema, EditError> {
        self.working
            .root()
            .snapshot(table)
            .map(|s| &s.schema)
            .ok_or_else(|| EditError::TableNotFound(table.to_string()))
    }

    /// Any edit moves a finished or blocked session back to active.
    fn touch(&mut self) {
        if self.state != SessionState::Active {
            debug!(session = %self.id, from = %self.state, "session active again");
            self.state = SessionState::Active;
        }
    }

    /// Run one statement. On failure, or when the statement leaves a new
    /// constraint violation behind, the working set is restored.
    fn statement<T>(
        &mut self,
        table: &str,
        f: impl FnOnce(&mut TableSet, &Arc<dyn NodeStore>) -> Result<T, EditError>,
    ) -> Result<T, EditError> {
        self.touch();
        let before = self.working.root().clone();
        let store = Arc::clone(self.repo.node_store());
        let result = match f(self.working.root_mut(), &store) {
            Ok(v) => self.enforce(table, &before).map(|_| v),
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            debug!(session = %self.id, table, error = %e, "statement rejected");
            self.working.set_root(before);
        }
        result
    }

    fn enforce(&self, table: &str, before: &TableSet) -> Result<(), EditError> {
        let root = self.working.root();
        let validator = self.repo.validator();

        for (name, scope) in statement_scope(table, before, root)? {
            let check = |tables: &TableSet| match &scope {
                Scope::Table => validator.validate_table(tables, &name),
                Scope::Rows(keys) => validator.validate_rows(tables, &name, keys),
            };
            let recorded: &[ConstraintViolation] = root.get(&name).map(|t| t.violations.as_slice()).unwrap_or(&[]);
            let fresh: Vec<ConstraintViolation> = check(root)?
                .into_iter()
                .filter(|v| !recorded.iter().any(|r| r.same_identity(v)))
                .collect();
            if fresh.is_empty() {
                continue;
            }
            // Data that already violated before this statement is not its fault.
            let prior = check(before)?;
            if let Some(v) = fresh.into_iter().find(|v| !prior.iter().any(|p| p.same_identity(v))) {
                return Err(match v.kind {
                    ViolationKind::NotNull => EditError::NullViolation {
                        table: name,
                        column: v.constraint,
                    },
                    _ => EditError::ConstraintViolation {
                        detail: v.describe(&name),
                        table: name,
                        constraint: v.constraint,
                    },
                });
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // DDL
    // -----------------------------------------------------------------------

    pub fn create_table(&mut self, name: &str, schema: Schema) -> Result<(), EditError> {
        self.statement(name, |root, store| {
            if root.contains(name) {
                return Err(EditError::TableExists(name.to_string()));
            }
            root.insert(name, Table::new(TableSnapshot::empty(schema, Arc::clone(store))));
            info!(table = name, "table created");
            Ok(())
        })
    }

    pub fn drop_table(&mut self, name: &str) -> Result<(), EditError> {
        self.statement(name, |root, _| {
            root.remove(name)
                .map(|_| info!(table = name, "table dropped"))
                .ok_or_else(|| EditError::TableNotFound(name.to_string()))
        })
    }

    /// Add a column, writing `default` into existing rows. Returns its tag.
    pub fn add_column(
        &mut self,
        table: &str,
        name: &str,
        kind: StorageKind,
        nullable: bool,
        default: Option<Value>,
    ) -> Result<Tag, EditError> {
        self.statement(table, |root, _| {
            let snap = snapshot(root, table)?;
            let default = match default {
                Some(d) => Some(d.coerce(kind).map_err(|e| EditError::InvalidValue {
                    table: table.to_string(),
                    column: name.to_string(),
                    detail: e.to_string(),
                })?),
                None => None,
            };
            let mut schema = snap.schema.clone();
            let tag = schema.add_column(table, name, kind, nullable, default.clone())?;
            let fill = default.unwrap_or(Value::Null);
            let rebuilt = rebuild(table, &snap, schema, |mut values| {
                values.push(fill.clone());
                Ok(values)
            })?;
            root.put_snapshot(table, rebuilt);
            Ok(tag)
        })
    }

    pub fn drop_column(&mut self, table: &str, name: &str) -> Result<(), EditError> {
        self.statement(table, |root, _| {
            let snap = snapshot(root, table)?;
            let idx = snap
                .schema
                .columns()
                .iter()
                .position(|c| c.name.eq_ignore_ascii_case(name))
                .ok_or_else(|| SchemaError::ColumnNotFound(name.to_string()))?;
            let mut schema = snap.schema.clone();
            let dropped = schema.drop_column(name)?;
            let rebuilt = rebuild(table, &snap, schema, |mut values| {
                values.remove(idx);
                Ok(values)
            })?;
            root.put_snapshot(table, rebuilt);

            let fks = root
                .foreign_keys()
                .iter()
                .filter(|fk| {
                    !(fk.child_table == table && fk.child_columns.contains(&dropped.tag))
                        && !(fk.parent_table == table && fk.parent_columns.contains(&dropped.tag))
                })
                .cloned()
                .collect();
            root.set_foreign_keys(fks);
            Ok(())
        })
    }

    pub fn rename_column(&mut self, table: &str, from: &str, to: &str) -> Result<(), EditError> {
        self.statement(table, |root, _| {
            let mut snap = snapshot(root, table)?;
            snap.schema.rename_column(from, to)?;
            root.put_snapshot(table, snap);
            Ok(())
        })
    }

    /// Change a column's storage kind, converting every stored value.
    pub fn modify_column(&mut self, table: &str, name: &str, kind: StorageKind) -> Result<(), EditError> {
        self.statement(table, |root, _| {
            let snap = snapshot(root, table)?;
            let mut schema = snap.schema.clone();
            schema.modify_column_kind(name, kind)?;
            // check_values inside rebuild performs the conversion.
            let rebuilt = rebuild(table, &snap, schema, Ok)?;
            root.put_snapshot(table, rebuilt);
            Ok(())
        })
    }

    /// Replace the primary key, re-keying every row. An empty column list
    /// makes the table keyless.
    pub fn set_primary_key(&mut self, table: &str, columns: &[&str]) -> Result<(), EditError> {
        self.statement(table, |root, _| {
            let snap = snapshot(root, table)?;
            let mut schema = snap.schema.clone();
            schema.set_primary_key(columns)?;
            let rebuilt = rebuild(table, &snap, schema, Ok)?;
            root.put_snapshot(table, rebuilt);
            Ok(())
        })
    }

    pub fn add_unique(&mut self, table: &str, name: &str, columns: &[&str]) -> Result<(), EditError> {
        self.statement(table, |root, _| {
            let mut snap = snapshot(root, table)?;
            snap.schema.add_unique(name, columns)?;
            root.put_snapshot(table, snap);
            Ok(())
        })
    }

    pub fn add_check(&mut self, table: &str, name: &str, column: &str, op: CheckOp, value: impl Into<Value>) -> Result<(), EditError> {
        let value = value.into();
        self.statement(table, |root, _| {
            let mut snap = snapshot(root, table)?;
            snap.schema.add_check(name, column, op, value)?;
            root.put_snapshot(table, snap);
            Ok(())
        })
    }

    /// Declare `child(child_columns)` as referencing `parent(parent_columns)`.
    pub fn add_foreign_key(
        &mut self,
        name: &str,
        child: &str,
        child_columns: &[&str],
        parent: &str,
        parent_columns: &[&str],
    ) -> Result<(), EditError> {
        self.statement(child, |root, _| {
            let tags = |table: &str, cols: &[&str]| -> Result<Vec<Tag>, EditError> {
                let snap = root
                    .snapshot(table)
                    .ok_or_else(|| EditError::TableNotFound(table.to_string()))?;
                cols.iter()
                    .map(|c| snap.schema.tag_of(c).map_err(EditError::from))
                    .collect()
            };
            let fk = ForeignKey {
                name: name.to_string(),
                child_columns: tags(child, child_columns)?,
                parent_columns: tags(parent, parent_columns)?,
                child_table: child.to_string(),
                parent_table: parent.to_string(),
            };
            root.add_foreign_key(fk);
            Ok(())
        })
    }

    // -----------------------------------------------------------------------
    // DML
    // -----------------------------------------------------------------------

    /// Insert one row given in schema column order.
    pub fn insert(&mut self, table: &str, values: Vec<Value>) -> Result<(), EditError> {
        self.insert_many(table, vec![values]).map(|_| ())
    }

    pub fn insert_many(&mut self, table: &str, rows: Vec<Vec<Value>>) -> Result<usize, EditError> {
        self.statement(table, |root, _| {
            let snap = snapshot(root, table)?;
            let keyless = snap.schema.is_keyless();
            let mut pending: BTreeMap<Key, Row> = BTreeMap::new();
            for values in &rows {
                let values = check_values(table, &snap.schema, values)?;
                let (key, mut row) = snap.split_row(&values);
                if keyless {
                    let existing = match pending.get(&key) {
                        Some(r) => r.cardinality(),
                        None => snap.rows.get(&key)?.map(|r| r.cardinality()).unwrap_or(0),
                    };
                    row.set_cardinality(existing + 1);
                } else if pending.contains_key(&key) || snap.rows.contains_key(&key)? {
                    return Err(EditError::DuplicateKey {
                        table: table.to_string(),
                        key: key.to_string(),
                    });
                }
                pending.insert(key, row);
            }
            let map = snap.rows.edit(pending.into_iter().map(|(k, r)| (k, Some(r))))?;
            root.put_snapshot(table, snap.with_rows(map));
            debug!(table, rows = rows.len(), "rows inserted");
            Ok(rows.len())
        })
    }

    /// Update the row with primary key `key`.
    pub fn update(&mut self, table: &str, key: impl Into<Key>, assignments: &[(&str, Value)]) -> Result<(), EditError> {
        let key = key.into();
        self.statement(table, |root, _| {
            let snap = snapshot(root, table)?;
            let key = check_key(table, &snap.schema, key)?;
            let row = snap.rows.get(&key)?.ok_or_else(|| EditError::RowNotFound {
                table: table.to_string(),
                key: key.to_string(),
            })?;
            let mut values = snap.join_row(&key, &row);
            assign(table, &snap.schema, &mut values, assignments)?;
            let values = check_values(table, &snap.schema, &values)?;
            let (new_key, new_row) = snap.split_row(&values);

            let mut edits = BTreeMap::new();
            if new_key != key {
                if snap.rows.contains_key(&new_key)? {
                    return Err(EditError::DuplicateKey {
                        table: table.to_string(),
                        key: new_key.to_string(),
                    });
                }
                edits.insert(key, None);
            }
            edits.insert(new_key, Some(new_row));
            let map = snap.rows.edit(edits)?;
            root.put_snapshot(table, snap.with_rows(map));
            Ok(())
        })
    }

    /// Update every row matching `predicate`. Returns the number of rows
    /// changed, counting keyless duplicates individually.
    pub fn update_where(
        &mut self,
        table: &str,
        predicate: impl Fn(&RowView<'_>) -> bool,
        assignments: &[(&str, Value)],
    ) -> Result<u64, EditError> {
        self.statement(table, |root, _| {
            let snap = snapshot(root, table)?;
            let keyless = snap.schema.is_keyless();
            let mut removed: BTreeSet<Key> = BTreeSet::new();
            let mut added: BTreeMap<Key, Row> = BTreeMap::new();
            let mut count = 0u64;

            for entry in snap.rows.iter() {
                let (key, row) = entry?;
                let mut values = snap.join_row(&key, &row);
                if !predicate(&RowView::new(&snap.schema, &values)) {
                    continue;
                }
                assign(table, &snap.schema, &mut values, assignments)?;
                let values = check_values(table, &snap.schema, &values)?;
                let (new_key, mut new_row) = snap.split_row(&values);
                let copies = if keyless { row.cardinality() } else { 1 };
                count += copies;
                removed.insert(key);
                if keyless {
                    let so_far = added.get(&new_key).map(|r| r.cardinality()).unwrap_or(0);
                    new_row.set_cardinality(so_far + copies);
                } else if added.contains_key(&new_key) {
                    return Err(EditError::DuplicateKey {
                        table: table.to_string(),
                        key: new_key.to_string(),
                    });
                }
                added.insert(new_key, new_row);
            }

            let mut edits: BTreeMap<Key, Option<Row>> = removed.iter().map(|k| (k.clone(), None)).collect();
            for (key, mut row) in added {
                if !removed.contains(&key) {
                    if let Some(existing) = snap.rows.get(&key)? {
                        if !keyless {
                            return Err(EditError::DuplicateKey {
                                table: table.to_string(),
                                key: key.to_string(),
                            });
                        }
                        row.set_cardinality(row.cardinality() + existing.cardinality());
                    }
                }
                edits.insert(key, Some(row));
            }
            let map = snap.rows.edit(edits)?;
            root.put_snapshot(table, snap.with_rows(map));
            debug!(table, rows = count, "rows updated");
            Ok(count)
        })
    }

    /// Delete the row with primary key `key`. Returns whether it existed.
    pub fn delete(&mut self, table: &str, key: impl Into<Key>) -> Result<bool, EditError> {
        let key = key.into();
        self.statement(table, |root, _| {
            let snap = snapshot(root, table)?;
            let key = check_key(table, &snap.schema, key)?;
            if !snap.rows.contains_key(&key)? {
                return Ok(false);
            }
            let map = snap.rows.edit(vec![(key, None)])?;
            root.put_snapshot(table, snap.with_rows(map));
            Ok(true)
        })
    }

    /// Delete every row matching `predicate`. Returns the number removed.
    pub fn delete_where(&mut self, table: &str, predicate: impl Fn(&RowView<'_>) -> bool) -> Result<u64, EditError> {
        self.statement(table, |root, _| {
            let snap = snapshot(root, table)?;
            let keyless = snap.schema.is_keyless();
            let mut edits = Vec::new();
            let mut count = 0u64;
            for entry in snap.rows.iter() {
                let (key, row) = entry?;
                let values = snap.join_row(&key, &row);
                if predicate(&RowView::new(&snap.schema, &values)) {
                    count += if keyless { row.cardinality() } else { 1 };
                    edits.push((key, None));
                }
            }
            let map = snap.rows.edit(edits)?;
            root.put_snapshot(table, snap.with_rows(map));
            debug!(table, rows = count, "rows deleted");
            Ok(count)
        })
    }

    pub fn get(&self, table: &str, key: impl Into<Key>) -> Result<Option<Vec<Value>>, EditError> {
        let snap = snapshot(self.working.root(), table)?;
        let key = check_key(table, &snap.schema, key.into())?;
        Ok(snap.rows.get(&key)?.map(|row| snap.join_row(&key, &row)))
    }

    /// Every row in key order, keyless duplicates expanded.
    pub fn scan(&self, table: &str) -> Result<Vec<Vec<Value>>, EditError> {
        Ok(snapshot(self.working.root(), table)?.scan()?)
    }

    // -----------------------------------------------------------------------
    // Conflicts
    // -----------------------------------------------------------------------

    pub fn conflicts(&self, table: &str) -> Result<&[Conflict], EditError> {
        self.working
            .root()
            .get(table)
            .map(|t| t.conflicts.as_slice())
            .ok_or_else(|| EditError::TableNotFound(table.to_string()))
    }

    pub fn violations(&self, table: &str) -> Result<&[ConstraintViolation], EditError> {
        self.working
            .root()
            .get(table)
            .map(|t| t.violations.as_slice())
            .ok_or_else(|| EditError::TableNotFound(table.to_string()))
    }

    pub fn resolve_conflicts(&mut self, table: &str, resolution: Resolution) -> Result<usize, EditError> {
        self.touch();
        ConflictResolver::resolve_table(self.working.root_mut(), table, resolution, self.repo.validator())
    }

    pub fn resolve_conflict(&mut self, table: &str, key: impl Into<Key>, resolution: Resolution) -> Result<(), EditError> {
        self.touch();
        let key = key.into();
        ConflictResolver::resolve_row(self.working.root_mut(), table, &key, resolution, self.repo.validator())
    }

    pub fn clear_violations(&mut self, table: &str) -> Result<usize, EditError> {
        self.touch();
        ConflictResolver::clear_violations(self.working.root_mut(), table)
    }

    // -----------------------------------------------------------------------
    // Transaction control
    // -----------------------------------------------------------------------

    pub fn commit(&mut self, message: &str, options: &CommitOptions) -> Result<CommitResult, TransactionError> {
        transaction::commit(self, message, options)
    }

    /// Discard the working set and resync to the branch tip.
    pub fn rollback(&mut self) -> Result<(), TransactionError> {
        let tip = self.repo.branch_tip(&self.branch)?;
        let root = self.repo.graph().get(&tip)?.root().as_ref().clone();
        self.working.reset(tip, root);
        self.savepoints.clear();
        self.state = SessionState::Active;
        info!(session = %self.id, branch = %self.branch, tip = %tip.short(), "session rolled back");
        Ok(())
    }

    pub fn savepoint(&mut self, name: &str) {
        self.savepoints.retain(|(n, _)| n != name);
        self.savepoints.push((name.to_string(), self.working.clone()));
        debug!(session = %self.id, savepoint = name, "savepoint created");
    }

    /// Restore the working set captured by `name`. Later savepoints are
    /// discarded; `name` itself remains.
    pub fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), TransactionError> {
        let idx = self.savepoint_index(name)?;
        self.savepoints.truncate(idx + 1);
        self.working = self.savepoints[idx].1.clone();
        self.touch();
        Ok(())
    }

    pub fn release_savepoint(&mut self, name: &str) -> Result<(), TransactionError> {
        let idx = self.savepoint_index(name)?;
        self.savepoints.truncate(idx);
        Ok(())
    }

    fn savepoint_index(&self, name: &str) -> Result<usize, TransactionError> {
        self.savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| TransactionError::SavepointNotFound(name.to_string()))
    }

    /// Merge another branch or commit into the working set. The merged
    /// commit becomes a second parent of the next commit unless it was
    /// already an ancestor.
    pub fn merge(&mut self, rev: &RevSpec) -> Result<MergeResult, TransactionError> {
        self.touch();
        let theirs = self.repo.resolve_commit(rev)?;
        let head = self.working.base();
        let graph = self.repo.graph();
        let base = graph
            .merge_base(head, theirs)?
            .ok_or_else(|| MergeError::NoCommonAncestor {
                ours: head.short(),
                theirs: theirs.short(),
            })?;
        let base_root = Arc::clone(graph.get(&base)?.root());
        let theirs_root = Arc::clone(graph.get(&theirs)?.root());

        let result = self
            .repo
            .merge_engine()
            .merge(&base_root, self.working.root(), &theirs_root)?;
        if base != theirs {
            self.working.set_pending_merge(Some(theirs));
        }
        self.working.set_root(result.root.clone());
        info!(
            session = %self.id,
            theirs = %theirs.short(),
            state = %result.state,
            "merged into working set"
        );
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Row diff where either side may be [`RevSpec::Working`].
    pub fn diff(&self, table: &str, from: &RevSpec, to: &RevSpec) -> Result<RowDiff, DiffError> {
        let resolve = |rev: &RevSpec| -> Result<Arc<TableSet>, DiffError> {
            match rev {
                RevSpec::Working => Ok(Arc::new(self.working.root().clone())),
                other => self.repo.resolve(other),
            }
        };
        let (f, t) = (resolve(from)?, resolve(to)?);
        self.repo.diff_roots(table, &f, &t, from, to)
    }

    /// History of `table` from this session's base commit.
    pub fn history(&self, table: &str) -> Result<History, DiffError> {
        self.repo.history(table, &RevSpec::Commit(self.working.base()))
    }
}

// ---------------------------------------------------------------------------
// Statement scope
// ---------------------------------------------------------------------------

/// Which part of a table a statement can have put in violation.
enum Scope {
    Table,
    Rows(BTreeSet<Key>),
}

/// Tables to re-check after a statement on `table`. A schema or foreign key
/// change re-checks the table and its children whole; otherwise only the
/// rows the statement wrote, plus child rows that referenced values it
/// removed from the table.
fn statement_scope(table: &str, before: &TableSet, after: &TableSet) -> Result<Vec<(String, Scope)>, StoreError> {
    let Some(now) = after.snapshot(table) else {
        return Ok(Vec::new());
    };
    let parent_fks: Vec<&ForeignKey> = after
        .foreign_keys()
        .iter()
        .filter(|fk| fk.parent_table == table)
        .collect();

    let structural = before.snapshot(table).map_or(true, |was| was.schema != now.schema)
        || before.foreign_keys() != after.foreign_keys();
    let Some(was) = before.snapshot(table).filter(|_| !structural) else {
        let mut scope = vec![(table.to_string(), Scope::Table)];
        for fk in parent_fks {
            if !scope.iter().any(|(n, _)| *n == fk.child_table) {
                scope.push((fk.child_table.clone(), Scope::Table));
            }
        }
        return Ok(scope);
    };

    let mut touched = BTreeSet::new();
    let mut dropped: Vec<HashSet<Vec<Value>>> = vec![HashSet::new(); parent_fks.len()];
    for entry in was.rows.diff(&now.rows) {
        let entry = entry?;
        if let Some(old) = &entry.from {
            for (fk, gone) in parent_fks.iter().zip(dropped.iter_mut()) {
                let referenced = |snap: &TableSnapshot, row: &Row| -> Vec<Value> {
                    fk.parent_columns
                        .iter()
                        .map(|t| snap.cell(&entry.key, row, *t).clone())
                        .collect()
                };
                let old_vals = referenced(was, old);
                let new_vals = entry.to.as_ref().map(|r| referenced(now, r));
                if new_vals.as_ref() != Some(&old_vals) && !old_vals.iter().any(|v| v.is_null()) {
                    gone.insert(old_vals);
                }
            }
        }
        touched.insert(entry.key);
    }

    let mut scope = vec![(table.to_string(), Scope::Rows(touched))];
    for (fk, gone) in parent_fks.into_iter().zip(dropped) {
        if gone.is_empty() {
            continue;
        }
        let missing = missing_parent_values(after, fk, gone)?;
        if missing.is_empty() {
            continue;
        }
        let children = referencing_keys(after, fk, &missing)?;
        match scope.iter_mut().find(|(n, _)| *n == fk.child_table) {
            Some((_, Scope::Rows(keys))) => keys.extend(children),
            Some((_, Scope::Table)) => {}
            None => scope.push((fk.child_table.clone(), Scope::Rows(children))),
        }
    }
    Ok(scope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn session() -> Session {
        let repo = Repository::init(AppConfig::default()).unwrap();
        let mut s = repo.session("main").unwrap();
        let schema = Schema::builder("t")
            .key("pk", StorageKind::Int)
            .column("v", StorageKind::Int)
            .build()
            .unwrap();
        s.create_table("t", schema).unwrap();
        s
    }

    #[test]
    fn test_insert_update_delete() {
        let mut s = session();
        s.insert("t", vec![1.into(), 10.into()]).unwrap();
        s.insert("t", vec![2.into(), 20.into()]).unwrap();
        assert!(matches!(
            s.insert("t", vec![1.into(), 0.into()]),
            Err(EditError::DuplicateKey { .. })
        ));

        s.update("t", 1, &[("v", 11.into())]).unwrap();
        assert_eq!(s.get("t", 1).unwrap(), Some(vec![Value::Int(1), Value::Int(11)]));

        let n = s.update_where("t", |r| r.get("v") == &Value::Int(20), &[("v", 21.into())]).unwrap();
        assert_eq!(n, 1);
        assert!(s.delete("t", 2).unwrap());
        assert!(!s.delete("t", 2).unwrap());
        assert_eq!(s.scan("t").unwrap(), vec![vec![Value::Int(1), Value::Int(11)]]);
    }

    #[test]
    fn test_rejected_statement_leaves_working_set_unchanged() {
        let mut s = session();
        s.add_check("t", "v_positive", "v", CheckOp::Gt, 0).unwrap();
        s.insert("t", vec![1.into(), 5.into()]).unwrap();
        let before = s.working().root().content_hash();
        let err = s.update("t", 1, &[("v", (-1).into())]).unwrap_err();
        assert!(matches!(err, EditError::ConstraintViolation { .. }));
        assert_eq!(s.working().root().content_hash(), before);
    }

    #[test]
    fn test_parent_delete_checks_referencing_rows() {
        let mut s = session();
        let child = Schema::builder("c")
            .key("id", StorageKind::Int)
            .column("t_pk", StorageKind::Int)
            .build()
            .unwrap();
        s.create_table("c", child).unwrap();
        s.insert_many("t", vec![vec![1.into(), 10.into()], vec![2.into(), 20.into()]])
            .unwrap();
        s.insert("c", vec![100.into(), 1.into()]).unwrap();
        s.add_foreign_key("c_t_fk", "c", &["t_pk"], "t", &["pk"]).unwrap();

        assert!(matches!(
            s.insert("c", vec![101.into(), 7.into()]),
            Err(EditError::ConstraintViolation { ref constraint, .. }) if constraint == "c_t_fk"
        ));
        let err = s.delete("t", 1).unwrap_err();
        assert!(err.to_string().contains("c_t_fk"));
        assert!(s.get("t", 1).unwrap().is_some());

        // Rows nothing references can go, and updates keeping the key are fine.
        assert!(s.delete("t", 2).unwrap());
        s.update("t", 1, &[("v", 11.into())]).unwrap();
    }

    #[test]
    fn test_update_into_duplicate_is_rejected() {
        let mut s = session();
        s.add_unique("t", "uq_v", &["v"]).unwrap();
        s.insert_many("t", vec![vec![1.into(), 10.into()], vec![2.into(), 20.into()]])
            .unwrap();
        let err = s.update("t", 2, &[("v", 10.into())]).unwrap_err();
        assert!(matches!(err, EditError::ConstraintViolation { ref constraint, .. } if constraint == "uq_v"));
        assert_eq!(s.get("t", 2).unwrap(), Some(vec![Value::Int(2), Value::Int(20)]));
        s.update("t", 2, &[("v", 30.into())]).unwrap();
    }

    #[test]
    fn test_keyless_duplicates() {
        let mut s = session();
        let schema = Schema::builder("log").column("msg", StorageKind::String).build().unwrap();
        s.create_table("log", schema).unwrap();
        s.insert_many("log", vec![vec!["a".into()], vec!["a".into()], vec!["b".into()]])
            .unwrap();
        assert_eq!(s.scan("log").unwrap().len(), 3);
        let n = s.delete_where("log", |r| r.get("msg") == &Value::from("a")).unwrap();
        assert_eq!(n, 2);
        assert_eq!(s.scan("log").unwrap(), vec![vec![Value::from("b")]]);
    }

    #[test]
    fn test_ddl_rewrites_rows() {
        let mut s = session();
        s.insert("t", vec![1.into(), 10.into()]).unwrap();
        s.add_column("t", "w", StorageKind::String, true, Some("x".into())).unwrap();
        assert_eq!(
            s.get("t", 1).unwrap(),
            Some(vec![Value::Int(1), Value::Int(10), Value::from("x")])
        );
        s.rename_column("t", "w", "label").unwrap();
        s.modify_column("t", "v", StorageKind::String).unwrap();
        s.drop_column("t", "label").unwrap();
        assert_eq!(s.get("t", 1).unwrap(), Some(vec![Value::Int(1), Value::from("10")]));
        assert!(s.drop_column("t", "pk").is_err());
    }

    #[test]
    fn test_savepoints() {
        let mut s = session();
        s.insert("t", vec![1.into(), 1.into()]).unwrap();
        s.savepoint("sp1");
        s.insert("t", vec![2.into(), 2.into()]).unwrap();
        s.rollback_to_savepoint("sp1").unwrap();
        assert_eq!(s.scan("t").unwrap().len(), 1);
        s.release_savepoint("sp1").unwrap();
        assert!(matches!(
            s.rollback_to_savepoint("sp1"),
            Err(TransactionError::SavepointNotFound(_))
        ));
    }

    #[test]
    fn test_rollback_resyncs_to_tip() {
        let mut s = session();
        assert!(s.is_dirty().unwrap());
        s.rollback().unwrap();
        assert!(!s.is_dirty().unwrap());
        assert!(s.table_names().is_empty());
    }
}
