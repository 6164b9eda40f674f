//! Three-way merge of table sets.
//!
//! [`MergeEngine::merge`] combines two root values against their common
//! ancestor. Each table is merged independently: unchanged or one-sided
//! tables are taken wholesale, tables changed on both sides get a schema
//! merge followed by a row merge. Conflicts and constraint violations are
//! recorded on the merged tables rather than failing the merge.

pub mod rows;
pub mod schema;
pub mod violations;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::conflict::Conflict;
use crate::diff::{DiffType, DiffWarnings, RowDiff};
use crate::errors::MergeError;
use crate::hash::Hash;
use crate::prolly::NodeStore;
use crate::row::Key;
use crate::schema::Schema;
use crate::table::{ForeignKey, SchemaConflict, Table, TableSet, TableSnapshot};

pub use rows::RowMergeCounts;
pub use schema::{merge_schemas, SchemaMergeConflict};
pub use violations::{
    missing_parent_values, referencing_keys, union_violations, ConstraintValidator, ConstraintViolation,
    SchemaValidator, ViolationKind,
};

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Overall outcome of a merge or commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeState {
    Pending,
    /// Nothing needed combining: one side contained the other.
    FastForward,
    Merged,
    MergedWithConflicts,
    Aborted,
}

impl fmt::Display for MergeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::FastForward => write!(f, "fast_forward"),
            Self::Merged => write!(f, "merged"),
            Self::MergedWithConflicts => write!(f, "merged_with_conflicts"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// What the merge did with one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableOperation {
    /// Theirs brought nothing new; ours kept.
    Unchanged,
    /// Ours was unchanged; theirs taken, including adds and drops.
    FastForward,
    /// Rows merged three ways.
    Merged,
    /// Schemas could not be merged; a schema conflict was recorded.
    SchemaConflict,
    /// The primary key changed; the table merge was skipped.
    KeyChangeAborted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMergeStats {
    pub table: String,
    pub operation: TableOperation,
    pub rows: RowMergeCounts,
    /// Conflicts produced by this merge.
    pub conflicts: usize,
    /// Violations produced by this merge.
    pub violations: usize,
    /// Keys theirs added to a table whose merge was aborted.
    pub partial_rows: Vec<Key>,
}

impl TableMergeStats {
    fn new(table: &str, operation: TableOperation) -> Self {
        Self {
            table: table.to_string(),
            operation,
            rows: RowMergeCounts::default(),
            conflicts: 0,
            violations: 0,
            partial_rows: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct MergeResult {
    pub root: TableSet,
    pub state: MergeState,
    pub tables: Vec<TableMergeStats>,
    pub warnings: DiffWarnings,
}

impl MergeResult {
    /// Tables for which this merge produced conflicts, data or schema.
    pub fn conflicted_tables(&self) -> Vec<String> {
        self.tables
            .iter()
            .filter(|t| {
                t.conflicts > 0
                    || matches!(
                        t.operation,
                        TableOperation::SchemaConflict | TableOperation::KeyChangeAborted
                    )
            })
            .map(|t| t.table.clone())
            .collect()
    }

    pub fn violated_tables(&self) -> Vec<String> {
        self.tables
            .iter()
            .filter(|t| t.violations > 0)
            .map(|t| t.table.clone())
            .collect()
    }

    pub fn has_conflicts(&self) -> bool {
        self.state == MergeState::MergedWithConflicts
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MergeOptions {
    pub validate_constraints: bool,
    pub max_warnings: usize,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            validate_constraints: true,
            max_warnings: 32,
        }
    }
}

impl From<&AppConfig> for MergeOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            validate_constraints: config.merge.validate_constraints,
            max_warnings: config.diff.max_warnings,
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct MergeEngine<'a> {
    store: &'a Arc<dyn NodeStore>,
    validator: &'a dyn ConstraintValidator,
    options: MergeOptions,
}

impl<'a> MergeEngine<'a> {
    pub fn new(store: &'a Arc<dyn NodeStore>, validator: &'a dyn ConstraintValidator, options: MergeOptions) -> Self {
        Self {
            store,
            validator,
            options,
        }
    }

    /// Merge `theirs` into `ours` relative to `base`.
    ///
    /// Fails with [`MergeError::WouldOverwriteConflicts`] when a table of
    /// `ours` already carries unresolved artifacts and the merge would add
    /// different ones.
    pub fn merge(&self, base: &TableSet, ours: &TableSet, theirs: &TableSet) -> Result<MergeResult, MergeError> {
        let mut warnings = DiffWarnings::new(self.options.max_warnings);

        if ours.content_hash() == theirs.content_hash() || theirs.content_hash() == base.content_hash() {
            debug!("theirs brings no changes, keeping ours");
            return Ok(self.whole(ours.clone(), ours, TableOperation::Unchanged, warnings));
        }
        if ours.content_hash() == base.content_hash() {
            debug!("ours is unchanged, fast-forwarding to theirs");
            return Ok(self.whole(theirs.clone(), theirs, TableOperation::FastForward, warnings));
        }

        let names: BTreeSet<&str> = base.names().chain(ours.names()).chain(theirs.names()).collect();
        let mut merged = TableSet::new();
        let mut stats = Vec::new();
        let mut new_conflicts: Vec<(String, Vec<Conflict>)> = Vec::new();

        for name in names {
            let (table, mut st, conflicts) =
                self.merge_table(name, base.get(name), ours.get(name), theirs.get(name), &mut warnings)?;
            if let Some(table) = table {
                merged.insert(name, table);
            }
            st.conflicts = conflicts.len();
            if !conflicts.is_empty() {
                new_conflicts.push((name.to_string(), conflicts));
            }
            stats.push(st);
        }
        merged.set_foreign_keys(merge_foreign_keys(base, ours, theirs, &merged));

        for (name, conflicts) in &new_conflicts {
            if let Some(t) = merged.get_mut(name) {
                for c in conflicts {
                    if !t.conflicts.iter().any(|e| e.key == c.key) {
                        t.conflicts.push(c.clone());
                    }
                }
            }
        }

        if self.options.validate_constraints {
            self.validate(ours, &mut merged, &mut stats)?;
        }

        let blocked = overwritten_tables(ours, &stats, &new_conflicts);
        if !blocked.is_empty() {
            warn!(tables = ?blocked, "merge would overwrite unresolved conflicts");
            return Err(MergeError::WouldOverwriteConflicts { tables: blocked });
        }

        let produced_artifacts = stats.iter().any(|s| {
            s.conflicts > 0
                || s.violations > 0
                || matches!(
                    s.operation,
                    TableOperation::SchemaConflict | TableOperation::KeyChangeAborted
                )
        });
        let state = if produced_artifacts {
            MergeState::MergedWithConflicts
        } else if stats
            .iter()
            .all(|s| matches!(s.operation, TableOperation::Unchanged | TableOperation::FastForward))
        {
            MergeState::FastForward
        } else {
            MergeState::Merged
        };

        info!(
            tables = stats.len(),
            state = %state,
            warnings = warnings.total(),
            "merge complete"
        );

        Ok(MergeResult {
            root: merged,
            state,
            tables: stats,
            warnings,
        })
    }

    fn whole(&self, root: TableSet, side: &TableSet, op: TableOperation, warnings: DiffWarnings) -> MergeResult {
        let tables = side.names().map(|n| TableMergeStats::new(n, op)).collect();
        MergeResult {
            root,
            state: MergeState::FastForward,
            tables,
            warnings,
        }
    }

    fn merge_table(
        &self,
        name: &str,
        base: Option<&Table>,
        ours: Option<&Table>,
        theirs: Option<&Table>,
        warnings: &mut DiffWarnings,
    ) -> Result<(Option<Table>, TableMergeStats, Vec<Conflict>), MergeError> {
        let hash = |t: Option<&Table>| t.map(|t| t.snapshot.content_hash());
        let (bh, oh, th): (Option<Hash>, Option<Hash>, Option<Hash>) = (hash(base), hash(ours), hash(theirs));

        if oh == th || th == bh {
            let kept = ours.map(|o| with_artifacts(o.clone(), theirs));
            return Ok((kept, TableMergeStats::new(name, TableOperation::Unchanged), Vec::new()));
        }
        if oh == bh {
            debug!(table = name, "table unchanged in ours, taking theirs");
            let taken = theirs.map(|t| with_artifacts(t.clone(), ours));
            return Ok((taken, TableMergeStats::new(name, TableOperation::FastForward), Vec::new()));
        }

        match (base, ours, theirs) {
            (None, Some(o), Some(t)) => {
                if o.snapshot.schema != t.snapshot.schema {
                    let table = schema_conflict(o, Some(t), "table was added on both sides with different schemas");
                    return Ok((Some(table), TableMergeStats::new(name, TableOperation::SchemaConflict), Vec::new()));
                }
                let empty = TableSnapshot::empty(o.snapshot.schema.clone(), Arc::clone(self.store));
                self.merge_data(name, &empty, o, t, o.snapshot.schema.clone(), warnings)
            }
            (Some(_), None, Some(t)) => {
                let mut table = with_artifacts(t.clone(), None);
                table.schema_conflict = Some(SchemaConflict::new(
                    None,
                    Some(&t.snapshot),
                    "table was deleted in ours and modified in theirs",
                ));
                warn!(table = name, "table deleted in ours and modified in theirs");
                Ok((Some(table), TableMergeStats::new(name, TableOperation::SchemaConflict), Vec::new()))
            }
            (Some(_), Some(o), None) => {
                let table = schema_conflict(o, None, "table was modified in ours and deleted in theirs");
                warn!(table = name, "table modified in ours and deleted in theirs");
                Ok((Some(table), TableMergeStats::new(name, TableOperation::SchemaConflict), Vec::new()))
            }
            (Some(b), Some(o), Some(t)) => {
                let (bs, os, ts) = (&b.snapshot.schema, &o.snapshot.schema, &t.snapshot.schema);
                let key_changed = !os.same_key_set(ts) || !bs.same_key_set(os) || !bs.same_key_set(ts);
                if key_changed {
                    return self.abort_key_change(name, b, o, t, warnings);
                }
                match merge_schemas(bs, os, ts) {
                    Ok(schema) => self.merge_data(name, &b.snapshot, o, t, schema, warnings),
                    Err(SchemaMergeConflict::KeyChange(_)) => self.abort_key_change(name, b, o, t, warnings),
                    Err(conflict @ SchemaMergeConflict::Columns(_)) => {
                        warn!(table = name, reason = %conflict.description(), "schema conflict");
                        let table = schema_conflict(o, Some(t), &conflict.description());
                        Ok((Some(table), TableMergeStats::new(name, TableOperation::SchemaConflict), Vec::new()))
                    }
                }
            }
            // Every other combination has two equal sides.
            _ => Ok((ours.cloned(), TableMergeStats::new(name, TableOperation::Unchanged), Vec::new())),
        }
    }

    fn merge_data(
        &self,
        name: &str,
        base: &TableSnapshot,
        ours: &Table,
        theirs: &Table,
        schema: Schema,
        warnings: &mut DiffWarnings,
    ) -> Result<(Option<Table>, TableMergeStats, Vec<Conflict>), MergeError> {
        let out = rows::merge_rows(name, base, &ours.snapshot, &theirs.snapshot, &schema, warnings)?;
        let mut table = with_artifacts(ours.clone(), Some(theirs));
        table.snapshot = TableSnapshot::new(schema, out.rows);
        let mut st = TableMergeStats::new(name, TableOperation::Merged);
        st.rows = out.counts;
        info!(
            table = name,
            added = out.counts.added,
            modified = out.counts.modified,
            deleted = out.counts.deleted,
            conflicts = out.conflicts.len(),
            "table merged"
        );
        Ok((Some(table), st, out.conflicts))
    }

    /// Keep ours for a table whose primary key changed and report which
    /// keys theirs added, since those rows are not merged.
    fn abort_key_change(
        &self,
        name: &str,
        base: &Table,
        ours: &Table,
        theirs: &Table,
        warnings: &mut DiffWarnings,
    ) -> Result<(Option<Table>, TableMergeStats, Vec<Conflict>), MergeError> {
        // When theirs re-keyed the table the diff degrades to added rows
        // only; when ours did, it is a full diff and removals are skipped.
        let added = RowDiff::new(
            name,
            Some(&base.snapshot),
            Some(&theirs.snapshot),
            self.store,
            self.options.max_warnings,
        )?;
        let mut partial = Vec::new();
        for row in added {
            let row = row?;
            if row.diff_type == DiffType::Added {
                partial.push(row.key);
            }
        }
        let message = format!(
            "cannot merge table '{name}' due to primary key set change; {} rows added in theirs were not merged",
            partial.len()
        );
        warn!(table = name, partial_rows = partial.len(), "table merge aborted on primary key change");
        warnings.push(message.clone());

        let table = schema_conflict(ours, Some(theirs), &message);
        let mut st = TableMergeStats::new(name, TableOperation::KeyChangeAborted);
        st.partial_rows = partial;
        Ok((Some(table), st, Vec::new()))
    }

    /// Re-check tables whose data differs from ours, and tables whose
    /// foreign keys point at them.
    fn validate(&self, ours: &TableSet, merged: &mut TableSet, stats: &mut [TableMergeStats]) -> Result<(), MergeError> {
        let changed: BTreeSet<String> = merged
            .iter()
            .filter(|(name, t)| ours.snapshot(name).map(|s| s.content_hash()) != Some(t.snapshot.content_hash()))
            .map(|(name, _)| name.to_string())
            .collect();
        let mut targets = changed.clone();
        for fk in merged.foreign_keys() {
            if changed.contains(&fk.parent_table) || changed.contains(&fk.child_table) {
                targets.insert(fk.child_table.clone());
            }
        }

        for name in targets {
            let found = self.validator.validate_table(merged, &name)?;
            let Some(table) = merged.get_mut(&name) else {
                continue;
            };
            let fresh: Vec<ConstraintViolation> = found
                .into_iter()
                .filter(|v| !table.violations.iter().any(|e| e.same_identity(v)))
                .collect();
            if fresh.is_empty() {
                continue;
            }
            debug!(table = %name, violations = fresh.len(), "merge introduced constraint violations");
            if let Some(st) = stats.iter_mut().find(|s| s.table == name) {
                st.violations = fresh.len();
            }
            union_violations(&mut table.violations, fresh);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Carry the other side's unresolved artifacts onto a kept table.
fn with_artifacts(mut kept: Table, other: Option<&Table>) -> Table {
    let Some(other) = other else {
        return kept;
    };
    for c in &other.conflicts {
        if !kept.conflicts.iter().any(|e| e.key == c.key) {
            kept.conflicts.push(c.clone());
        }
    }
    union_violations(&mut kept.violations, other.violations.iter().cloned());
    if kept.schema_conflict.is_none() {
        kept.schema_conflict = other.schema_conflict.clone();
    }
    kept
}

fn schema_conflict(ours: &Table, theirs: Option<&Table>, description: &str) -> Table {
    let mut table = with_artifacts(ours.clone(), theirs);
    table.schema_conflict = Some(SchemaConflict::new(
        Some(&ours.snapshot),
        theirs.map(|t| &t.snapshot),
        description,
    ));
    table
}

/// Ours' foreign keys, plus theirs' additions, minus theirs' removals,
/// restricted to keys whose tables survived.
fn merge_foreign_keys(base: &TableSet, ours: &TableSet, theirs: &TableSet, merged: &TableSet) -> Vec<ForeignKey> {
    let named = |set: &TableSet, n: &str| set.foreign_keys().iter().any(|fk| fk.name == n);
    let mut out: Vec<ForeignKey> = Vec::new();
    for fk in ours.foreign_keys() {
        if named(base, &fk.name) && !named(theirs, &fk.name) {
            continue;
        }
        out.push(fk.clone());
    }
    for fk in theirs.foreign_keys() {
        if !named(ours, &fk.name) && !named(base, &fk.name) {
            out.push(fk.clone());
        }
    }
    out.retain(|fk| merged.contains(&fk.child_table) && merged.contains(&fk.parent_table));
    out
}

/// Tables that already had artifacts in ours and would gain new ones.
fn overwritten_tables(ours: &TableSet, stats: &[TableMergeStats], new_conflicts: &[(String, Vec<Conflict>)]) -> Vec<String> {
    let mut out = Vec::new();
    for st in stats {
        let Some(existing) = ours.get(&st.table) else {
            continue;
        };
        if !existing.has_artifacts() {
            continue;
        }
        let added_conflicts = new_conflicts
            .iter()
            .find(|(n, _)| *n == st.table)
            .map(|(_, cs)| cs.iter().any(|c| !existing.conflicts.contains(c)))
            .unwrap_or(false);
        let added_schema_conflict = matches!(
            st.operation,
            TableOperation::SchemaConflict | TableOperation::KeyChangeAborted
        ) && existing.schema_conflict.is_none();
        if added_conflicts || st.violations > 0 || added_schema_conflict {
            out.push(st.table.clone());
        }
    }
    out
}
