//! Row diff engine.
//!
//! [`RowDiff`] walks the joint traversal of two map versions and projects
//! every changed entry through a [`SchemaAlignment`], yielding classified
//! [`DiffRow`]s lazily in ascending key order. Nothing is materialised up
//! front, so dropping the iterator cancels the diff.
//!
//! When the primary key changed between the two schemas the rows cannot be
//! aligned one-for-one. The diff then runs in a degraded mode: a warning
//! marker is recorded and only rows whose key is absent from the older map
//! are reported, as `Added`.

pub mod deltas;

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::DiffError;
use crate::prolly::{DiffStats, MapDiff, MapDiffEntry, NodeStore, OrderedMap};
use crate::row::Key;
use crate::schema::{reconcile, reconcile_lenient, SchemaAlignment};
use crate::table::TableSnapshot;
use crate::value::{StorageKind, Value};

pub use deltas::{diff_stat, table_deltas, DiffStat, TableDelta, TableDeltaKind};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Row change classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffType {
    Added,
    Removed,
    Modified,
}

impl fmt::Display for DiffType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Added => write!(f, "added"),
            Self::Removed => write!(f, "removed"),
            Self::Modified => write!(f, "modified"),
        }
    }
}

/// One changed row, both sides projected onto the aligned column list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffRow {
    pub diff_type: DiffType,
    pub key: Key,
    pub from: Option<Vec<Value>>,
    pub to: Option<Vec<Value>>,
}

/// Non-fatal problems found while diffing.
///
/// Messages are de-duplicated and capped at `max`; every occurrence is
/// still counted in [`total`](Self::total).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffWarnings {
    max: usize,
    messages: Vec<String>,
    total: usize,
}

impl DiffWarnings {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            messages: Vec::new(),
            total: 0,
        }
    }

    pub fn push(&mut self, message: impl Into<String>) {
        self.total += 1;
        let message = message.into();
        if self.messages.len() < self.max && !self.messages.contains(&message) {
            self.messages.push(message);
        }
    }

    pub(crate) fn coercion(&mut self, column: &str, from: StorageKind, to: StorageKind) {
        warn!(column, %from, %to, "value could not be coerced, using NULL");
        self.push(format!(
            "unable to coerce value from field '{column}' ({from}) into latest column schema ({to})"
        ));
    }

    /// Fold another collection into this one.
    pub fn absorb(&mut self, other: DiffWarnings) {
        let extra = other.total.saturating_sub(other.messages.len());
        for m in other.messages {
            self.push(m);
        }
        self.total += extra;
    }

    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

// ---------------------------------------------------------------------------
// Row diff
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Full,
    /// Key set changed: report only keys new in the `to` map.
    AddedOnly,
}

/// Lazy sequence of [`DiffRow`]s between two table snapshots.
#[derive(Clone)]
pub struct RowDiff {
    table: String,
    alignment: SchemaAlignment,
    inner: MapDiff,
    keyless: bool,
    mode: Mode,
    warnings: DiffWarnings,
    pending: VecDeque<DiffRow>,
    emitted: u64,
    done: bool,
}

impl RowDiff {
    /// Diff two versions of `table`. A missing side is treated as an empty
    /// table with the other side's schema.
    pub fn new(
        table: &str,
        from: Option<&TableSnapshot>,
        to: Option<&TableSnapshot>,
        store: &Arc<dyn NodeStore>,
        max_warnings: usize,
    ) -> Result<Self, DiffError> {
        let (from_schema, from_rows, to_schema, to_rows) = match (from, to) {
            (Some(f), Some(t)) => (f.schema.clone(), f.rows.clone(), t.schema.clone(), t.rows.clone()),
            (Some(f), None) => (
                f.schema.clone(),
                f.rows.clone(),
                f.schema.clone(),
                OrderedMap::empty(Arc::clone(store)),
            ),
            (None, Some(t)) => (
                t.schema.clone(),
                OrderedMap::empty(Arc::clone(store)),
                t.schema.clone(),
                t.rows.clone(),
            ),
            (None, None) => {
                return Err(DiffError::TableNotFound {
                    table: table.to_string(),
                    from: "from".into(),
                    to: "to".into(),
                })
            }
        };

        let mut warnings = DiffWarnings::new(max_warnings);
        let (alignment, mode) = match reconcile(&from_schema, &to_schema) {
            Ok(a) => (a, Mode::Full),
            Err(e) => {
                warn!(table, error = %e, "primary key changed, diff will be partial");
                warnings.push(format!(
                    "cannot render full diff for table '{table}' due to primary key set change ({e}); only added rows are shown"
                ));
                (reconcile_lenient(&from_schema, &to_schema), Mode::AddedOnly)
            }
        };

        debug!(table, partial = (mode == Mode::AddedOnly), "starting row diff");
        Ok(Self {
            table: table.to_string(),
            keyless: from_schema.is_keyless() && to_schema.is_keyless(),
            alignment,
            inner: from_rows.diff(&to_rows),
            mode,
            warnings,
            pending: VecDeque::new(),
            emitted: 0,
            done: false,
        })
    }

    /// Output column names, key columns first.
    pub fn columns(&self) -> Vec<String> {
        self.alignment.column_names()
    }

    pub fn alignment(&self) -> &SchemaAlignment {
        &self.alignment
    }

    /// True when the key set changed and only added rows are reported.
    pub fn is_partial(&self) -> bool {
        self.mode == Mode::AddedOnly
    }

    pub fn warnings(&self) -> &DiffWarnings {
        &self.warnings
    }

    pub fn into_warnings(self) -> DiffWarnings {
        self.warnings
    }

    pub fn stats(&self) -> DiffStats {
        self.inner.stats()
    }

    /// Drain the whole sequence.
    pub fn collect_rows(&mut self) -> Result<Vec<DiffRow>, DiffError> {
        let mut rows = Vec::new();
        for r in self.by_ref() {
            rows.push(r?);
        }
        Ok(rows)
    }

    fn classify(&mut self, entry: MapDiffEntry) {
        let MapDiffEntry { key, from, to } = entry;

        if self.mode == Mode::AddedOnly {
            if let (None, Some(t)) = (&from, &to) {
                let projected = self.alignment.project_to(&key, t);
                self.pending.push_back(DiffRow {
                    diff_type: DiffType::Added,
                    key,
                    from: None,
                    to: Some(projected),
                });
            }
            return;
        }

        if self.keyless {
            let before = from.as_ref().map(|r| r.cardinality()).unwrap_or(0);
            let after = to.as_ref().map(|r| r.cardinality()).unwrap_or(0);
            if after > before {
                if let Some(t) = &to {
                    let projected = self.alignment.project_to(&key, t);
                    for _ in before..after {
                        self.pending.push_back(DiffRow {
                            diff_type: DiffType::Added,
                            key: key.clone(),
                            from: None,
                            to: Some(projected.clone()),
                        });
                    }
                }
            } else if let Some(f) = &from {
                let projected = self.alignment.project_from(&key, f, &mut self.warnings);
                for _ in after..before {
                    self.pending.push_back(DiffRow {
                        diff_type: DiffType::Removed,
                        key: key.clone(),
                        from: Some(projected.clone()),
                        to: None,
                    });
                }
            }
            return;
        }

        let from_vals = from
            .as_ref()
            .map(|r| self.alignment.project_from(&key, r, &mut self.warnings));
        let to_vals = to.as_ref().map(|r| self.alignment.project_to(&key, r));
        let diff_type = match (&from_vals, &to_vals) {
            (None, Some(_)) => DiffType::Added,
            (Some(_), None) => DiffType::Removed,
            (Some(f), Some(t)) if f != t => DiffType::Modified,
            // Stored bytes differ but the projections agree.
            _ => return,
        };
        self.pending.push_back(DiffRow {
            diff_type,
            key,
            from: from_vals,
            to: to_vals,
        });
    }
}

impl Iterator for RowDiff {
    type Item = Result<DiffRow, DiffError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(row) = self.pending.pop_front() {
                self.emitted += 1;
                return Some(Ok(row));
            }
            if self.done {
                return None;
            }
            match self.inner.next() {
                Some(Ok(entry)) => self.classify(entry),
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(DiffError::Store(e)));
                }
                None => {
                    self.done = true;
                    let stats = self.inner.stats();
                    debug!(
                        table = %self.table,
                        rows = self.emitted,
                        subtrees_skipped = stats.subtrees_skipped,
                        entries_compared = stats.entries_compared,
                        warnings = self.warnings.total(),
                        "row diff complete"
                    );
                }
            }
        }
    }
}
