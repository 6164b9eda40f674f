//! Row history of a table across commit ancestry.
//!
//! Every ancestor of the start commit is diffed against its first parent
//! (the root commit against nothing). Commits whose diff is empty are
//! skipped; the others contribute a [`HistoryGroup`] with the rows as they
//! were written at that commit, projected by tag onto a single reference
//! schema so columns line up across renames.
//!
//! History is keyed by table name only. A table that was dropped and later
//! recreated under the same name shows the rows of both lineages.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use tracing::{debug, info};

use crate::commit::{Commit, CommitGraph, CommitInfo};
use crate::diff::{DiffType, DiffWarnings, RowDiff};
use crate::errors::DiffError;
use crate::hash::Hash;
use crate::prolly::NodeStore;
use crate::row::Key;
use crate::schema::{Schema, Tag};
use crate::value::Value;

/// Rows written to the table by one commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryGroup {
    pub commit: CommitInfo,
    /// Inserted or updated rows, in reference-schema column order.
    pub rows: Vec<Vec<Value>>,
    /// Keys deleted by this commit.
    pub removed: Vec<Key>,
}

#[derive(Debug, Clone)]
pub struct History {
    pub table: String,
    /// Reference schema column names.
    pub columns: Vec<String>,
    /// Newest commit first.
    pub groups: Vec<HistoryGroup>,
    pub warnings: DiffWarnings,
}

impl History {
    /// Every row tagged with the commit it was observed at.
    pub fn rows(&self) -> impl Iterator<Item = (&CommitInfo, &[Value])> {
        self.groups
            .iter()
            .flat_map(|g| g.rows.iter().map(move |r| (&g.commit, r.as_slice())))
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Materialise the history of `table` reachable from `start`.
pub fn table_history(
    graph: &CommitGraph,
    store: &Arc<dyn NodeStore>,
    table: &str,
    start: Hash,
    parallelism: usize,
    max_warnings: usize,
) -> Result<History, DiffError> {
    let ancestors = graph.ancestors(start)?;
    let reference = ancestors
        .iter()
        .find_map(|c| c.root().snapshot(table).map(|s| s.schema.clone()))
        .ok_or_else(|| DiffError::TableNotFound {
            table: table.to_string(),
            from: "any ancestor".into(),
            to: start.short(),
        })?;

    let workers = parallelism.max(1);
    let chunk = ancestors.len().div_ceil(workers).max(1);
    debug!(table, commits = ancestors.len(), workers, "materialising history");

    let results: Vec<Result<Vec<(Option<HistoryGroup>, DiffWarnings)>, DiffError>> = thread::scope(|s| {
        let handles: Vec<_> = ancestors
            .chunks(chunk)
            .map(|part| {
                let reference = &reference;
                s.spawn(move || {
                    part.iter()
                        .map(|c| commit_group(graph, store, table, c, reference, max_warnings))
                        .collect::<Result<Vec<_>, _>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join().unwrap_or_else(|payload| {
                    Err(DiffError::Internal(format!("history worker panicked: {}", panic_message(&*payload))))
                })
            })
            .collect()
    });

    let mut warnings = DiffWarnings::new(max_warnings);
    let mut groups = Vec::new();
    for part in results {
        for (group, w) in part? {
            warnings.absorb(w);
            groups.extend(group);
        }
    }
    groups.sort_by(|a, b| b.commit.date.cmp(&a.commit.date));

    info!(table, groups = groups.len(), warnings = warnings.total(), "history materialised");
    Ok(History {
        table: table.to_string(),
        columns: reference.columns().iter().map(|c| c.name.clone()).collect(),
        groups,
        warnings,
    })
}

fn commit_group(
    graph: &CommitGraph,
    store: &Arc<dyn NodeStore>,
    table: &str,
    commit: &Arc<Commit>,
    reference: &Schema,
    max_warnings: usize,
) -> Result<(Option<HistoryGroup>, DiffWarnings), DiffError> {
    let parent = match commit.first_parent() {
        Some(p) => Some(graph.get(&p)?),
        None => None,
    };
    let before = parent.as_ref().and_then(|p| p.root().snapshot(table));
    let after = commit.root().snapshot(table);
    if before.is_none() && after.is_none() {
        return Ok((None, DiffWarnings::new(max_warnings)));
    }

    let mut diff = RowDiff::new(table, before, after, store, max_warnings)?;
    let tags: Vec<Tag> = diff.alignment().columns().iter().map(|c| c.tag).collect();
    let mut warnings = DiffWarnings::new(max_warnings);
    let mut rows = Vec::new();
    let mut removed = Vec::new();
    for row in diff.by_ref() {
        let row = row?;
        match (row.diff_type, row.to) {
            (DiffType::Removed, _) => removed.push(row.key),
            (_, Some(values)) => rows.push(project(&tags, values, reference, &mut warnings)),
            (_, None) => {}
        }
    }
    warnings.absorb(diff.into_warnings());

    if rows.is_empty() && removed.is_empty() {
        return Ok((None, warnings));
    }
    Ok((
        Some(HistoryGroup {
            commit: commit.info(),
            rows,
            removed,
        }),
        warnings,
    ))
}

/// Reorder values aligned on `tags` into the reference schema's columns,
/// coercing cells whose kind differs there.
fn project(tags: &[Tag], values: Vec<Value>, reference: &Schema, warnings: &mut DiffWarnings) -> Vec<Value> {
    let mut by_tag: HashMap<Tag, Value> = tags.iter().copied().zip(values).collect();
    reference
        .columns()
        .iter()
        .map(|col| {
            let v = by_tag.remove(&col.tag).unwrap_or(Value::Null);
            match v.kind() {
                Some(kind) if kind != col.kind => v.coerce(col.kind).unwrap_or_else(|_| {
                    warnings.coercion(&col.name, kind, col.kind);
                    Value::Null
                }),
                _ => v,
            }
        })
        .collect()
}

/// Text carried by a worker's panic payload.
fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
