//! Three-way schema merge.
//!
//! Columns are matched by tag. A column changed on one side takes that
//! side's definition; a column changed on both sides must have changed the
//! same way. New columns from either side are unioned, unless two different
//! new columns end up with the same name.

use std::collections::BTreeSet;

use crate::errors::SchemaError;
use crate::schema::{CheckConstraint, Column, Schema, Tag, UniqueConstraint};

/// Why two schemas could not be merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaMergeConflict {
    /// The primary key differs between ours and theirs.
    KeyChange(SchemaError),
    /// Column-level disagreements, one description each.
    Columns(Vec<String>),
}

impl SchemaMergeConflict {
    pub fn description(&self) -> String {
        match self {
            Self::KeyChange(e) => e.to_string(),
            Self::Columns(c) => c.join("; "),
        }
    }
}

pub fn merge_schemas(base: &Schema, ours: &Schema, theirs: &Schema) -> Result<Schema, SchemaMergeConflict> {
    if ours == theirs || theirs == base {
        return Ok(ours.clone());
    }
    if ours == base {
        return Ok(theirs.clone());
    }
    if !ours.same_key_set(theirs) {
        return Err(SchemaMergeConflict::KeyChange(SchemaError::IncompatibleKeyChange {
            from: ours.pk_signature(),
            to: theirs.pk_signature(),
        }));
    }

    let mut problems = Vec::new();
    let mut columns: Vec<Column> = Vec::new();

    for oc in ours.columns() {
        let bc = base.column_by_tag(oc.tag);
        match (theirs.column_by_tag(oc.tag), bc) {
            (Some(tc), _) if tc == oc => columns.push(oc.clone()),
            (Some(tc), Some(bc)) if oc == bc => columns.push(tc.clone()),
            (Some(tc), Some(bc)) if tc == bc => columns.push(oc.clone()),
            (Some(_), _) => problems.push(format!("column '{}' was modified differently on both sides", oc.name)),
            (None, Some(bc)) if oc == bc => {} // dropped by theirs
            (None, Some(_)) => problems.push(format!("column '{}' was modified in ours and dropped in theirs", oc.name)),
            (None, None) => columns.push(oc.clone()),
        }
    }

    for tc in theirs.columns() {
        if ours.column_by_tag(tc.tag).is_some() {
            continue;
        }
        match base.column_by_tag(tc.tag) {
            Some(bc) if bc == tc => {} // dropped by ours
            Some(_) => problems.push(format!("column '{}' was dropped in ours and modified in theirs", tc.name)),
            None => columns.push(tc.clone()),
        }
    }

    let mut seen = BTreeSet::new();
    for c in &columns {
        if !seen.insert(c.name.to_ascii_lowercase()) {
            problems.push(format!("two different columns are named '{}'", c.name));
        }
    }

    if !problems.is_empty() {
        return Err(SchemaMergeConflict::Columns(problems));
    }

    let kept: BTreeSet<Tag> = columns.iter().map(|c| c.tag).collect();
    let uniques = merge_named(base.uniques(), ours.uniques(), theirs.uniques(), |u| u.name.as_str())
        .into_iter()
        .filter(|u| u.tags.iter().all(|t| kept.contains(t)))
        .collect::<Vec<UniqueConstraint>>();
    let checks = merge_named(base.checks(), ours.checks(), theirs.checks(), |c| c.name.as_str())
        .into_iter()
        .filter(|c| kept.contains(&c.tag))
        .collect::<Vec<CheckConstraint>>();

    let mut retired: BTreeSet<Tag> = ours.retired_tags().clone();
    retired.extend(theirs.retired_tags().iter().copied());

    Schema::from_parts(columns, ours.pk_tags().to_vec(), uniques, checks, retired)
        .map_err(|e| SchemaMergeConflict::Columns(vec![e.to_string()]))
}

/// Ours' constraints, plus theirs' additions, minus theirs' removals.
fn merge_named<T: Clone>(base: &[T], ours: &[T], theirs: &[T], name: impl Fn(&T) -> &str) -> Vec<T> {
    let in_list = |list: &[T], n: &str| list.iter().any(|x| name(x) == n);
    let mut out = Vec::new();
    for o in ours {
        let removed_by_theirs = in_list(base, name(o)) && !in_list(theirs, name(o));
        if !removed_by_theirs {
            out.push(o.clone());
        }
    }
    for t in theirs {
        if !in_list(ours, name(t)) && !in_list(base, name(t)) {
            out.push(t.clone());
        }
    }
    out
}
