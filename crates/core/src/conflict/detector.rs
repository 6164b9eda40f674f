//! Three-way row classification.
//!
//! Given the base, ours and theirs versions of one key, the detector either
//! produces the merged row or reports a [`Conflict`]. Rows changed on both
//! sides merge cell by cell: a column conflicts only when both sides set it
//! to different values and neither matches the base.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::row::{Key, Row};
use crate::schema::Tag;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Categorisation of a row conflict.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Both sides modified the same cells differently.
    Content,
    /// One side modified the row, the other deleted it.
    ModifyDelete,
    /// Both sides inserted the key with different values.
    AddAdd,
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Content => write!(f, "content"),
            Self::ModifyDelete => write!(f, "modify_delete"),
            Self::AddAdd => write!(f, "add_add"),
        }
    }
}

/// An unresolved row conflict recorded against a table.
///
/// All three rows are expressed in the merged schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conflict {
    pub key: Key,
    pub conflict_type: ConflictType,
    pub base: Option<Row>,
    pub ours: Option<Row>,
    pub theirs: Option<Row>,
    /// Tags whose values diverged. Empty for keyless rows and deletions.
    pub columns: Vec<Tag>,
}

/// Outcome of merging one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowMerge {
    /// The merged row, or `None` when the key ends up deleted.
    Merged(Option<Row>),
    Conflict {
        conflict_type: ConflictType,
        columns: Vec<Tag>,
    },
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

/// Stateless three-way row merger.
pub struct ConflictDetector;

impl ConflictDetector {
    /// Merge one key. `keyless` disables cell-wise merging, since a keyless
    /// row's identity is its full content.
    pub fn merge_row(base: Option<&Row>, ours: Option<&Row>, theirs: Option<&Row>, keyless: bool) -> RowMerge {
        // Fast paths: identical results, or only one side changed.
        if ours == theirs {
            return RowMerge::Merged(ours.cloned());
        }
        if ours == base {
            return RowMerge::Merged(theirs.cloned());
        }
        if theirs == base {
            return RowMerge::Merged(ours.cloned());
        }

        if keyless {
            return RowMerge::Conflict {
                conflict_type: ConflictType::Content,
                columns: Vec::new(),
            };
        }

        match (base, ours, theirs) {
            (Some(_), None, Some(_)) | (Some(_), Some(_), None) => RowMerge::Conflict {
                conflict_type: ConflictType::ModifyDelete,
                columns: Vec::new(),
            },
            (None, Some(o), Some(t)) => RowMerge::Conflict {
                conflict_type: ConflictType::AddAdd,
                columns: differing_tags(o, t),
            },
            (Some(b), Some(o), Some(t)) => merge_cells(b, o, t),
            // Every remaining combination has two equal sides and was
            // handled above.
            _ => RowMerge::Merged(ours.cloned()),
        }
    }

    /// Build the conflict record for a key, logging it.
    pub fn conflict(
        table: &str,
        key: Key,
        conflict_type: ConflictType,
        columns: Vec<Tag>,
        base: Option<Row>,
        ours: Option<Row>,
        theirs: Option<Row>,
    ) -> Conflict {
        debug!(table, key = %key, conflict_type = %conflict_type, "row conflict detected");
        Conflict {
            key,
            conflict_type,
            base,
            ours,
            theirs,
            columns,
        }
    }
}

fn differing_tags(a: &Row, b: &Row) -> Vec<Tag> {
    let tags: BTreeSet<Tag> = a.iter().map(|(t, _)| t).chain(b.iter().map(|(t, _)| t)).collect();
    tags.into_iter().filter(|t| a.get(*t) != b.get(*t)).collect()
}

fn merge_cells(base: &Row, ours: &Row, theirs: &Row) -> RowMerge {
    let tags: BTreeSet<Tag> = base
        .iter()
        .chain(ours.iter())
        .chain(theirs.iter())
        .map(|(t, _)| t)
        .collect();

    let mut merged = Row::new();
    let mut conflicting = Vec::new();
    for tag in tags {
        let (b, o, t) = (base.get(tag), ours.get(tag), theirs.get(tag));
        let value = if o == t || t == b {
            o
        } else if o == b {
            t
        } else {
            conflicting.push(tag);
            o
        };
        merged.set(tag, value.clone());
    }

    if conflicting.is_empty() {
        RowMerge::Merged(Some(merged))
    } else {
        RowMerge::Conflict {
            conflict_type: ConflictType::Content,
            columns: conflicting,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(c1: i64, c2: i64) -> Row {
        Row::new().with(1, c1).with(2, c2)
    }

    #[test]
    fn test_one_sided_change() {
        let b = row(1, 1);
        let o = row(2, 1);
        assert_eq!(
            ConflictDetector::merge_row(Some(&b), Some(&o), Some(&b), false),
            RowMerge::Merged(Some(o.clone()))
        );
        assert_eq!(
            ConflictDetector::merge_row(Some(&b), Some(&b), None, false),
            RowMerge::Merged(None)
        );
    }

    #[test]
    fn test_identical_change_is_not_a_conflict() {
        let b = row(1, 1);
        let both = row(2, 2);
        assert_eq!(
            ConflictDetector::merge_row(Some(&b), Some(&both), Some(&both), false),
            RowMerge::Merged(Some(both.clone()))
        );
    }

    #[test]
    fn test_disjoint_columns_merge() {
        let b = row(1, 1);
        let o = row(5, 1);
        let t = row(1, 7);
        assert_eq!(
            ConflictDetector::merge_row(Some(&b), Some(&o), Some(&t), false),
            RowMerge::Merged(Some(row(5, 7)))
        );
    }

    #[test]
    fn test_content_conflict_names_columns() {
        let b = row(1, 1);
        let o = row(3, 1);
        let t = row(4, 1);
        assert_eq!(
            ConflictDetector::merge_row(Some(&b), Some(&o), Some(&t), false),
            RowMerge::Conflict {
                conflict_type: ConflictType::Content,
                columns: vec![1]
            }
        );
    }

    #[test]
    fn test_modify_delete_conflict() {
        let b = row(1, 1);
        let o = row(2, 1);
        let res = ConflictDetector::merge_row(Some(&b), Some(&o), None, false);
        assert!(matches!(
            res,
            RowMerge::Conflict {
                conflict_type: ConflictType::ModifyDelete,
                ..
            }
        ));
    }

    #[test]
    fn test_add_add_conflict() {
        let res = ConflictDetector::merge_row(None, Some(&row(1, 1)), Some(&row(1, 2)), false);
        assert_eq!(
            res,
            RowMerge::Conflict {
                conflict_type: ConflictType::AddAdd,
                columns: vec![2]
            }
        );
    }

    #[test]
    fn test_keyless_rows_never_merge_cellwise() {
        let b = row(1, 1);
        let res = ConflictDetector::merge_row(Some(&b), Some(&row(5, 1)), Some(&row(1, 7)), true);
        assert!(matches!(res, RowMerge::Conflict { .. }));
    }
}
