//! Error types for the vtab core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.
//!
//! Coercion problems during a diff are deliberately absent here: they are
//! non-fatal and travel alongside the result as
//! [`DiffWarnings`](crate::diff::DiffWarnings).

use thiserror::Error;

use crate::hash::Hash;
use crate::row::Key;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Diff(#[from] DiffError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Edit(#[from] EditError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

// ---------------------------------------------------------------------------
// Store errors
// ---------------------------------------------------------------------------

/// Structural errors from the content-addressed store. Always fatal.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A map node referenced by a parent is not in the store.
    #[error("map node {0} not found in store")]
    MissingNode(Hash),

    /// A commit referenced by a branch or a parent link is not in the graph.
    #[error("commit {0} not found")]
    MissingCommit(Hash),

    /// A node decoded to something structurally impossible.
    #[error("corrupt map structure: {0}")]
    Corrupt(String),
}

// ---------------------------------------------------------------------------
// Schema errors
// ---------------------------------------------------------------------------

/// Errors from schema construction and reconciliation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchemaError {
    /// The primary key column set differs between two schemas, so rows
    /// cannot be aligned one-for-one.
    #[error("incompatible primary key change: [{from}] -> [{to}]")]
    IncompatibleKeyChange { from: String, to: String },

    #[error("column '{0}' not found")]
    ColumnNotFound(String),

    #[error("column '{0}' already exists")]
    DuplicateColumn(String),

    #[error("invalid primary key: {0}")]
    InvalidPrimaryKey(String),

    #[error("no free column tag could be allocated")]
    TagExhausted,
}

// ---------------------------------------------------------------------------
// Diff errors
// ---------------------------------------------------------------------------

/// Errors from the row diff engine, table deltas and history.
#[derive(Debug, Error)]
pub enum DiffError {
    #[error("diff store error: {0}")]
    Store(#[from] StoreError),

    /// The table exists at neither end of the requested range.
    #[error("table '{table}' not found at {from} or {to}")]
    TableNotFound {
        table: String,
        from: String,
        to: String,
    },

    /// A revision could not be resolved to a commit or working set.
    #[error("revision not found: {0}")]
    RevisionNotFound(String),

    /// A diff or history worker failed without producing a result.
    #[error("internal diff error: {0}")]
    Internal(String),
}

// ---------------------------------------------------------------------------
// Merge errors
// ---------------------------------------------------------------------------

/// Errors from the merge engine.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("merge store error: {0}")]
    Store(#[from] StoreError),

    /// The merge target already carries unresolved conflicts or violations
    /// and this merge would replace them with different ones.
    #[error("existing unresolved conflicts would be overridden by new conflicts produced by merge. Please resolve them and try again (tables: {})", .tables.join(", "))]
    WouldOverwriteConflicts { tables: Vec<String> },

    /// The two commits share no ancestor.
    #[error("no common ancestor between {ours} and {theirs}")]
    NoCommonAncestor { ours: String, theirs: String },

    #[error("revision not found: {0}")]
    RevisionNotFound(String),

    #[error("merge diff error: {0}")]
    Diff(#[from] DiffError),
}

// ---------------------------------------------------------------------------
// Edit errors
// ---------------------------------------------------------------------------

/// Errors from DML / DDL applied to a working set.
#[derive(Debug, Error)]
pub enum EditError {
    #[error("table '{0}' not found")]
    TableNotFound(String),

    #[error("table '{0}' already exists")]
    TableExists(String),

    #[error("duplicate primary key {key} in table '{table}'")]
    DuplicateKey { table: String, key: String },

    #[error("row {key} not found in table '{table}'")]
    RowNotFound { table: String, key: String },

    #[error("table '{table}' expects {expected} key values, got {actual}")]
    KeyArity {
        table: String,
        expected: usize,
        actual: usize,
    },

    #[error("column '{column}' in table '{table}' cannot be NULL")]
    NullViolation { table: String, column: String },

    #[error("value for column '{column}' in table '{table}': {detail}")]
    InvalidValue {
        table: String,
        column: String,
        detail: String,
    },

    /// A statement would break a unique, check or foreign key constraint.
    #[error("constraint '{constraint}' violated in table '{table}': {detail}")]
    ConstraintViolation {
        table: String,
        constraint: String,
        detail: String,
    },

    #[error("no conflicts recorded for table '{0}'")]
    NoConflicts(String),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("edit store error: {0}")]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Transaction errors
// ---------------------------------------------------------------------------

/// Errors from the transaction commit validator.
#[derive(Debug, Error)]
pub enum TransactionError {
    /// Concurrent writes produced divergent values on the same keys.
    /// `keys` lists the conflicting row keys per table; a table with only a
    /// schema conflict has none.
    #[error("conflict in table {}{}", .tables.join(", "), describe_conflicts(.keys))]
    Conflict {
        tables: Vec<String>,
        keys: Vec<(String, Vec<Key>)>,
    },

    /// The committed state would carry constraint violations.
    #[error("committing this transaction resulted in a working set with constraint violations, transaction rolled back: {}", .details.join("; "))]
    ConstraintViolations {
        tables: Vec<String>,
        details: Vec<String>,
    },

    /// A forced commit with conflicts was attempted while the repository
    /// forbids it. The session has been reset to the branch tip.
    #[error("merge conflict detected in table {}, transaction rolled back. Conflicts must be resolved before committing; set transaction.allow_commit_conflicts to permit committing them", .tables.join(", "))]
    ConflictsNotPermitted { tables: Vec<String> },

    /// The branch moved and the caller asked for fast-forward only.
    #[error("branch '{branch}' has moved since the transaction started and fast-forward only was requested")]
    NotFastForward { branch: String },

    /// Every compare-and-swap attempt on the branch tip lost a race.
    #[error("could not advance branch '{branch}' after {attempts} attempts")]
    RetriesExhausted { branch: String, attempts: u32 },

    #[error("branch not found: {0}")]
    BranchNotFound(String),

    #[error("branch already exists: {0}")]
    BranchExists(String),

    #[error("savepoint not found: {0}")]
    SavepointNotFound(String),

    #[error("invalid session state: {0}")]
    InvalidState(String),

    #[error("transaction store error: {0}")]
    Store(#[from] StoreError),

    #[error("transaction merge error: {0}")]
    Merge(#[from] MergeError),

    #[error("transaction edit error: {0}")]
    Edit(#[from] EditError),

    #[error("transaction diff error: {0}")]
    Diff(#[from] DiffError),
}

impl TransactionError {
    /// Tables named by a conflict-type error, empty for everything else.
    pub fn tables(&self) -> &[String] {
        match self {
            Self::Conflict { tables, .. }
            | Self::ConstraintViolations { tables, .. }
            | Self::ConflictsNotPermitted { tables } => tables,
            _ => &[],
        }
    }
}

/// ` (t: 2 rows (1), (2))`, or nothing when no table has row conflicts.
fn describe_conflicts(keys: &[(String, Vec<Key>)]) -> String {
    const SHOWN: usize = 3;
    let parts: Vec<String> = keys
        .iter()
        .filter(|(_, ks)| !ks.is_empty())
        .map(|(table, ks)| {
            let mut listed: Vec<String> = ks.iter().take(SHOWN).map(|k| k.to_string()).collect();
            if ks.len() > SHOWN {
                listed.push("...".into());
            }
            let noun = if ks.len() == 1 { "row" } else { "rows" };
            format!("{table}: {} {noun} {}", ks.len(), listed.join(", "))
        })
        .collect();
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join("; "))
    }
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = TransactionError::Conflict {
            tables: vec!["t".into()],
            keys: vec![("t".into(), vec![])],
        };
        assert_eq!(err.to_string(), "conflict in table t");

        let err = TransactionError::Conflict {
            tables: vec!["t".into()],
            keys: vec![("t".into(), (1..=4i64).map(Key::from).collect())],
        };
        assert_eq!(err.to_string(), "conflict in table t (t: 4 rows (1), (2), (3), ...)");

        let err = MergeError::WouldOverwriteConflicts {
            tables: vec!["parent".into()],
        };
        assert!(err
            .to_string()
            .starts_with("existing unresolved conflicts would be overridden"));

        let err = SchemaError::IncompatibleKeyChange {
            from: "pk".into(),
            to: "pk, c1".into(),
        };
        assert!(err.to_string().contains("[pk] -> [pk, c1]"));

        let err = StoreError::MissingNode(Hash::of(b"x"));
        assert!(err.to_string().contains("not found in store"));
    }

    #[test]
    fn test_core_error_from_subsystem() {
        let err: CoreError = StoreError::Corrupt("bad".into()).into();
        assert!(matches!(err, CoreError::Store(_)));

        let err: CoreError = TransactionError::BranchNotFound("dev".into()).into();
        assert!(matches!(err, CoreError::Transaction(_)));
    }

    #[test]
    fn test_transaction_error_tables() {
        let err = TransactionError::ConflictsNotPermitted {
            tables: vec!["a".into(), "b".into()],
        };
        assert_eq!(err.tables(), ["a".to_string(), "b".to_string()]);
        assert!(TransactionError::BranchNotFound("x".into()).tables().is_empty());
    }
}
