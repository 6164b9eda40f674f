//! vtab core library.
//!
//! Version control for relational tables: a content-addressed ordered map
//! holds each table's rows, commits snapshot whole table sets, and the
//! engines on top compute row diffs across schema changes, materialise
//! per-table history, run three-way merges and validate concurrent
//! transaction commits against a branch tip.
//!
//! The entry point is [`Repository`]; writes go through a [`Session`].

pub mod commit;
pub mod config;
pub mod conflict;
pub mod diff;
pub mod errors;
pub mod hash;
pub mod history;
pub mod merge;
pub mod prolly;
pub mod refs;
pub mod repository;
pub mod row;
pub mod schema;
pub mod session;
pub mod table;
pub mod telemetry;
pub mod transaction;
pub mod value;

// Re-exports for convenience.
pub use commit::{CommitInfo, CommitMeta};
pub use config::AppConfig;
pub use conflict::{Conflict, ConflictType, Resolution};
pub use diff::{DiffRow, DiffType, DiffWarnings, RowDiff};
pub use errors::CoreError;
pub use hash::Hash;
pub use history::History;
pub use merge::{ConstraintViolation, MergeResult, MergeState, ViolationKind};
pub use repository::{Repository, RevSpec};
pub use row::{Key, Row};
pub use schema::{CheckOp, Schema};
pub use session::{Session, SessionState};
pub use transaction::{CommitOptions, CommitResult};
pub use value::{StorageKind, Value};
