//! The repository: commit graph, branch references and map node store,
//! plus the read-only entry points (diff, history, log, merge preview).
//!
//! Writes go through [`Session`]s, which own a private working set and
//! commit it through the transaction validator.

use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::commit::{Commit, CommitGraph, CommitInfo, CommitMeta};
use crate::config::AppConfig;
use crate::diff::{diff_stat, table_deltas, DiffStat, DiffWarnings, RowDiff, TableDelta};
use crate::errors::{DiffError, MergeError, TransactionError};
use crate::hash::Hash;
use crate::history::{table_history, History};
use crate::merge::{ConstraintValidator, MergeEngine, MergeOptions, MergeResult, MergeState, SchemaValidator};
use crate::prolly::{MemoryNodeStore, NodeStore};
use crate::refs::{MemoryRefStore, RefStore};
use crate::session::Session;
use crate::table::TableSet;

// ---------------------------------------------------------------------------
// Revisions
// ---------------------------------------------------------------------------

/// A point to diff or merge from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevSpec {
    Commit(Hash),
    Branch(String),
    /// The session's uncommitted working set. Only a session can resolve it.
    Working,
    /// The empty database, before any table existed.
    Empty,
}

impl FromStr for RevSpec {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("WORKING") {
            return Ok(Self::Working);
        }
        if s.eq_ignore_ascii_case("EMPTY") {
            return Ok(Self::Empty);
        }
        Ok(match Hash::from_hex(s) {
            Some(h) => Self::Commit(h),
            None => Self::Branch(s.to_string()),
        })
    }
}

impl From<Hash> for RevSpec {
    fn from(h: Hash) -> Self {
        Self::Commit(h)
    }
}

impl From<&str> for RevSpec {
    fn from(s: &str) -> Self {
        match s.parse() {
            Ok(rev) => rev,
            Err(never) => match never {},
        }
    }
}

impl fmt::Display for RevSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Commit(h) => write!(f, "{}", h.short()),
            Self::Branch(b) => write!(f, "{b}"),
            Self::Working => write!(f, "WORKING"),
            Self::Empty => write!(f, "EMPTY"),
        }
    }
}

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

pub struct Repository {
    config: Arc<AppConfig>,
    nodes: Arc<dyn NodeStore>,
    graph: CommitGraph,
    refs: Arc<dyn RefStore>,
    validator: Arc<dyn ConstraintValidator>,
    branch_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Repository {
    /// Create an in-memory repository with an initial empty commit on the
    /// default branch.
    pub fn init(config: AppConfig) -> Result<Arc<Self>, TransactionError> {
        Self::with_stores(
            config,
            Arc::new(MemoryNodeStore::new()),
            Arc::new(MemoryRefStore::new()),
            Arc::new(SchemaValidator),
        )
    }

    /// Create a repository over caller-supplied stores and validator.
    pub fn with_stores(
        config: AppConfig,
        nodes: Arc<dyn NodeStore>,
        refs: Arc<dyn RefStore>,
        validator: Arc<dyn ConstraintValidator>,
    ) -> Result<Arc<Self>, TransactionError> {
        let repo = Self {
            config: Arc::new(config),
            nodes,
            graph: CommitGraph::new(),
            refs,
            validator,
            branch_locks: Mutex::new(HashMap::new()),
        };

        let meta = CommitMeta::new(
            repo.config.repository.default_author.clone(),
            repo.config.repository.default_email.clone(),
            "Initialize data repository",
        );
        let root = repo.graph.insert(Commit::new(Vec::new(), Arc::new(TableSet::new()), meta))?;
        let branch = repo.config.repository.default_branch.clone();
        repo.refs.create(&branch, root.hash())?;
        info!(branch = %branch, commit = %root.hash().short(), "repository initialised");
        Ok(Arc::new(repo))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn node_store(&self) -> &Arc<dyn NodeStore> {
        &self.nodes
    }

    pub fn graph(&self) -> &CommitGraph {
        &self.graph
    }

    pub fn refs(&self) -> &Arc<dyn RefStore> {
        &self.refs
    }

    pub fn validator(&self) -> &dyn ConstraintValidator {
        self.validator.as_ref()
    }

    pub fn default_branch(&self) -> &str {
        &self.config.repository.default_branch
    }

    pub(crate) fn merge_options(&self) -> MergeOptions {
        MergeOptions::from(self.config.as_ref())
    }

    pub(crate) fn merge_engine(&self) -> MergeEngine<'_> {
        MergeEngine::new(&self.nodes, self.validator.as_ref(), self.merge_options())
    }

    // -----------------------------------------------------------------------
    // Branches
    // -----------------------------------------------------------------------

    /// Open a session on `branch`, starting from its current tip.
    pub fn session(self: &Arc<Self>, branch: &str) -> Result<Session, TransactionError> {
        let tip = self.branch_tip(branch)?;
        let root = self.graph.get(&tip)?.root().as_ref().clone();
        Ok(Session::new(Arc::clone(self), branch, tip, root))
    }

    pub fn branch_tip(&self, branch: &str) -> Result<Hash, TransactionError> {
        self.refs
            .tip(branch)
            .ok_or_else(|| TransactionError::BranchNotFound(branch.to_string()))
    }

    pub fn create_branch(&self, name: &str, from: &RevSpec) -> Result<Hash, TransactionError> {
        let tip = self.resolve_commit(from)?;
        self.refs.create(name, tip)?;
        info!(branch = name, from = %from, "branch created");
        Ok(tip)
    }

    pub fn delete_branch(&self, name: &str) -> Result<(), TransactionError> {
        if name == self.default_branch() {
            return Err(TransactionError::InvalidState(format!(
                "cannot delete the default branch '{name}'"
            )));
        }
        self.refs.delete(name)
    }

    pub fn branches(&self) -> Vec<String> {
        self.refs.branches()
    }

    /// Commit mutex of `branch`, created on first use.
    pub(crate) fn branch_lock(&self, branch: &str) -> Arc<Mutex<()>> {
        let mut locks: MutexGuard<'_, HashMap<String, Arc<Mutex<()>>>> =
            self.branch_locks.lock().unwrap_or_else(|poisoned| {
                warn!("branch lock table was poisoned, recovering");
                poisoned.into_inner()
            });
        Arc::clone(locks.entry(branch.to_string()).or_default())
    }

    // -----------------------------------------------------------------------
    // Resolution
    // -----------------------------------------------------------------------

    pub fn resolve_commit(&self, rev: &RevSpec) -> Result<Hash, DiffError> {
        match rev {
            RevSpec::Commit(h) if self.graph.contains(h) => Ok(*h),
            RevSpec::Branch(b) => self
                .refs
                .tip(b)
                .ok_or_else(|| DiffError::RevisionNotFound(b.clone())),
            other => Err(DiffError::RevisionNotFound(other.to_string())),
        }
    }

    /// Root table set at `rev`. `WORKING` only resolves inside a session.
    pub fn resolve(&self, rev: &RevSpec) -> Result<Arc<TableSet>, DiffError> {
        match rev {
            RevSpec::Empty => Ok(Arc::new(TableSet::new())),
            RevSpec::Working => Err(DiffError::RevisionNotFound(
                "WORKING can only be resolved by a session".into(),
            )),
            other => {
                let hash = self.resolve_commit(other)?;
                Ok(Arc::clone(self.graph.get(&hash)?.root()))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Lazy row diff of `table` between two revisions.
    pub fn diff(&self, table: &str, from: &RevSpec, to: &RevSpec) -> Result<RowDiff, DiffError> {
        let from_root = self.resolve(from)?;
        let to_root = self.resolve(to)?;
        self.diff_roots(table, &from_root, &to_root, from, to)
    }

    pub(crate) fn diff_roots(
        &self,
        table: &str,
        from_root: &TableSet,
        to_root: &TableSet,
        from: &RevSpec,
        to: &RevSpec,
    ) -> Result<RowDiff, DiffError> {
        let (f, t) = (from_root.snapshot(table), to_root.snapshot(table));
        if f.is_none() && t.is_none() {
            return Err(DiffError::TableNotFound {
                table: table.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        debug!(table, from = %from, to = %to, "diff requested");
        RowDiff::new(table, f, t, &self.nodes, self.config.diff.max_warnings)
    }

    pub fn history(&self, table: &str, start: &RevSpec) -> Result<History, DiffError> {
        let start = self.resolve_commit(start)?;
        table_history(
            &self.graph,
            &self.nodes,
            table,
            start,
            self.config.history.parallelism,
            self.config.diff.max_warnings,
        )
    }

    /// Ancestry of `rev`, newest first.
    pub fn log(&self, rev: &RevSpec) -> Result<Vec<CommitInfo>, DiffError> {
        let start = self.resolve_commit(rev)?;
        Ok(self.graph.log(start)?)
    }

    pub fn table_deltas(&self, from: &RevSpec, to: &RevSpec) -> Result<Vec<TableDelta>, DiffError> {
        let (f, t) = (self.resolve(from)?, self.resolve(to)?);
        Ok(table_deltas(&f, &t))
    }

    pub fn diff_stat(&self, table: &str, from: &RevSpec, to: &RevSpec) -> Result<DiffStat, DiffError> {
        let (f, t) = (self.resolve(from)?, self.resolve(to)?);
        diff_stat(table, f.snapshot(table), t.snapshot(table), &self.nodes)
    }

    /// Merge `theirs` into `ours` without moving any branch. A merge that
    /// would overwrite unresolved conflicts comes back as
    /// [`MergeState::Aborted`] carrying ours unchanged.
    pub fn preview_merge(&self, ours: &RevSpec, theirs: &RevSpec) -> Result<MergeResult, MergeError> {
        let not_found = |e: DiffError| MergeError::RevisionNotFound(e.to_string());
        let ours_hash = self.resolve_commit(ours).map_err(not_found)?;
        let theirs_hash = self.resolve_commit(theirs).map_err(not_found)?;
        let base = self
            .graph
            .merge_base(ours_hash, theirs_hash)?
            .ok_or_else(|| MergeError::NoCommonAncestor {
                ours: ours.to_string(),
                theirs: theirs.to_string(),
            })?;

        let ours_root = Arc::clone(self.graph.get(&ours_hash)?.root());
        let base_root = Arc::clone(self.graph.get(&base)?.root());
        let theirs_root = Arc::clone(self.graph.get(&theirs_hash)?.root());

        match self.merge_engine().merge(&base_root, &ours_root, &theirs_root) {
            Err(e @ MergeError::WouldOverwriteConflicts { .. }) => {
                let mut warnings = DiffWarnings::new(self.config.diff.max_warnings);
                warnings.push(e.to_string());
                Ok(MergeResult {
                    root: ours_root.as_ref().clone(),
                    state: MergeState::Aborted,
                    tables: Vec::new(),
                    warnings,
                })
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rev_spec_parsing() {
        assert_eq!(RevSpec::from("WORKING"), RevSpec::Working);
        assert_eq!(RevSpec::from("empty"), RevSpec::Empty);
        assert_eq!(RevSpec::from("main"), RevSpec::Branch("main".into()));
        let h = Hash::of(b"x");
        assert_eq!(RevSpec::from(h.to_hex().as_str()), RevSpec::Commit(h));
    }

    #[test]
    fn test_init_creates_default_branch() {
        let repo = Repository::init(AppConfig::default()).unwrap();
        let tip = repo.branch_tip("main").unwrap();
        assert_eq!(repo.log(&RevSpec::from("main")).unwrap().len(), 1);
        assert!(repo.resolve(&RevSpec::Commit(tip)).unwrap().is_empty());
        assert!(repo.resolve(&RevSpec::Working).is_err());
    }

    #[test]
    fn test_branches() {
        let repo = Repository::init(AppConfig::default()).unwrap();
        let tip = repo.create_branch("dev", &RevSpec::from("main")).unwrap();
        assert_eq!(repo.branch_tip("dev").unwrap(), tip);
        assert_eq!(repo.branches(), vec!["dev".to_string(), "main".to_string()]);
        assert!(repo.delete_branch("main").is_err());
        repo.delete_branch("dev").unwrap();
    }
}
