//! Transaction commit validator.
//!
//! A commit serialises on the branch's mutex, reads the tip and, when
//! another session has committed since this one's base, merges the
//! working set into the tip with the session base as ancestor. The result
//! is checked against the conflict policy, written to the commit graph and
//! only then published with a compare-and-swap on the branch reference.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::commit::{Commit, CommitMeta};
use crate::errors::{MergeError, TransactionError};
use crate::hash::Hash;
use crate::merge::MergeState;
use crate::row::Key;
use crate::session::{Session, SessionState};
use crate::table::TableSet;

/// Caller choices for one commit.
#[derive(Debug, Clone, Default)]
pub struct CommitOptions {
    /// Fail instead of merging when the branch moved since the session began.
    pub allow_fast_forward_only: bool,
    /// Persist unresolved conflicts into the commit rather than blocking.
    /// Still subject to `transaction.allow_commit_conflicts`.
    pub allow_commit_with_conflicts: bool,
    /// Drop the pending merge parent, recording a single-parent commit.
    pub squash: bool,
    /// Author name and email; the repository defaults otherwise.
    pub author: Option<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CommitResult {
    pub commit: Hash,
    pub state: MergeState,
    /// False when the working set matched the tip and no commit was written.
    pub created: bool,
}

/// Commit `session`'s working set to its branch.
pub(crate) fn commit(session: &mut Session, message: &str, options: &CommitOptions) -> Result<CommitResult, TransactionError> {
    let repo = Arc::clone(&session.repo);
    let config = repo.config();
    let branch = session.branch.clone();

    let lock = repo.branch_lock(&branch);
    let _guard = lock.lock().unwrap_or_else(|poisoned| {
        warn!(branch = %branch, "branch commit lock was poisoned, recovering");
        poisoned.into_inner()
    });

    let attempts = config.transaction.max_commit_retries.max(1);
    for attempt in 1..=attempts {
        let tip = repo.branch_tip(&branch)?;
        let base = session.working.base();
        let tip_commit = repo.graph().get(&tip)?;

        let (root, state) = if tip == base {
            (session.working.root().clone(), MergeState::FastForward)
        } else {
            if options.allow_fast_forward_only {
                return Err(TransactionError::NotFastForward { branch });
            }
            let base_root = Arc::clone(repo.graph().get(&base)?.root());
            match repo
                .merge_engine()
                .merge(&base_root, session.working.root(), tip_commit.root())
            {
                Ok(result) => (result.root, result.state),
                Err(e @ MergeError::WouldOverwriteConflicts { .. }) => {
                    session.state = SessionState::ConflictBlocked;
                    return Err(e.into());
                }
                Err(e) => return Err(e.into()),
            }
        };
        debug!(session = %session.id, branch = %branch, attempt, state = %state, "commit candidate computed");

        let conflicted = root.tables_with_conflicts();
        if !conflicted.is_empty() {
            if !options.allow_commit_with_conflicts {
                session.state = SessionState::ConflictBlocked;
                let keys: Vec<(String, Vec<Key>)> = conflicted
                    .iter()
                    .map(|name| {
                        let ks = root
                            .get(name)
                            .map(|t| t.conflicts.iter().map(|c| c.key.clone()).collect())
                            .unwrap_or_default();
                        (name.clone(), ks)
                    })
                    .collect();
                warn!(session = %session.id, tables = ?conflicted, "commit blocked by conflicts");
                return Err(TransactionError::Conflict { tables: conflicted, keys });
            }
            if !config.transaction.allow_commit_conflicts {
                reset_to(session, tip, tip_commit.root());
                session.state = SessionState::Aborted;
                warn!(session = %session.id, tables = ?conflicted, "committing conflicts is disabled, session reset");
                return Err(TransactionError::ConflictsNotPermitted { tables: conflicted });
            }
        }

        let violated = root.tables_with_violations();
        let violations_allowed = config.transaction.force_transaction_commit
            || (options.allow_commit_with_conflicts && config.transaction.allow_commit_conflicts);
        if !violated.is_empty() && !violations_allowed {
            let details = violated
                .iter()
                .filter_map(|t| root.get(t).map(|table| (t, table)))
                .flat_map(|(t, table)| table.violations.iter().map(move |v| v.describe(t)))
                .collect();
            reset_to(session, tip, tip_commit.root());
            session.state = SessionState::Aborted;
            warn!(session = %session.id, tables = ?violated, "commit rejected by constraint violations, session reset");
            return Err(TransactionError::ConstraintViolations {
                tables: violated,
                details,
            });
        }

        let pending = session.working.pending_merge();
        if root.content_hash() == tip_commit.root().content_hash() && pending.is_none() {
            session.working.reset(tip, root);
            session.savepoints.clear();
            session.state = SessionState::Committed;
            debug!(session = %session.id, branch = %branch, "nothing to commit");
            return Ok(CommitResult {
                commit: tip,
                state: MergeState::FastForward,
                created: false,
            });
        }

        let mut parents = vec![tip];
        if let Some(p) = pending.filter(|_| !options.squash) {
            parents.push(p);
        }
        let (author, email) = options.author.clone().unwrap_or_else(|| {
            (
                config.repository.default_author.clone(),
                config.repository.default_email.clone(),
            )
        });
        let root = Arc::new(root);
        let new = repo
            .graph()
            .insert(Commit::new(parents, Arc::clone(&root), CommitMeta::new(author, email, message)))?
            .hash();

        if repo.refs().compare_and_swap(&branch, tip, new)? {
            session.working.reset(new, root.as_ref().clone());
            session.savepoints.clear();
            session.state = SessionState::Committed;
            info!(
                session = %session.id,
                branch = %branch,
                commit = %new.short(),
                state = %state,
                "transaction committed"
            );
            return Ok(CommitResult {
                commit: new,
                state,
                created: true,
            });
        }
        warn!(branch = %branch, attempt, "branch tip moved during commit, retrying");
    }

    Err(TransactionError::RetriesExhausted { branch, attempts })
}

fn reset_to(session: &mut Session, tip: Hash, root: &TableSet) {
    session.working.reset(tip, root.clone());
    session.savepoints.clear();
}
