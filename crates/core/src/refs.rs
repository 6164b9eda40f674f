//! Branch references.
//!
//! The branch tip is the only state shared between sessions. It lives
//! behind the [`RefStore`] trait so hosts can inject their own reference
//! cell; the commit validator only ever moves a tip with
//! [`compare_and_swap`](RefStore::compare_and_swap).

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::errors::TransactionError;
use crate::hash::Hash;

pub trait RefStore: Send + Sync {
    /// Current tip of `branch`.
    fn tip(&self, branch: &str) -> Option<Hash>;

    /// Create a branch. Fails if it already exists.
    fn create(&self, branch: &str, tip: Hash) -> Result<(), TransactionError>;

    /// Point `branch` at `new` if it still points at `expected`. Returns
    /// `Ok(false)` when another writer moved the tip first.
    fn compare_and_swap(&self, branch: &str, expected: Hash, new: Hash) -> Result<bool, TransactionError>;

    fn delete(&self, branch: &str) -> Result<(), TransactionError>;

    fn branches(&self) -> Vec<String>;
}

/// In-process reference cell guarded by a mutex.
#[derive(Default)]
pub struct MemoryRefStore {
    refs: Mutex<BTreeMap<String, Hash>>,
}

impl MemoryRefStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn refs(&self) -> MutexGuard<'_, BTreeMap<String, Hash>> {
        self.refs.lock().unwrap_or_else(|poisoned| {
            warn!("ref store mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

impl RefStore for MemoryRefStore {
    fn tip(&self, branch: &str) -> Option<Hash> {
        self.refs().get(branch).copied()
    }

    fn create(&self, branch: &str, tip: Hash) -> Result<(), TransactionError> {
        let mut refs = self.refs();
        if refs.contains_key(branch) {
            return Err(TransactionError::BranchExists(branch.to_string()));
        }
        refs.insert(branch.to_string(), tip);
        debug!(branch, tip = %tip.short(), "branch created");
        Ok(())
    }

    fn compare_and_swap(&self, branch: &str, expected: Hash, new: Hash) -> Result<bool, TransactionError> {
        let mut refs = self.refs();
        let current = refs
            .get_mut(branch)
            .ok_or_else(|| TransactionError::BranchNotFound(branch.to_string()))?;
        if *current != expected {
            debug!(branch, expected = %expected.short(), actual = %current.short(), "tip moved, swap refused");
            return Ok(false);
        }
        *current = new;
        Ok(true)
    }

    fn delete(&self, branch: &str) -> Result<(), TransactionError> {
        self.refs()
            .remove(branch)
            .map(|_| ())
            .ok_or_else(|| TransactionError::BranchNotFound(branch.to_string()))
    }

    fn branches(&self) -> Vec<String> {
        self.refs().keys().cloned().collect()
    }
}
