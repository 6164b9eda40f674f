//! Commits and the commit graph.
//!
//! Commits are immutable and addressed by the hash of their parents, root
//! table set and metadata. The [`CommitGraph`] is an arena of commits keyed
//! by that hash; ancestry walks keep a seen-set over it so diamond-shaped
//! histories visit every ancestor exactly once.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::StoreError;
use crate::hash::{ContentHasher, Hash};
use crate::table::TableSet;

/// Who made a commit, when, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitMeta {
    pub author: String,
    pub email: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl CommitMeta {
    pub fn new(author: impl Into<String>, email: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            author: author.into(),
            email: email.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Commit identity and metadata, as surfaced by log and history queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub hash: Hash,
    pub parents: Vec<Hash>,
    pub author: String,
    pub email: String,
    pub date: DateTime<Utc>,
    pub message: String,
}

/// An immutable node in the commit DAG.
#[derive(Debug)]
pub struct Commit {
    hash: Hash,
    parents: Vec<Hash>,
    root: Arc<TableSet>,
    meta: CommitMeta,
}

impl Commit {
    pub fn new(parents: Vec<Hash>, root: Arc<TableSet>, meta: CommitMeta) -> Self {
        let mut h = ContentHasher::with_domain("commit");
        h.write_u64(parents.len() as u64);
        for p in &parents {
            h.write_hash(p);
        }
        h.write_hash(&root.content_hash());
        h.write_str(&meta.author);
        h.write_str(&meta.email);
        h.write_str(&meta.message);
        h.write_i64(meta.timestamp.timestamp_nanos_opt().unwrap_or_else(|| meta.timestamp.timestamp()));
        Self {
            hash: h.finish(),
            parents,
            root,
            meta,
        }
    }

    pub fn hash(&self) -> Hash {
        self.hash
    }

    pub fn parents(&self) -> &[Hash] {
        &self.parents
    }

    pub fn first_parent(&self) -> Option<Hash> {
        self.parents.first().copied()
    }

    pub fn root(&self) -> &Arc<TableSet> {
        &self.root
    }

    pub fn meta(&self) -> &CommitMeta {
        &self.meta
    }

    pub fn info(&self) -> CommitInfo {
        CommitInfo {
            hash: self.hash,
            parents: self.parents.clone(),
            author: self.meta.author.clone(),
            email: self.meta.email.clone(),
            date: self.meta.timestamp,
            message: self.meta.message.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

/// Arena of commits indexed by hash.
#[derive(Default)]
pub struct CommitGraph {
    commits: RwLock<HashMap<Hash, Arc<Commit>>>,
}

impl CommitGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Hash, Arc<Commit>>> {
        self.commits.read().unwrap_or_else(|poisoned| {
            warn!("commit graph lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Hash, Arc<Commit>>> {
        self.commits.write().unwrap_or_else(|poisoned| {
            warn!("commit graph lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Add a commit. Every parent must already be present.
    pub fn insert(&self, commit: Commit) -> Result<Arc<Commit>, StoreError> {
        let mut commits = self.write();
        if let Some(missing) = commit.parents.iter().find(|p| !commits.contains_key(p)) {
            return Err(StoreError::MissingCommit(*missing));
        }
        let commit = Arc::new(commit);
        debug!(commit = %commit.hash.short(), parents = commit.parents.len(), "commit stored");
        Ok(Arc::clone(commits.entry(commit.hash).or_insert(commit)))
    }

    pub fn get(&self, hash: &Hash) -> Result<Arc<Commit>, StoreError> {
        self.read()
            .get(hash)
            .cloned()
            .ok_or(StoreError::MissingCommit(*hash))
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.read().contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Breadth-first walk over `start` and all its ancestors, each once.
    pub fn ancestors(&self, start: Hash) -> Result<Vec<Arc<Commit>>, StoreError> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([start]);
        let mut out = Vec::new();
        while let Some(hash) = queue.pop_front() {
            if !seen.insert(hash) {
                continue;
            }
            let commit = self.get(&hash)?;
            queue.extend(commit.parents.iter().copied());
            out.push(commit);
        }
        Ok(out)
    }

    /// Whether `ancestor` is reachable from `descendant` (or equal to it).
    pub fn is_ancestor(&self, ancestor: Hash, descendant: Hash) -> Result<bool, StoreError> {
        Ok(self.ancestors(descendant)?.iter().any(|c| c.hash == ancestor))
    }

    /// The nearest common ancestor of two commits, searching outward from
    /// `b` breadth-first.
    pub fn merge_base(&self, a: Hash, b: Hash) -> Result<Option<Hash>, StoreError> {
        let of_a: HashSet<Hash> = self.ancestors(a)?.iter().map(|c| c.hash).collect();
        Ok(self
            .ancestors(b)?
            .into_iter()
            .map(|c| c.hash)
            .find(|h| of_a.contains(h)))
    }

    /// Ancestry of `start`, newest first.
    pub fn log(&self, start: Hash) -> Result<Vec<CommitInfo>, StoreError> {
        let mut commits = self.ancestors(start)?;
        commits.sort_by(|x, y| y.meta.timestamp.cmp(&x.meta.timestamp));
        Ok(commits.iter().map(|c| c.info()).collect())
    }
}
