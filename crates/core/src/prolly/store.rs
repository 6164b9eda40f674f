//! Content-addressed node storage.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

use crate::errors::StoreError;
use crate::hash::Hash;

use super::node::Node;

/// Storage for map nodes, addressed by content hash.
///
/// Nodes are immutable once written. Writing a node whose hash is already
/// present is a no-op, which is what gives unchanged subtrees structural
/// sharing between map versions.
pub trait NodeStore: Send + Sync {
    fn get(&self, hash: &Hash) -> Result<Arc<Node>, StoreError>;

    /// Store a node and return its hash.
    fn put(&self, node: Node) -> Hash;

    fn contains(&self, hash: &Hash) -> bool;

    /// Number of distinct nodes held.
    fn node_count(&self) -> usize;
}

/// In-process node store.
#[derive(Default)]
pub struct MemoryNodeStore {
    nodes: RwLock<HashMap<Hash, Arc<Node>>>,
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Hash, Arc<Node>>> {
        self.nodes.read().unwrap_or_else(|poisoned| {
            warn!("node store lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Hash, Arc<Node>>> {
        self.nodes.write().unwrap_or_else(|poisoned| {
            warn!("node store lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

impl NodeStore for MemoryNodeStore {
    fn get(&self, hash: &Hash) -> Result<Arc<Node>, StoreError> {
        self.read()
            .get(hash)
            .cloned()
            .ok_or(StoreError::MissingNode(*hash))
    }

    fn put(&self, node: Node) -> Hash {
        let hash = node.content_hash();
        self.write().entry(hash).or_insert_with(|| Arc::new(node));
        hash
    }

    fn contains(&self, hash: &Hash) -> bool {
        self.read().contains_key(hash)
    }

    fn node_count(&self) -> usize {
        self.read().len()
    }
}
