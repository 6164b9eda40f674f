//! Map tree nodes.

use crate::hash::{ContentHasher, Hash};
use crate::row::{Key, Row};

/// Reference from an internal node to one child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildRef {
    pub first_key: Key,
    pub last_key: Key,
    pub hash: Hash,
    /// Number of entries under this child.
    pub count: u64,
}

/// An immutable tree node. Level 0 is the leaf level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Leaf { entries: Vec<(Key, Row)> },
    Internal { level: u8, children: Vec<ChildRef> },
}

impl Node {
    pub fn empty_leaf() -> Self {
        Node::Leaf {
            entries: Vec::new(),
        }
    }

    pub fn level(&self) -> u8 {
        match self {
            Node::Leaf { .. } => 0,
            Node::Internal { level, .. } => *level,
        }
    }

    /// Total entries reachable from this node.
    pub fn count(&self) -> u64 {
        match self {
            Node::Leaf { entries } => entries.len() as u64,
            Node::Internal { children, .. } => children.iter().map(|c| c.count).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Node::Leaf { entries } => entries.is_empty(),
            Node::Internal { children, .. } => children.is_empty(),
        }
    }

    pub fn first_key(&self) -> Option<&Key> {
        match self {
            Node::Leaf { entries } => entries.first().map(|(k, _)| k),
            Node::Internal { children, .. } => children.first().map(|c| &c.first_key),
        }
    }

    pub fn last_key(&self) -> Option<&Key> {
        match self {
            Node::Leaf { entries } => entries.last().map(|(k, _)| k),
            Node::Internal { children, .. } => children.last().map(|c| &c.last_key),
        }
    }

    pub fn content_hash(&self) -> Hash {
        match self {
            Node::Leaf { entries } => {
                let mut h = ContentHasher::with_domain("leaf");
                h.write_u64(entries.len() as u64);
                for (k, r) in entries {
                    k.hash_into(&mut h);
                    r.hash_into(&mut h);
                }
                h.finish()
            }
            Node::Internal { level, children } => {
                let mut h = ContentHasher::with_domain("internal");
                h.write_u8(*level);
                h.write_u64(children.len() as u64);
                for c in children {
                    h.write_hash(&c.hash);
                    h.write_u64(c.count);
                }
                h.finish()
            }
        }
    }
}
