//! Versioned ordered map.
//!
//! A probabilistic B-tree: sorted entries are cut into nodes at
//! content-defined boundaries, so the same set of entries always produces
//! the same tree no matter what edit sequence built it. Each node is stored
//! under the hash of its contents, which lets two versions of a map be
//! compared by skipping every subtree they share.

pub mod chunker;
pub mod diff;
pub mod map;
pub mod node;
pub mod store;

pub use diff::{DiffStats, MapDiff, MapDiffEntry};
pub use map::{MapIter, OrderedMap};
pub use node::{ChildRef, Node};
pub use store::{MemoryNodeStore, NodeStore};
