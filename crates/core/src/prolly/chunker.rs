//! Content-defined chunk boundaries.
//!
//! A node ends wherever the hash of its last item falls below a threshold.
//! Because the decision depends only on the item itself, an edit moves at
//! most the boundaries adjacent to it, and every other node of the tree is
//! rebuilt byte-for-byte identical.

use crate::hash::{ContentHasher, Hash};
use crate::row::Key;

/// Expected number of items per node.
pub const TARGET_CHUNK: u32 = 32;

/// Hard cap on node width.
pub const MAX_CHUNK: usize = 256;

const THRESHOLD: u32 = u32::MAX / TARGET_CHUNK;

fn below_threshold(h: &Hash) -> bool {
    let b = h.as_bytes();
    u32::from_be_bytes([b[0], b[1], b[2], b[3]]) < THRESHOLD
}

/// Whether a leaf ends after `key`, given the leaf already holds `len` items
/// including it.
pub fn leaf_boundary(key: &Key, len: usize) -> bool {
    if len >= MAX_CHUNK {
        return true;
    }
    let mut h = ContentHasher::with_domain("boundary");
    key.hash_into(&mut h);
    below_threshold(&h.finish())
}

/// Whether an internal node at `level` ends after the child `child`.
pub fn internal_boundary(child: &Hash, level: u8, len: usize) -> bool {
    if len >= MAX_CHUNK {
        return true;
    }
    let mut h = ContentHasher::with_domain("boundary");
    h.write_u8(level);
    h.write_hash(child);
    below_threshold(&h.finish())
}
