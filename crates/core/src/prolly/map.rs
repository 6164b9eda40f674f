//! The immutable ordered map.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::errors::StoreError;
use crate::hash::Hash;
use crate::row::{Key, Row};

use super::chunker;
use super::diff::MapDiff;
use super::node::{ChildRef, Node};
use super::store::NodeStore;

/// A content-addressed, immutable, sorted `Key -> Row` map.
///
/// Cloning is cheap: a map is a root hash plus a handle to the node store.
/// Edits return a new map and leave the receiver untouched.
#[derive(Clone)]
pub struct OrderedMap {
    root: Hash,
    store: Arc<dyn NodeStore>,
}

impl fmt::Debug for OrderedMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderedMap").field("root", &self.root).finish()
    }
}

impl PartialEq for OrderedMap {
    fn eq(&self, other: &Self) -> bool {
        self.root == other.root
    }
}

impl Eq for OrderedMap {}

impl OrderedMap {
    pub fn empty(store: Arc<dyn NodeStore>) -> Self {
        let root = store.put(Node::empty_leaf());
        Self { root, store }
    }

    /// Build a map from entries in any order. Later duplicates win.
    pub fn from_entries(store: Arc<dyn NodeStore>, entries: impl IntoIterator<Item = (Key, Row)>) -> Self {
        let sorted: BTreeMap<Key, Row> = entries.into_iter().collect();
        let root = build(store.as_ref(), sorted.into_iter());
        Self { root, store }
    }

    /// Reopen a map from its root hash.
    pub fn load(store: Arc<dyn NodeStore>, root: Hash) -> Result<Self, StoreError> {
        store.get(&root)?;
        Ok(Self { root, store })
    }

    pub fn root(&self) -> Hash {
        self.root
    }

    pub fn store(&self) -> &Arc<dyn NodeStore> {
        &self.store
    }

    pub fn len(&self) -> Result<u64, StoreError> {
        Ok(self.store.get(&self.root)?.count())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.store.get(&self.root)?.is_empty())
    }

    pub fn get(&self, key: &Key) -> Result<Option<Row>, StoreError> {
        let mut node = self.store.get(&self.root)?;
        loop {
            let next = match node.as_ref() {
                Node::Leaf { entries } => {
                    return Ok(entries
                        .binary_search_by(|(k, _)| k.cmp(key))
                        .ok()
                        .map(|i| entries[i].1.clone()));
                }
                Node::Internal { children, .. } => {
                    let idx = children.partition_point(|c| c.last_key < *key);
                    match children.get(idx) {
                        Some(child) => child.hash,
                        None => return Ok(None),
                    }
                }
            };
            node = self.store.get(&next)?;
        }
    }

    pub fn contains_key(&self, key: &Key) -> Result<bool, StoreError> {
        Ok(self.get(key)?.is_some())
    }

    /// Entries in ascending key order.
    pub fn iter(&self) -> MapIter {
        MapIter {
            store: Arc::clone(&self.store),
            stack: Vec::new(),
            root: Some(self.root),
            failed: false,
        }
    }

    /// Apply a batch of edits: `Some(row)` upserts, `None` deletes.
    ///
    /// Only the nodes around each edited key are re-chunked, up to the
    /// point where the new boundaries fall back in line with the old ones;
    /// each level above then re-chunks just the parents of what changed.
    /// The result is the tree [`OrderedMap::from_entries`] would build for
    /// the same entries.
    pub fn edit(&self, edits: impl IntoIterator<Item = (Key, Option<Row>)>) -> Result<OrderedMap, StoreError> {
        let edits: BTreeMap<Key, Option<Row>> = edits.into_iter().collect();
        if edits.is_empty() {
            return Ok(self.clone());
        }
        let store = self.store.as_ref();
        let top = store.get(&self.root)?;
        if top.is_empty() {
            let root = build(store, edits.into_iter().filter_map(|(k, r)| r.map(|r| (k, r))));
            return Ok(self.with_root(root));
        }

        let height = top.level();
        let edits = edits.into_iter().map(|(key, row)| Splice {
            first: key.clone(),
            last: key.clone(),
            items: row.map(|r| (key, r)).into_iter().collect(),
        });
        let mut splices = rewrite_level(store, self.root, 0, edits.collect())?;
        for level in 1..=height {
            splices = rewrite_level(store, self.root, level, splices)?;
        }

        let refs: Vec<ChildRef> = splices.into_iter().flat_map(|s| s.items).collect();
        let root = match refs.len() {
            0 => store.put(Node::empty_leaf()),
            1 => collapse(store, refs[0].hash)?,
            _ => build_levels(store, refs, height.saturating_add(1)),
        };
        debug!(height, root = %root.short(), "map edited");
        Ok(self.with_root(root))
    }

    fn with_root(&self, root: Hash) -> Self {
        Self {
            root,
            store: Arc::clone(&self.store),
        }
    }

    /// Joint traversal against a newer map. See [`MapDiff`].
    pub fn diff(&self, to: &OrderedMap) -> MapDiff {
        MapDiff::new(self, to)
    }
}

/// Chunk sorted entries into leaves, then chunk child references level by
/// level until a single root remains.
fn build(store: &dyn NodeStore, entries: impl Iterator<Item = (Key, Row)>) -> Hash {
    let mut refs: Vec<ChildRef> = Vec::new();
    let mut chunk: Vec<(Key, Row)> = Vec::new();

    for (key, row) in entries {
        let boundary = chunker::leaf_boundary(&key, chunk.len() + 1);
        chunk.push((key, row));
        if boundary {
            refs.push(flush_leaf(store, std::mem::take(&mut chunk)));
        }
    }
    if !chunk.is_empty() {
        refs.push(flush_leaf(store, chunk));
    }
    if refs.is_empty() {
        return store.put(Node::empty_leaf());
    }
    build_levels(store, refs, 1)
}

/// Chunk `refs` into internal nodes starting at `level` until one remains.
fn build_levels(store: &dyn NodeStore, mut refs: Vec<ChildRef>, mut level: u8) -> Hash {
    while refs.len() > 1 {
        let mut next = Vec::new();
        let mut group: Vec<ChildRef> = Vec::new();
        for child in refs {
            let boundary = chunker::internal_boundary(&child.hash, level, group.len() + 1);
            group.push(child);
            if boundary {
                next.push(flush_internal(store, level, std::mem::take(&mut group)));
            }
        }
        if !group.is_empty() {
            next.push(flush_internal(store, level, group));
        }
        refs = next;
        level = level.saturating_add(1);
    }

    refs.first().map(|r| r.hash).unwrap_or_else(|| store.put(Node::empty_leaf()))
}

/// Skip internal nodes with a single child; the root of a built tree is the
/// lowest level holding one node.
fn collapse(store: &dyn NodeStore, mut hash: Hash) -> Result<Hash, StoreError> {
    loop {
        let node = store.get(&hash)?;
        match node.as_ref() {
            Node::Internal { children, .. } if children.len() == 1 => hash = children[0].hash,
            _ => return Ok(hash),
        }
    }
}

// ---------------------------------------------------------------------------
// Incremental rewrite
// ---------------------------------------------------------------------------

/// Something a node holds: an entry in a leaf, a child reference in an
/// internal node.
trait Item: Sized {
    fn first_key(&self) -> &Key;
    fn last_key(&self) -> &Key;
    fn boundary(&self, level: u8, len: usize) -> bool;
    fn items(node: &Node) -> Result<Vec<Self>, StoreError>;
    fn flush(store: &dyn NodeStore, level: u8, items: Vec<Self>) -> ChildRef;
}

impl Item for (Key, Row) {
    fn first_key(&self) -> &Key {
        &self.0
    }

    fn last_key(&self) -> &Key {
        &self.0
    }

    fn boundary(&self, _level: u8, len: usize) -> bool {
        chunker::leaf_boundary(&self.0, len)
    }

    fn items(node: &Node) -> Result<Vec<Self>, StoreError> {
        match node {
            Node::Leaf { entries } => Ok(entries.clone()),
            Node::Internal { level, .. } => Err(StoreError::Corrupt(format!("expected leaf, found level {level}"))),
        }
    }

    fn flush(store: &dyn NodeStore, _level: u8, items: Vec<Self>) -> ChildRef {
        flush_leaf(store, items)
    }
}

impl Item for ChildRef {
    fn first_key(&self) -> &Key {
        &self.first_key
    }

    fn last_key(&self) -> &Key {
        &self.last_key
    }

    fn boundary(&self, level: u8, len: usize) -> bool {
        chunker::internal_boundary(&self.hash, level, len)
    }

    fn items(node: &Node) -> Result<Vec<Self>, StoreError> {
        match node {
            Node::Internal { children, .. } => Ok(children.clone()),
            Node::Leaf { .. } => Err(StoreError::Corrupt("expected internal node, found leaf".into())),
        }
    }

    fn flush(store: &dyn NodeStore, level: u8, items: Vec<Self>) -> ChildRef {
        flush_internal(store, level, items)
    }
}

/// Replace the old items keyed within `first..=last` with `items`.
struct Splice<I> {
    first: Key,
    last: Key,
    items: Vec<I>,
}

/// Position on one node of a given level, with the path from the root.
struct Cursor {
    /// Internal nodes above the current one, with the child index taken.
    path: Vec<(Arc<Node>, usize)>,
    node: Arc<Node>,
}

impl Cursor {
    /// The node at `level` whose key range covers `key`, or the last one.
    fn seek(store: &dyn NodeStore, root: Hash, level: u8, key: &Key) -> Result<Self, StoreError> {
        let mut path = Vec::new();
        let mut node = store.get(&root)?;
        while node.level() > level {
            let kids = children(&node)?;
            let idx = kids.partition_point(|c| c.last_key < *key).min(kids.len() - 1);
            let next = kids[idx].hash;
            path.push((node, idx));
            node = store.get(&next)?;
        }
        Ok(Self { path, node })
    }

    fn is_last(&self) -> bool {
        self.path
            .iter()
            .all(|(n, idx)| children(n).map(|c| idx + 1 >= c.len()).unwrap_or(true))
    }

    /// Step to the next node on the same level. The caller checks
    /// [`Cursor::is_last`] first.
    fn advance(&mut self, store: &dyn NodeStore) -> Result<(), StoreError> {
        let depth = self.path.len();
        while let Some((node, idx)) = self.path.pop() {
            if idx + 1 < children(&node)?.len() {
                self.path.push((node, idx + 1));
                break;
            }
        }
        if self.path.is_empty() {
            return Err(StoreError::Corrupt("cursor advanced past the last node".into()));
        }
        loop {
            let Some((parent, idx)) = self.path.last() else {
                return Err(StoreError::Corrupt("cursor lost its path".into()));
            };
            let child = store.get(&children(parent)?[*idx].hash)?;
            if self.path.len() == depth {
                self.node = child;
                return Ok(());
            }
            self.path.push((child, 0));
        }
    }
}

fn children(node: &Node) -> Result<&[ChildRef], StoreError> {
    match node {
        Node::Internal { children, .. } if !children.is_empty() => Ok(children),
        Node::Internal { .. } => Err(StoreError::Corrupt("internal node without children".into())),
        Node::Leaf { .. } => Err(StoreError::Corrupt("expected internal node, found leaf".into())),
    }
}

/// Apply `splices` to the items of the level-`level` nodes of the tree at
/// `root`, returning the replacements for their parents' child references.
///
/// A window opens at the start of the node holding the next splice and
/// closes at the end of an old node once the chunker has just cut a
/// boundary there; from that point on the old nodes are unchanged.
fn rewrite_level<I: Item>(
    store: &dyn NodeStore,
    root: Hash,
    level: u8,
    splices: Vec<Splice<I>>,
) -> Result<Vec<Splice<ChildRef>>, StoreError> {
    let mut out = Vec::new();
    let mut pending = splices.into_iter().peekable();

    while let Some(next) = pending.peek() {
        let mut cursor = Cursor::seek(store, root, level, &next.first)?;
        let first = cursor
            .node
            .first_key()
            .cloned()
            .ok_or_else(|| StoreError::Corrupt(format!("empty node at level {level}")))?;
        let mut chunk: Vec<I> = Vec::new();
        let mut made: Vec<ChildRef> = Vec::new();
        let mut skip: Option<Key> = None;

        let feed = |chunk: &mut Vec<I>, made: &mut Vec<ChildRef>, item: I| {
            let boundary = item.boundary(level, chunk.len() + 1);
            chunk.push(item);
            if boundary {
                made.push(I::flush(store, level, std::mem::take(chunk)));
            }
        };

        loop {
            let node_last = cursor
                .node
                .last_key()
                .cloned()
                .ok_or_else(|| StoreError::Corrupt(format!("empty node at level {level}")))?;
            for item in I::items(&cursor.node)? {
                while let Some(splice) = pending.next_if(|s| s.first <= *item.first_key()) {
                    for new in splice.items {
                        feed(&mut chunk, &mut made, new);
                    }
                    skip = Some(splice.last);
                }
                if skip.as_ref().is_some_and(|s| item.last_key() <= s) {
                    continue;
                }
                feed(&mut chunk, &mut made, item);
            }

            if cursor.is_last() {
                for splice in pending.by_ref() {
                    for new in splice.items {
                        feed(&mut chunk, &mut made, new);
                    }
                }
                if !chunk.is_empty() {
                    made.push(I::flush(store, level, std::mem::take(&mut chunk)));
                }
                out.push(Splice {
                    first,
                    last: node_last,
                    items: made,
                });
                break;
            }

            let spans_next = skip.as_ref().is_some_and(|s| *s > node_last);
            if chunk.is_empty() && !spans_next {
                out.push(Splice {
                    first,
                    last: node_last,
                    items: made,
                });
                break;
            }
            cursor.advance(store)?;
        }
    }
    Ok(out)
}

fn flush_leaf(store: &dyn NodeStore, entries: Vec<(Key, Row)>) -> ChildRef {
    let first_key = entries[0].0.clone();
    let last_key = entries[entries.len() - 1].0.clone();
    let count = entries.len() as u64;
    let hash = store.put(Node::Leaf { entries });
    ChildRef {
        first_key,
        last_key,
        hash,
        count,
    }
}

fn flush_internal(store: &dyn NodeStore, level: u8, children: Vec<ChildRef>) -> ChildRef {
    let first_key = children[0].first_key.clone();
    let last_key = children[children.len() - 1].last_key.clone();
    let count = children.iter().map(|c| c.count).sum();
    let hash = store.put(Node::Internal { level, children });
    ChildRef {
        first_key,
        last_key,
        hash,
        count,
    }
}

// ---------------------------------------------------------------------------
// Iteration
// ---------------------------------------------------------------------------

/// In-order iterator over a map. A store error is yielded once and ends
/// the iteration.
pub struct MapIter {
    store: Arc<dyn NodeStore>,
    stack: Vec<(Arc<Node>, usize)>,
    root: Option<Hash>,
    failed: bool,
}

impl Iterator for MapIter {
    type Item = Result<(Key, Row), StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if let Some(root) = self.root.take() {
            match self.store.get(&root) {
                Ok(node) => self.stack.push((node, 0)),
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
        loop {
            let (node, idx) = self.stack.last_mut()?;
            match node.as_ref() {
                Node::Leaf { entries } => {
                    if let Some((k, r)) = entries.get(*idx) {
                        *idx += 1;
                        return Some(Ok((k.clone(), r.clone())));
                    }
                    self.stack.pop();
                }
                Node::Internal { children, .. } => {
                    let Some(child) = children.get(*idx) else {
                        self.stack.pop();
                        continue;
                    };
                    *idx += 1;
                    let hash = child.hash;
                    match self.store.get(&hash) {
                        Ok(n) => self.stack.push((n, 0)),
                        Err(e) => {
                            self.failed = true;
                            return Some(Err(e));
                        }
                    }
                }
            }
        }
    }
}
