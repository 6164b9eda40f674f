//! Joint traversal of two map versions.
//!
//! Both trees are walked left to right through a queue of pending items per
//! side. A pending item is either an unexpanded subtree or a single entry.
//! When both fronts are subtrees with the same hash the pair is dropped
//! without being read, so the cost of a diff scales with the size of the
//! change rather than the size of the maps.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::errors::StoreError;
use crate::hash::Hash;
use crate::row::{Key, Row};

use super::map::OrderedMap;
use super::node::Node;
use super::store::NodeStore;

/// One key present in either map, with its value on each side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapDiffEntry {
    pub key: Key,
    pub from: Option<Row>,
    pub to: Option<Row>,
}

/// Work counters for one traversal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffStats {
    /// Subtree pairs dropped because their hashes matched.
    pub subtrees_skipped: u64,
    /// Entries under those subtrees that were never visited.
    pub entries_skipped: u64,
    /// Nodes read from the store.
    pub nodes_loaded: u64,
    /// Entry pairs compared key-by-key.
    pub entries_compared: u64,
}

#[derive(Debug, Clone)]
enum Item {
    Subtree {
        hash: Hash,
        level: u8,
        /// `None` for a root, whose range is unknown until it is read.
        first: Option<Key>,
        count: u64,
    },
    Entry(Key, Row),
}

/// Lazy `(key, from, to)` sequence over every key that differs between two
/// maps, in ascending key order.
///
/// Cloning an unstarted diff gives an independent traversal; calling
/// [`OrderedMap::diff`] again restarts from the beginning.
#[derive(Clone)]
pub struct MapDiff {
    from_store: Arc<dyn NodeStore>,
    to_store: Arc<dyn NodeStore>,
    left: VecDeque<Item>,
    right: VecDeque<Item>,
    stats: DiffStats,
    done: bool,
}

enum Side {
    Left,
    Right,
}

enum Step {
    Done,
    SkipBoth,
    Expand(Side),
    ExpandBoth,
    TakeLeft,
    TakeRight,
    Compare,
}

impl MapDiff {
    pub(crate) fn new(from: &OrderedMap, to: &OrderedMap) -> Self {
        let root = |m: &OrderedMap| Item::Subtree {
            hash: m.root(),
            level: u8::MAX,
            first: None,
            count: 0,
        };
        Self {
            from_store: Arc::clone(from.store()),
            to_store: Arc::clone(to.store()),
            left: VecDeque::from([root(from)]),
            right: VecDeque::from([root(to)]),
            stats: DiffStats::default(),
            done: false,
        }
    }

    pub fn stats(&self) -> DiffStats {
        self.stats
    }

    /// Replace the front subtree of one side by its children.
    fn expand(&mut self, side: Side) -> Result<(), StoreError> {
        let (queue, store) = match side {
            Side::Left => (&mut self.left, &self.from_store),
            Side::Right => (&mut self.right, &self.to_store),
        };
        let Some(Item::Subtree { hash, .. }) = queue.pop_front() else {
            return Ok(());
        };
        let node = store.get(&hash)?;
        self.stats.nodes_loaded += 1;
        match node.as_ref() {
            Node::Leaf { entries } => {
                for (k, r) in entries.iter().rev() {
                    queue.push_front(Item::Entry(k.clone(), r.clone()));
                }
            }
            Node::Internal { level, children } => {
                for c in children.iter().rev() {
                    queue.push_front(Item::Subtree {
                        hash: c.hash,
                        level: level - 1,
                        first: Some(c.first_key.clone()),
                        count: c.count,
                    });
                }
            }
        }
        Ok(())
    }

    /// Decide the next move from the two queue fronts.
    fn plan(&self) -> Step {
        match (self.left.front(), self.right.front()) {
            (None, None) => Step::Done,

            (Some(Item::Subtree { hash: lh, .. }), Some(Item::Subtree { hash: rh, .. })) if lh == rh => {
                Step::SkipBoth
            }

            (
                Some(Item::Subtree {
                    level: ll, first: lf, ..
                }),
                Some(Item::Subtree {
                    level: rl, first: rf, ..
                }),
            ) => {
                // Expand whichever subtree starts earlier so the other one
                // stays intact and can still line up with a later identical
                // subtree. On a tie expand the taller one, or both when they
                // sit at the same level.
                match (lf, rf) {
                    (Some(l), Some(r)) if l < r => Step::Expand(Side::Left),
                    (Some(l), Some(r)) if r < l => Step::Expand(Side::Right),
                    _ if ll > rl => Step::Expand(Side::Left),
                    _ if rl > ll => Step::Expand(Side::Right),
                    _ => Step::ExpandBoth,
                }
            }

            (Some(Item::Entry(lk, _)), Some(Item::Subtree { first: rf, .. })) => match rf {
                Some(f) if lk < f => Step::TakeLeft,
                _ => Step::Expand(Side::Right),
            },

            (Some(Item::Subtree { first: lf, .. }), Some(Item::Entry(rk, _))) => match lf {
                Some(f) if rk < f => Step::TakeRight,
                _ => Step::Expand(Side::Left),
            },

            (Some(Item::Subtree { .. }), None) => Step::Expand(Side::Left),
            (None, Some(Item::Subtree { .. })) => Step::Expand(Side::Right),

            (Some(Item::Entry(..)), None) => Step::TakeLeft,
            (None, Some(Item::Entry(..))) => Step::TakeRight,

            (Some(Item::Entry(lk, _)), Some(Item::Entry(rk, _))) => {
                if lk < rk {
                    Step::TakeLeft
                } else if rk < lk {
                    Step::TakeRight
                } else {
                    Step::Compare
                }
            }
        }
    }

    fn step(&mut self) -> Result<Option<MapDiffEntry>, StoreError> {
        loop {
            match self.plan() {
                Step::Done => return Ok(None),
                Step::SkipBoth => {
                    if let Some(Item::Subtree { count, .. }) = self.left.pop_front() {
                        self.stats.subtrees_skipped += 1;
                        self.stats.entries_skipped += count;
                    }
                    self.right.pop_front();
                }
                Step::Expand(side) => self.expand(side)?,
                Step::ExpandBoth => {
                    self.expand(Side::Left)?;
                    self.expand(Side::Right)?;
                }
                Step::TakeLeft => return Ok(self.take_left()),
                Step::TakeRight => return Ok(self.take_right()),
                Step::Compare => {
                    self.stats.entries_compared += 1;
                    if let (Some(Item::Entry(key, from)), Some(Item::Entry(_, to))) =
                        (self.left.pop_front(), self.right.pop_front())
                    {
                        if from != to {
                            return Ok(Some(MapDiffEntry {
                                key,
                                from: Some(from),
                                to: Some(to),
                            }));
                        }
                    }
                }
            }
        }
    }

    fn take_left(&mut self) -> Option<MapDiffEntry> {
        match self.left.pop_front() {
            Some(Item::Entry(key, row)) => Some(MapDiffEntry {
                key,
                from: Some(row),
                to: None,
            }),
            _ => None,
        }
    }

    fn take_right(&mut self) -> Option<MapDiffEntry> {
        match self.right.pop_front() {
            Some(Item::Entry(key, row)) => Some(MapDiffEntry {
                key,
                from: None,
                to: Some(row),
            }),
            _ => None,
        }
    }
}

impl Iterator for MapDiff {
    type Item = Result<MapDiffEntry, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
