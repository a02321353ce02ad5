//! Iterator framework — the engine-wide traversal contract and the
//! heap-based merging iterator that fuses every source into one ordered
//! stream.
//!
//! All iterators in the engine expose the same capability set:
//! `advance`/`key`/`value`/`error`/`close`. Memtables, single data blocks,
//! whole SSTables, and the merging union all implement [`KvIterator`], so
//! the merge layer and the compaction pipeline are agnostic about where
//! entries come from.
//!
//! ## Merge semantics
//!
//! [`MergingIter`] maintains a min-heap keyed by `(current key, child
//! index)`. Children **must** be supplied in priority order, newest first:
//! active memtable, then immutable memtables newest→oldest, then L0 tables
//! newest→oldest, then deeper levels ascending (within a level, ascending
//! by min-key). When several children sit on the same key, the first heap
//! pop is the lowest child index — the newest version — and the remaining
//! duplicates are popped, advanced, and discarded. In live mode winning
//! tombstones are suppressed; in raw mode (compaction) they are yielded so
//! deeper levels stay shadowed.
//!
//! Any child error short-circuits `advance` to `false` and is surfaced
//! through `error()`.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use super::{EngineError, Item};

/// The uniform traversal contract shared by every iterator in the engine.
///
/// Usage pattern:
///
/// ```rust,ignore
/// while iter.advance() {
///     consume(iter.key(), iter.value());
/// }
/// if let Some(e) = iter.error() { /* advance stopped on a failure */ }
/// ```
///
/// `key`/`value` may only be called while positioned, i.e. after an
/// `advance` that returned `true`. `close` releases held resources (file
/// descriptors, read locks); after `close`, `advance` returns `false`.
/// Iterators that hold resources also release them on drop.
pub trait KvIterator {
    /// Moves to the next entry; returns whether a current position exists.
    fn advance(&mut self) -> bool;

    /// Key at the current position.
    fn key(&self) -> &[u8];

    /// Item at the current position.
    fn value(&self) -> &Item;

    /// Terminal error that caused `advance` to return `false`, if any.
    fn error(&self) -> Option<&EngineError>;

    /// Takes ownership of the terminal error for propagation.
    fn take_error(&mut self) -> Option<EngineError> {
        None
    }

    /// Releases resources. No other operation is valid afterwards.
    fn close(&mut self);
}

/// Iterator over an owned, ordered snapshot of `(key, item)` entries.
///
/// The engine's forward iterator snapshots each memtable under its read
/// lock and walks the copies through this type, so no lock outlives
/// iterator construction.
pub struct SnapshotIter {
    entries: Vec<(Vec<u8>, Item)>,
    next: usize,
    current: Option<usize>,
}

impl SnapshotIter {
    /// Wraps entries that are already in ascending key order.
    pub fn new(entries: Vec<(Vec<u8>, Item)>) -> Self {
        Self {
            entries,
            next: 0,
            current: None,
        }
    }
}

impl KvIterator for SnapshotIter {
    fn advance(&mut self) -> bool {
        if self.next < self.entries.len() {
            self.current = Some(self.next);
            self.next += 1;
            true
        } else {
            self.current = None;
            false
        }
    }

    fn key(&self) -> &[u8] {
        &self.entries[self.current.expect("iterator not positioned")].0
    }

    fn value(&self) -> &Item {
        &self.entries[self.current.expect("iterator not positioned")].1
    }

    fn error(&self) -> Option<&EngineError> {
        None
    }

    fn close(&mut self) {
        self.next = self.entries.len();
        self.current = None;
    }
}

/// Heap entry: the current key of one child, ordered `(key ASC, child ASC)`
/// through a reversed `Ord` so the `BinaryHeap` pops the smallest first.
struct HeapEntry {
    key: Vec<u8>,
    child: usize,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| self.child.cmp(&other.child))
            .reverse()
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.child == other.child
    }
}

impl Eq for HeapEntry {}

/// Heap-ordered union of child iterators: each key is emitted exactly
/// once, the newest (highest-priority) version wins.
pub struct MergingIter {
    children: Vec<Box<dyn KvIterator>>,
    heap: BinaryHeap<HeapEntry>,
    current: Option<(Vec<u8>, Item)>,

    /// Index of the child whose error terminated the merge, if any.
    err_child: Option<usize>,

    /// Raw mode: yield winning tombstones instead of suppressing them.
    keep_tombstones: bool,

    closed: bool,
}

impl MergingIter {
    /// Live-mode merge: tombstones suppress their key and are not yielded.
    pub fn new(children: Vec<Box<dyn KvIterator>>) -> Self {
        Self::build(children, false)
    }

    /// Raw-mode merge for compaction: winning tombstones are yielded.
    pub fn with_tombstones(children: Vec<Box<dyn KvIterator>>) -> Self {
        Self::build(children, true)
    }

    fn build(mut children: Vec<Box<dyn KvIterator>>, keep_tombstones: bool) -> Self {
        let mut heap = BinaryHeap::with_capacity(children.len());
        let mut err_child = None;

        // Seed the heap with each child's head; children that are
        // immediately exhausted are omitted.
        for (idx, child) in children.iter_mut().enumerate() {
            if child.advance() {
                heap.push(HeapEntry {
                    key: child.key().to_vec(),
                    child: idx,
                });
            } else if child.error().is_some() && err_child.is_none() {
                err_child = Some(idx);
            }
        }

        Self {
            children,
            heap,
            current: None,
            err_child,
            keep_tombstones,
            closed: false,
        }
    }

    /// Advances `idx` and re-inserts its new head; returns `false` when the
    /// child failed (error latched).
    fn step_child(&mut self, idx: usize) -> bool {
        if self.children[idx].advance() {
            self.heap.push(HeapEntry {
                key: self.children[idx].key().to_vec(),
                child: idx,
            });
            true
        } else if self.children[idx].error().is_some() {
            self.err_child = Some(idx);
            false
        } else {
            true
        }
    }
}

impl KvIterator for MergingIter {
    fn advance(&mut self) -> bool {
        if self.closed || self.err_child.is_some() {
            self.current = None;
            return false;
        }
        loop {
            let Some(top) = self.heap.pop() else {
                self.current = None;
                return false;
            };
            let key = top.key;
            let winner = top.child;
            let item = self.children[winner].value().clone();

            // Discard every other version of this key, advancing the
            // children that supplied them.
            while let Some(peek) = self.heap.peek() {
                if peek.key != key {
                    break;
                }
                let dup = self.heap.pop().expect("peeked entry exists");
                if !self.step_child(dup.child) {
                    self.current = None;
                    return false;
                }
            }

            if !self.step_child(winner) {
                self.current = None;
                return false;
            }

            if item.tombstone && !self.keep_tombstones {
                continue;
            }
            self.current = Some((key, item));
            return true;
        }
    }

    fn key(&self) -> &[u8] {
        &self.current.as_ref().expect("iterator not positioned").0
    }

    fn value(&self) -> &Item {
        &self.current.as_ref().expect("iterator not positioned").1
    }

    fn error(&self) -> Option<&EngineError> {
        self.err_child.and_then(|idx| self.children[idx].error())
    }

    fn take_error(&mut self) -> Option<EngineError> {
        self.err_child
            .and_then(|idx| self.children[idx].take_error())
    }

    fn close(&mut self) {
        for child in &mut self.children {
            child.close();
        }
        self.heap.clear();
        self.current = None;
        self.closed = true;
    }
}

/// The engine's public forward iterator: a unified ordered stream of live
/// keys over a point-in-time view of the whole store.
///
/// Built over snapshots of the active and immutable memtables plus every
/// live SSTable (each opened with its own file descriptor); tombstones are
/// suppressed and each key is emitted once, newest version first. Also
/// usable as a plain `Iterator` of `(key, value)` pairs.
pub struct EngineIterator {
    merge: MergingIter,
}

impl EngineIterator {
    pub(crate) fn new(merge: MergingIter) -> Self {
        Self { merge }
    }
}

impl KvIterator for EngineIterator {
    fn advance(&mut self) -> bool {
        self.merge.advance()
    }

    fn key(&self) -> &[u8] {
        self.merge.key()
    }

    fn value(&self) -> &Item {
        self.merge.value()
    }

    fn error(&self) -> Option<&EngineError> {
        self.merge.error()
    }

    fn take_error(&mut self) -> Option<EngineError> {
        self.merge.take_error()
    }

    fn close(&mut self) {
        self.merge.close();
    }
}

impl Iterator for EngineIterator {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.merge.advance() {
            Some((self.merge.key().to_vec(), self.merge.value().value.clone()))
        } else {
            None
        }
    }
}
