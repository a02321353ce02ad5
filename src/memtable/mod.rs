//! # Memtable Module
//!
//! The mutable, in-memory write buffer of the storage engine: an ordered
//! map from key (lexicographic byte order) to [`Item`], plus an
//! approximate byte-size counter.
//!
//! ## Design Invariants
//!
//! - Deletes are represented via tombstone items, not physical removal;
//!   a tombstone shadows older values in deeper layers until compaction
//!   garbage-collects it.
//! - The byte-size counter is maintained atomically outside the map lock
//!   so `byte_size()` never blocks behind a writer.
//! - Once sealed by the engine, a memtable receives no further writes; it
//!   is read-only until flushed to an L0 SSTable and then released.
//!
//! ## Concurrency
//!
//! - The engine's write mutex guarantees a single writer; `put`/`delete`
//!   take the inner write lock only for the map mutation itself.
//! - Readers (`get`, `keys`, `iter`) proceed concurrently under the read
//!   lock. The iterator returned by [`Memtable::iter`] owns its read
//!   guard, so the shared lock is held for exactly the iterator's
//!   lifetime and released on drop.
//!
//! All operations are infallible: the map mutation cannot fail, and a
//! poisoned lock is recovered rather than propagated, which is what makes
//! the engine's "durable before in-memory" ordering safe — nothing after
//! the WAL append can fail.


use std::{
    collections::BTreeMap,
    ops::Bound,
    sync::{
        PoisonError, RwLock, RwLockReadGuard,
        atomic::{AtomicUsize, Ordering},
    },
};

use tracing::trace;

use crate::engine::Item;
use crate::engine::iter::KvIterator;

/// Fixed per-entry overhead charged to the byte-size counter, approximating
/// the map node and item bookkeeping around the raw key/value bytes.
const ENTRY_OVERHEAD: usize = 32;

/// The in-memory ordered write buffer.
pub struct Memtable {
    /// Ordered key → item mapping behind a read-write lock.
    map: RwLock<BTreeMap<Vec<u8>, Item>>,

    /// Approximate memory footprint in bytes.
    approximate_bytes: AtomicUsize,
}

impl Default for Memtable {
    fn default() -> Self {
        Self::new()
    }
}

impl Memtable {
    /// Creates an empty memtable.
    pub fn new() -> Self {
        Self {
            map: RwLock::new(BTreeMap::new()),
            approximate_bytes: AtomicUsize::new(0),
        }
    }

    /// Inserts or overwrites a key with a live value.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) {
        let new_len = value.len();
        let key_len = key.len();
        let mut map = self.write_map();
        let old = map.insert(
            key,
            Item {
                value,
                tombstone: false,
            },
        );
        drop(map);
        self.account(key_len, new_len, old.as_ref());
    }

    /// Installs a tombstone for a key.
    pub fn delete(&self, key: Vec<u8>) {
        let key_len = key.len();
        let mut map = self.write_map();
        let old = map.insert(
            key,
            Item {
                value: Vec::new(),
                tombstone: true,
            },
        );
        drop(map);
        self.account(key_len, 0, old.as_ref());
    }

    /// Looks up a key.
    ///
    /// Returns the stored item — which may be a tombstone — or `None` when
    /// the memtable holds no entry for the key at all. Callers must
    /// distinguish the two: a tombstone means "definitely deleted", absence
    /// means "ask the next layer".
    pub fn get(&self, key: &[u8]) -> Option<Item> {
        self.read_map().get(key).cloned()
    }

    /// Returns all keys in ascending order, tombstones included.
    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.read_map().keys().cloned().collect()
    }

    /// Number of entries (tombstones included).
    pub fn len(&self) -> usize {
        self.read_map().len()
    }

    /// Whether the memtable holds no entries.
    pub fn is_empty(&self) -> bool {
        self.read_map().is_empty()
    }

    /// Approximate memory footprint in bytes.
    pub fn byte_size(&self) -> usize {
        self.approximate_bytes.load(Ordering::Acquire)
    }

    /// Forward iterator over all entries in ascending key order.
    ///
    /// The returned iterator holds the shared-read lock until dropped;
    /// writers are blocked for its whole lifetime, so keep it short-lived.
    pub fn iter(&self) -> MemtableIter<'_> {
        MemtableIter {
            guard: Some(self.map.read().unwrap_or_else(PoisonError::into_inner)),
            last_key: None,
            current: None,
        }
    }

    /// Ordered owned copy of the current contents.
    pub fn snapshot(&self) -> Vec<(Vec<u8>, Item)> {
        let mut out = Vec::with_capacity(self.len());
        let mut iter = self.iter();
        while iter.advance() {
            out.push((iter.key().to_vec(), iter.value().clone()));
        }
        out
    }

    /// Returns the current contents (ascending key order) and atomically
    /// replaces the internal map with an empty one, zeroing the counter.
    pub fn snapshot_and_reset(&self) -> Vec<(Vec<u8>, Item)> {
        let mut map = self.write_map();
        let drained = std::mem::take(&mut *map);
        drop(map);
        self.approximate_bytes.store(0, Ordering::Release);

        trace!(entries = drained.len(), "memtable drained for flush");
        drained.into_iter().collect()
    }

    fn read_map(&self) -> RwLockReadGuard<'_, BTreeMap<Vec<u8>, Item>> {
        self.map.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_map(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<Vec<u8>, Item>> {
        self.map.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adjusts the byte counter for an insert that replaced `old`.
    fn account(&self, key_len: usize, new_value_len: usize, old: Option<&Item>) {
        match old {
            Some(old_item) => {
                let old_len = old_item.value.len();
                if new_value_len >= old_len {
                    self.approximate_bytes
                        .fetch_add(new_value_len - old_len, Ordering::AcqRel);
                } else {
                    self.approximate_bytes
                        .fetch_sub(old_len - new_value_len, Ordering::AcqRel);
                }
            }
            None => {
                self.approximate_bytes
                    .fetch_add(key_len + new_value_len + ENTRY_OVERHEAD, Ordering::AcqRel);
            }
        }
    }
}

/// Forward iterator over a memtable.
///
/// Owns the shared-read guard for its whole lifetime, so the memtable
/// cannot be mutated underneath it; dropping (or closing) the iterator
/// releases the lock.
pub struct MemtableIter<'a> {
    /// Read guard pinning the map; `None` once closed.
    guard: Option<RwLockReadGuard<'a, BTreeMap<Vec<u8>, Item>>>,

    /// Key of the current position; the cursor resumes strictly after it.
    last_key: Option<Vec<u8>>,

    current: Option<(Vec<u8>, Item)>,
}

impl KvIterator for MemtableIter<'_> {
    fn advance(&mut self) -> bool {
        let Some(guard) = self.guard.as_ref() else {
            self.current = None;
            return false;
        };
        let range_start = match self.last_key.take() {
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };
        match guard
            .range((range_start, Bound::Unbounded))
            .next()
            .map(|(k, v)| (k.clone(), v.clone()))
        {
            Some((key, item)) => {
                self.last_key = Some(key.clone());
                self.current = Some((key, item));
                true
            }
            None => {
                self.current = None;
                false
            }
        }
    }

    fn key(&self) -> &[u8] {
        &self.current.as_ref().expect("iterator not positioned").0
    }

    fn value(&self) -> &Item {
        &self.current.as_ref().expect("iterator not positioned").1
    }

    fn error(&self) -> Option<&crate::engine::EngineError> {
        None
    }

    fn close(&mut self) {
        // Dropping the guard releases the shared-read lock immediately.
        self.guard = None;
        self.current = None;
        self.last_key = None;
    }
}
