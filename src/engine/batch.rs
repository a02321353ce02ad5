//! Batch — a grouped, atomically applied sequence of mutations.
//!
//! A batch collects puts and deletes in order and hands them to
//! [`Engine::apply_batch`](super::Engine::apply_batch), which makes the
//! whole group durable with a single fsync and applies it all-or-nothing.
//! Entries are applied in list order, so a later entry on the same key
//! shadows an earlier one.

use crate::wal::WalRecord;

/// One entry of a batch: a put or a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub tombstone: bool,
}

impl BatchEntry {
    pub(crate) fn to_wal_record(&self) -> WalRecord {
        if self.tombstone {
            WalRecord::Delete {
                key: self.key.clone(),
            }
        } else {
            WalRecord::Put {
                key: self.key.clone(),
                value: self.value.clone(),
            }
        }
    }
}

/// An ordered group of mutations, owned by the caller until applied.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    entries: Vec<BatchEntry>,
}

impl Batch {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a put.
    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.entries.push(BatchEntry {
            key: key.into(),
            value: value.into(),
            tombstone: false,
        });
    }

    /// Appends a delete.
    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.entries.push(BatchEntry {
            key: key.into(),
            value: Vec::new(),
            tombstone: true,
        });
    }

    /// Number of entries in the batch.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the batch holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }
}
