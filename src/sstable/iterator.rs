//! SSTable iterators — block-level and whole-table forward traversal.
//!
//! - [`BlockIter`] consumes the raw bytes of a single data block and yields
//!   entries in file order.
//! - [`TableIter`] reads the header and index on construction and walks the
//!   table block by block, instantiating a [`BlockIter`] per data block.
//!
//! Both implement the engine-wide [`KvIterator`] contract; a decoding
//! failure is latched and surfaced through `error()` after `advance`
//! returns `false`. Blocks are intentionally small, so the linear scan
//! inside one block is cheap.

use std::path::Path;

use crate::engine::EngineError;
use crate::engine::Item;
use crate::engine::iter::KvIterator;

use super::{TableError, TableReader, decode_entry, slice_checked};

/// Iterator over the entries contained in a single data block.
///
/// Operates on an owned copy of the block bytes; yields entries in the
/// order they were written, which is ascending key order.
pub struct BlockIter {
    data: Vec<u8>,
    cursor: usize,
    current: Option<(Vec<u8>, Item)>,
    err: Option<EngineError>,
}

impl BlockIter {
    /// Creates an iterator over already-loaded block bytes.
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            cursor: 0,
            current: None,
            err: None,
        }
    }

    /// Decodes the next entry, advancing the cursor.
    ///
    /// Returns `Ok(None)` at the end of the block and `Err` when the block
    /// is malformed.
    pub(crate) fn next_entry(&mut self) -> Result<Option<(Vec<u8>, Item)>, TableError> {
        if self.cursor >= self.data.len() {
            return Ok(None);
        }
        let (entry, next) = decode_entry(&self.data, self.cursor)?;
        self.cursor = next;
        Ok(Some(entry))
    }
}

impl KvIterator for BlockIter {
    fn advance(&mut self) -> bool {
        if self.err.is_some() {
            self.current = None;
            return false;
        }
        match self.next_entry() {
            Ok(Some(entry)) => {
                self.current = Some(entry);
                true
            }
            Ok(None) => {
                self.current = None;
                false
            }
            Err(e) => {
                self.err = Some(e.into());
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

    fn error(&self) -> Option<&EngineError> {
        self.err.as_ref()
    }

    fn take_error(&mut self) -> Option<EngineError> {
        self.err.take()
    }

    fn close(&mut self) {
        self.cursor = self.data.len();
        self.current = None;
    }
}

/// Forward iterator over one whole SSTable, from its smallest key.
///
/// Owns its reader (file descriptor and memory map); `close` (or drop)
/// releases them.
pub struct TableIter {
    /// `None` once closed.
    reader: Option<TableReader>,

    /// Index of the next data block to load.
    next_block: usize,

    /// Iterator over the block currently being consumed.
    block: Option<BlockIter>,

    current: Option<(Vec<u8>, Item)>,
    err: Option<EngineError>,
}

impl TableIter {
    /// Opens the table at `path` with an independent file descriptor.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TableError> {
        Ok(Self::new(TableReader::open(path)?))
    }

    /// Wraps an already-open reader.
    pub fn new(reader: TableReader) -> Self {
        Self {
            reader: Some(reader),
            next_block: 0,
            block: None,
            current: None,
            err: None,
        }
    }

    /// Loads the next data block, or returns `Ok(false)` when exhausted.
    fn load_next_block(&mut self) -> Result<bool, TableError> {
        let Some(reader) = self.reader.as_ref() else {
            return Ok(false);
        };
        if self.next_block >= reader.index.len() {
            self.block = None;
            return Ok(false);
        }
        let entry = &reader.index[self.next_block];
        let bytes = slice_checked(&reader.mmap, entry.offset, entry.length)?.to_vec();
        self.next_block += 1;
        self.block = Some(BlockIter::new(bytes));
        Ok(true)
    }
}

impl KvIterator for TableIter {
    fn advance(&mut self) -> bool {
        if self.err.is_some() || self.reader.is_none() {
            self.current = None;
            return false;
        }
        loop {
            if let Some(block) = self.block.as_mut() {
                match block.next_entry() {
                    Ok(Some(entry)) => {
                        self.current = Some(entry);
                        return true;
                    }
                    Ok(None) => self.block = None,
                    Err(e) => {
                        self.err = Some(e.into());
                        self.current = None;
                        return false;
                    }
                }
            }
            match self.load_next_block() {
                Ok(true) => {}
                Ok(false) => {
                    self.current = None;
                    return false;
                }
                Err(e) => {
                    self.err = Some(e.into());
                    self.current = None;
                    return false;
                }
            }
        }
    }

    fn key(&self) -> &[u8] {
        &self.current.as_ref().expect("iterator not positioned").0
    }

    fn value(&self) -> &Item {
        &self.current.as_ref().expect("iterator not positioned").1
    }

    fn error(&self) -> Option<&EngineError> {
        self.err.as_ref()
    }

    fn take_error(&mut self) -> Option<EngineError> {
        self.err.take()
    }

    fn close(&mut self) {
        // Dropping the reader releases the mmap and file descriptor.
        self.reader = None;
        self.block = None;
        self.current = None;
    }
}
