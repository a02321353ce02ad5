//! Sorted String Table (SSTable) Module
//!
//! Immutable, sorted on-disk runs of key/value entries. An SSTable is
//! written once by a flush or compaction and never modified; readers map
//! the file and consult the bloom filter and block index so a point lookup
//! touches at most one data block.
//!
//! # On-disk layout (all integers little-endian)
//!
//! ```text
//! [version: u32][entry_count: u32]                         -- header (8 B)
//! [key_len: u32][val_len: u32][flag: u8][key][value] ...   -- data blocks
//! [entry_count: u32]                                       -- index block
//!   per block: [klen: u32][last_key][block_offset: u64][block_length: u64]
//! [bloom filter bytes]                                     -- bloom block
//! [index_offset: u64][index_length: u64]                   -- footer (40 B)
//! [bloom_offset: u64][bloom_length: u64][magic: u64]
//! ```
//!
//! Entries are grouped into data blocks of a target size; keys are strictly
//! ascending within a block and blocks are written in ascending last-key
//! order. `flag` is 0 for a live value, 1 for a tombstone. The header entry
//! count is back-patched when the file is closed.
//!
//! # Sub-modules
//!
//! - [`builder`] — [`TableWriter`] builds a table from an ascending entry
//!   stream.
//! - [`iterator`] — [`BlockIter`] and [`TableIter`] for forward scans.
//!
//! # Concurrency model
//!
//! SSTables are immutable, so reads are lock-free; every reader opens its
//! own file descriptor and memory map and releases them on drop.

pub mod builder;
pub mod iterator;

#[cfg(test)]
mod tests;

pub use builder::{BuildSummary, TableWriter};
pub use iterator::{BlockIter, TableIter};

use std::{fs::File, io, path::Path};

use memmap2::Mmap;
use thiserror::Error;
use tracing::trace;

use crate::bloom::BloomFilter;
use crate::engine::Item;

/// Format version stamped into every table header.
pub(crate) const FORMAT_VERSION: u32 = 1;

/// Fixed header size: version + entry count.
pub(crate) const HEADER_SIZE: usize = 8;

/// Fixed footer size: four u64 block pointers plus the magic.
pub(crate) const FOOTER_SIZE: usize = 40;

/// Per-entry fixed prefix: key_len + val_len + flag.
pub(crate) const ENTRY_HEADER_SIZE: usize = 9;

/// Magic stamped at the very end of every table file.
pub(crate) const FOOTER_MAGIC: u64 = u64::from_le_bytes(*b"STBL.KV1");

/// Default target size of one data block.
pub const DEFAULT_BLOCK_SIZE: usize = 4 * 1024;

/// Errors returned by SSTable operations (read, write, build).
#[derive(Debug, Error)]
pub enum TableError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed file: bad magic, bad version, or out-of-bounds lengths.
    #[error("SSTable corruption: {0}")]
    Corruption(String),

    /// Caller misuse, e.g. keys supplied out of order to the writer.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Result of a point lookup within a single table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// A live value for the key.
    Value(Vec<u8>),

    /// The key is deleted as of this table.
    Tombstone,

    /// This table holds no information about the key.
    Absent,
}

/// One entry of the block index: the last key of a data block and where
/// the block lives in the file.
#[derive(Debug, Clone)]
pub(crate) struct IndexEntry {
    pub(crate) last_key: Vec<u8>,
    pub(crate) offset: u64,
    pub(crate) length: u64,
}

/// Footer pointing at the index and bloom blocks.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Footer {
    pub(crate) index_offset: u64,
    pub(crate) index_length: u64,
    pub(crate) bloom_offset: u64,
    pub(crate) bloom_length: u64,
}

impl Footer {
    pub(crate) fn encode_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.index_offset.to_le_bytes());
        buf.extend_from_slice(&self.index_length.to_le_bytes());
        buf.extend_from_slice(&self.bloom_offset.to_le_bytes());
        buf.extend_from_slice(&self.bloom_length.to_le_bytes());
        buf.extend_from_slice(&FOOTER_MAGIC.to_le_bytes());
    }

    pub(crate) fn decode(buf: &[u8]) -> Result<Self, TableError> {
        if buf.len() != FOOTER_SIZE {
            return Err(TableError::Corruption("short footer".into()));
        }
        let magic = read_u64(buf, 32);
        if magic != FOOTER_MAGIC {
            return Err(TableError::Corruption("bad footer magic".into()));
        }
        Ok(Self {
            index_offset: read_u64(buf, 0),
            index_length: read_u64(buf, 8),
            bloom_offset: read_u64(buf, 16),
            bloom_length: read_u64(buf, 24),
        })
    }
}

pub(crate) fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(buf[at..at + 4].try_into().expect("4-byte slice"))
}

pub(crate) fn read_u64(buf: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(buf[at..at + 8].try_into().expect("8-byte slice"))
}

/// A memory-mapped, immutable table reader.
///
/// Opening validates the footer magic and header version and decodes the
/// block index and bloom filter eagerly; data blocks are only touched when
/// a lookup or scan needs them.
///
/// # Safety
///
/// The `unsafe` mmap is sound because table files are never modified after
/// the writer's final fsync, and the map is read-only.
pub struct TableReader {
    pub(crate) mmap: Mmap,
    pub(crate) index: Vec<IndexEntry>,
    bloom: Option<BloomFilter>,
    entry_count: u32,
}

impl TableReader {
    /// Opens and validates the table at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TableError> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };

        if mmap.len() < HEADER_SIZE + FOOTER_SIZE {
            return Err(TableError::Corruption("file too small".into()));
        }

        let version = read_u32(&mmap, 0);
        if version != FORMAT_VERSION {
            return Err(TableError::Corruption(format!(
                "unsupported format version {version}"
            )));
        }
        let entry_count = read_u32(&mmap, 4);

        let footer = Footer::decode(&mmap[mmap.len() - FOOTER_SIZE..])?;
        let index_bytes = slice_checked(&mmap, footer.index_offset, footer.index_length)?;
        let index = decode_index(index_bytes)?;

        let bloom = if footer.bloom_length > 0 {
            let bloom_bytes = slice_checked(&mmap, footer.bloom_offset, footer.bloom_length)?;
            // A bloom that fails to decode is treated as absent: lookups
            // fall back to the index, which is always authoritative.
            BloomFilter::decode(bloom_bytes)
        } else {
            None
        };

        trace!(
            path = %path.display(),
            entry_count,
            blocks = index.len(),
            "SSTable opened"
        );

        Ok(Self {
            mmap,
            index,
            bloom,
            entry_count,
        })
    }

    /// Number of entries in the table (tombstones included).
    pub fn key_count(&self) -> u64 {
        u64::from(self.entry_count)
    }

    /// Total file size in bytes.
    pub fn file_size(&self) -> u64 {
        self.mmap.len() as u64
    }

    /// Smallest key in the table.
    ///
    /// Read from the first entry of the first data block; only the entry
    /// prefix and key bytes are touched.
    pub fn min_key(&self) -> Result<Vec<u8>, TableError> {
        if self.index.is_empty() {
            return Err(TableError::Corruption("table has no data blocks".into()));
        }
        let first = &self.index[0];
        let block = slice_checked(&self.mmap, first.offset, first.length)?;
        if block.len() < ENTRY_HEADER_SIZE {
            return Err(TableError::Corruption("first block too small".into()));
        }
        let key_len = read_u32(block, 0) as usize;
        if ENTRY_HEADER_SIZE + key_len > block.len() {
            return Err(TableError::Corruption("first entry key out of range".into()));
        }
        Ok(block[ENTRY_HEADER_SIZE..ENTRY_HEADER_SIZE + key_len].to_vec())
    }

    /// Largest key in the table (the last block's last key, straight from
    /// the index).
    pub fn max_key(&self) -> Result<Vec<u8>, TableError> {
        self.index
            .last()
            .map(|e| e.last_key.clone())
            .ok_or_else(|| TableError::Corruption("table has no data blocks".into()))
    }

    /// Point lookup for `key`.
    ///
    /// Pipeline: bloom reject → binary search the index for the first block
    /// whose last key is ≥ `key` → linear scan inside that one block.
    pub fn find(&self, key: &[u8]) -> Result<Lookup, TableError> {
        if let Some(bloom) = &self.bloom
            && !bloom.might_contain(key)
        {
            return Ok(Lookup::Absent);
        }

        let block_idx = match self
            .index
            .binary_search_by(|e| e.last_key.as_slice().cmp(key))
        {
            Ok(i) => i,
            Err(i) if i < self.index.len() => i,
            Err(_) => return Ok(Lookup::Absent), // past the largest key
        };

        let entry = &self.index[block_idx];
        let block = slice_checked(&self.mmap, entry.offset, entry.length)?;

        let mut iter = BlockIter::new(block.to_vec());
        while let Some((entry_key, item)) = iter.next_entry()? {
            match entry_key.as_slice().cmp(key) {
                std::cmp::Ordering::Less => continue,
                std::cmp::Ordering::Equal => {
                    return Ok(if item.tombstone {
                        Lookup::Tombstone
                    } else {
                        Lookup::Value(item.value)
                    });
                }
                std::cmp::Ordering::Greater => break,
            }
        }
        Ok(Lookup::Absent)
    }
}

/// Convenience wrapper: open the table at `path` and look up one key.
pub fn find(path: impl AsRef<Path>, key: &[u8]) -> Result<Lookup, TableError> {
    TableReader::open(path)?.find(key)
}

/// Bounds-checked slice of the mapped file.
pub(crate) fn slice_checked(mmap: &Mmap, offset: u64, length: u64) -> Result<&[u8], TableError> {
    let start = usize::try_from(offset)
        .map_err(|_| TableError::Corruption("block offset exceeds addressable range".into()))?;
    let len = usize::try_from(length)
        .map_err(|_| TableError::Corruption("block length exceeds addressable range".into()))?;
    let end = start
        .checked_add(len)
        .ok_or_else(|| TableError::Corruption("block range overflows".into()))?;
    if end > mmap.len() {
        return Err(TableError::Corruption("block out of range".into()));
    }
    Ok(&mmap[start..end])
}

/// Decodes the index block into its entries.
fn decode_index(buf: &[u8]) -> Result<Vec<IndexEntry>, TableError> {
    if buf.len() < 4 {
        return Err(TableError::Corruption("short index block".into()));
    }
    let count = read_u32(buf, 0) as usize;
    let mut entries = Vec::with_capacity(count);
    let mut pos = 4;

    for _ in 0..count {
        if pos + 4 > buf.len() {
            return Err(TableError::Corruption("truncated index entry".into()));
        }
        let klen = read_u32(buf, pos) as usize;
        pos += 4;
        if pos + klen + 16 > buf.len() {
            return Err(TableError::Corruption("truncated index entry".into()));
        }
        let last_key = buf[pos..pos + klen].to_vec();
        pos += klen;
        let offset = read_u64(buf, pos);
        pos += 8;
        let length = read_u64(buf, pos);
        pos += 8;
        entries.push(IndexEntry {
            last_key,
            offset,
            length,
        });
    }

    Ok(entries)
}

/// Decodes one entry at `pos` inside a block buffer.
///
/// Returns the decoded `(key, item)` and the position of the next entry,
/// or a corruption error when the buffer ends mid-entry.
pub(crate) fn decode_entry(buf: &[u8], pos: usize) -> Result<((Vec<u8>, Item), usize), TableError> {
    if pos + ENTRY_HEADER_SIZE > buf.len() {
        return Err(TableError::Corruption("truncated entry header".into()));
    }
    let key_len = read_u32(buf, pos) as usize;
    let val_len = read_u32(buf, pos + 4) as usize;
    let flag = buf[pos + 8];
    let data_start = pos + ENTRY_HEADER_SIZE;

    let data_end = data_start
        .checked_add(key_len)
        .and_then(|n| n.checked_add(val_len))
        .ok_or_else(|| TableError::Corruption("entry lengths overflow".into()))?;
    if data_end > buf.len() {
        return Err(TableError::Corruption("entry data out of range".into()));
    }

    let tombstone = match flag {
        0 => false,
        1 => true,
        other => {
            return Err(TableError::Corruption(format!("unknown entry flag {other}")));
        }
    };

    let key = buf[data_start..data_start + key_len].to_vec();
    let value = buf[data_start + key_len..data_end].to_vec();

    Ok(((key, Item { value, tombstone }), data_end))
}
