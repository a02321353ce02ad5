//! SSTable writer — builds a complete table file from an ascending entry
//! stream.
//!
//! Entries are appended to an in-memory block buffer; when the buffer
//! passes the target block size it is flushed to disk and its last key and
//! position are remembered for the index. `finish` writes the index block,
//! the bloom block, and the footer, back-patches the entry count into the
//! header, and fsyncs.
//!
//! # Input requirements
//!
//! Keys **must** arrive in strictly ascending byte order; a violation is a
//! caller bug and is rejected with `InvalidArgument`. Tombstones are
//! regular entries with the tombstone flag set and an empty value.

use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Seek, SeekFrom, Write},
    mem,
    path::{Path, PathBuf},
};

use tracing::{debug, warn};

use crate::bloom::BloomFilter;
use crate::engine::Item;

use super::{
    DEFAULT_BLOCK_SIZE, FORMAT_VERSION, HEADER_SIZE, Footer, IndexEntry, TableError,
};

/// Summary of a finished table, enough for the caller to register the file
/// in the manifest without re-opening it.
#[derive(Debug, Clone)]
pub struct BuildSummary {
    /// Number of entries written (tombstones included).
    pub entry_count: u64,

    /// Smallest key in the file.
    pub min_key: Vec<u8>,

    /// Largest key in the file.
    pub max_key: Vec<u8>,

    /// Final file size in bytes.
    pub file_size: u64,
}

/// Streaming writer for one SSTable file.
pub struct TableWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    block_size: usize,
    bloom: BloomFilter,

    /// Buffer of the data block currently being filled.
    current_block: Vec<u8>,

    /// Last key appended to the current block.
    block_last_key: Option<Vec<u8>>,

    /// Last key appended overall, for order enforcement.
    last_key: Option<Vec<u8>>,

    min_key: Option<Vec<u8>>,
    index: Vec<IndexEntry>,

    /// Current write position in the file (header included).
    offset: u64,

    entry_count: u32,
}

impl TableWriter {
    /// Creates a writer targeting `path`, sizing the bloom filter for
    /// `expected_keys` entries.
    pub fn new(path: impl AsRef<Path>, expected_keys: usize) -> Result<Self, TableError> {
        Self::with_block_size(path, expected_keys, DEFAULT_BLOCK_SIZE)
    }

    /// Like [`TableWriter::new`] with an explicit data-block target size.
    pub fn with_block_size(
        path: impl AsRef<Path>,
        expected_keys: usize,
        block_size: usize,
    ) -> Result<Self, TableError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        let mut writer = BufWriter::new(file);

        // Header placeholder; the entry count is back-patched on finish.
        let mut header = [0u8; HEADER_SIZE];
        header[0..4].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        writer.write_all(&header)?;

        Ok(Self {
            writer,
            path,
            block_size,
            bloom: BloomFilter::new(expected_keys),
            current_block: Vec::with_capacity(block_size),
            block_last_key: None,
            last_key: None,
            min_key: None,
            index: Vec::new(),
            offset: HEADER_SIZE as u64,
            entry_count: 0,
        })
    }

    /// Appends one entry. Keys must be strictly ascending.
    pub fn add(&mut self, key: &[u8], item: &Item) -> Result<(), TableError> {
        if let Some(last) = &self.last_key
            && key <= last.as_slice()
        {
            return Err(TableError::InvalidArgument(
                "keys must be supplied in strictly ascending order".into(),
            ));
        }

        self.current_block
            .extend_from_slice(&(key.len() as u32).to_le_bytes());
        self.current_block
            .extend_from_slice(&(item.value.len() as u32).to_le_bytes());
        self.current_block.push(u8::from(item.tombstone));
        self.current_block.extend_from_slice(key);
        self.current_block.extend_from_slice(&item.value);

        self.bloom.add(key);
        self.entry_count += 1;
        if self.min_key.is_none() {
            self.min_key = Some(key.to_vec());
        }
        self.block_last_key = Some(key.to_vec());
        self.last_key = Some(key.to_vec());

        if self.current_block.len() >= self.block_size {
            self.flush_block()?;
        }
        Ok(())
    }

    /// Bytes written to disk so far (flushed blocks only).
    ///
    /// Compaction uses this to decide when to split output files.
    pub fn bytes_written(&self) -> u64 {
        self.offset + self.current_block.len() as u64
    }

    /// Number of entries appended so far.
    pub fn entry_count(&self) -> u64 {
        u64::from(self.entry_count)
    }

    /// Writes the buffered data block and records its index entry.
    fn flush_block(&mut self) -> Result<(), TableError> {
        if self.current_block.is_empty() {
            return Ok(());
        }
        let block = mem::take(&mut self.current_block);
        let last_key = self
            .block_last_key
            .take()
            .ok_or_else(|| TableError::InvalidArgument("block without a last key".into()))?;

        self.writer.write_all(&block)?;
        self.index.push(IndexEntry {
            last_key,
            offset: self.offset,
            length: block.len() as u64,
        });
        self.offset += block.len() as u64;
        Ok(())
    }

    /// Flushes the pending block, writes index + bloom + footer, patches
    /// the header entry count, and fsyncs.
    pub fn finish(mut self) -> Result<BuildSummary, TableError> {
        self.flush_block()?;

        let (Some(min_key), Some(max_key)) = (
            self.min_key.take(),
            self.index.last().map(|e| e.last_key.clone()),
        ) else {
            return Err(TableError::InvalidArgument(
                "cannot finish an empty table".into(),
            ));
        };

        // Index block.
        let mut index_block = Vec::new();
        index_block.extend_from_slice(&(self.index.len() as u32).to_le_bytes());
        for entry in &self.index {
            index_block.extend_from_slice(&(entry.last_key.len() as u32).to_le_bytes());
            index_block.extend_from_slice(&entry.last_key);
            index_block.extend_from_slice(&entry.offset.to_le_bytes());
            index_block.extend_from_slice(&entry.length.to_le_bytes());
        }
        let index_offset = self.offset;
        self.writer.write_all(&index_block)?;
        self.offset += index_block.len() as u64;

        // Bloom block.
        let mut bloom_block = Vec::with_capacity(self.bloom.encoded_len());
        self.bloom.encode_to(&mut bloom_block);
        let bloom_offset = self.offset;
        self.writer.write_all(&bloom_block)?;
        self.offset += bloom_block.len() as u64;

        // Footer.
        let footer = Footer {
            index_offset,
            index_length: index_block.len() as u64,
            bloom_offset,
            bloom_length: bloom_block.len() as u64,
        };
        let mut footer_bytes = Vec::with_capacity(super::FOOTER_SIZE);
        footer.encode_to(&mut footer_bytes);
        self.writer.write_all(&footer_bytes)?;
        self.offset += footer_bytes.len() as u64;

        // Back-patch the header entry count, then make everything durable.
        self.writer.flush()?;
        let mut file = self
            .writer
            .into_inner()
            .map_err(|e| TableError::Io(e.into_error()))?;
        file.seek(SeekFrom::Start(4))?;
        file.write_all(&self.entry_count.to_le_bytes())?;
        file.sync_all()?;

        debug!(
            path = %self.path.display(),
            entries = self.entry_count,
            blocks = self.index.len(),
            bytes = self.offset,
            "SSTable written"
        );

        Ok(BuildSummary {
            entry_count: u64::from(self.entry_count),
            min_key,
            max_key,
            file_size: self.offset,
        })
    }

    /// Abandons the table and removes the partial file.
    pub fn abort(self) {
        let path = self.path.clone();
        drop(self);
        if let Err(e) = fs::remove_file(&path) {
            warn!(path = %path.display(), error = %e, "failed to remove aborted SSTable");
        }
    }
}
