//! Write-Ahead Logging (WAL) Module
//!
//! Durable, append-only mutation log that protects the in-memory write
//! buffer against crashes. Every mutation is appended (and fsynced) here
//! **before** it is applied to the memtable; on startup, pre-existing
//! segments are replayed to reconstruct unflushed state.
//!
//! ## Segments
//!
//! A WAL directory holds one or more segments named `wal-<seq>.log` where
//! `<seq>` is a monotonically increasing integer. The engine appends to a
//! single active segment; rotation opens a fresh segment with the next
//! sequence number and leaves the old one behind until the memtable it
//! covers has been flushed.
//!
//! # On-disk record layout (little-endian)
//!
//! ```text
//! [crc32][key_len: u32][val_len: u32][flag: u8][key][value]
//! ```
//!
//! `flag` is 0 for a put, 1 for a tombstone. The CRC32 (IEEE polynomial)
//! covers `flag || key || value`.
//!
//! # Concurrency model
//!
//! Appends are serialized through an internal `Mutex<File>`; each record is
//! assembled in a scratch buffer and written with a single `write_all`
//! followed by `sync_all`, so an acknowledged append is durable.
//!
//! # Replay guarantees
//!
//! - A truncated tail (crash mid-write) terminates replay **cleanly** —
//!   every fully written record before it is still yielded.
//! - A CRC mismatch yields a corruption error; the failed record and
//!   everything after it are discarded by the caller.

#[cfg(test)]
mod tests;

use std::{
    ffi::OsStr,
    fs::{self, File, OpenOptions},
    io::{self, BufReader, Read, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Fixed bytes preceding the key in every record: crc32 + key_len + val_len + flag.
const RECORD_HEADER_SIZE: usize = 4 + 4 + 4 + 1;

/// Safety cap on a single key or value length during replay. Lengths beyond
/// this are treated as corruption rather than honoured as allocations.
const MAX_PART_SIZE: u32 = 64 * 1024 * 1024;

/// Errors returned by WAL operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A replayed record failed CRC validation or carried an absurd length.
    #[error("WAL corruption: {0}")]
    Corruption(String),
}

/// A single logical mutation carried by the WAL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    /// Insert or update a key.
    Put { key: Vec<u8>, value: Vec<u8> },

    /// Delete a key (tombstone).
    Delete { key: Vec<u8> },
}

impl WalRecord {
    /// Record flag byte as stored on disk.
    fn flag(&self) -> u8 {
        match self {
            WalRecord::Put { .. } => 0,
            WalRecord::Delete { .. } => 1,
        }
    }

    fn key(&self) -> &[u8] {
        match self {
            WalRecord::Put { key, .. } => key,
            WalRecord::Delete { key } => key,
        }
    }

    fn value(&self) -> &[u8] {
        match self {
            WalRecord::Put { value, .. } => value,
            WalRecord::Delete { .. } => &[],
        }
    }

    /// Appends the framed record to `buf`.
    fn encode_to(&self, buf: &mut Vec<u8>) {
        let (key, value, flag) = (self.key(), self.value(), self.flag());

        let mut hasher = Crc32::new();
        hasher.update(&[flag]);
        hasher.update(key);
        hasher.update(value);
        let crc = hasher.finalize();

        buf.extend_from_slice(&crc.to_le_bytes());
        buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
        buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
        buf.push(flag);
        buf.extend_from_slice(key);
        buf.extend_from_slice(value);
    }
}

/// Appender for a single WAL segment.
///
/// Opened on the active segment only; older segments are read through
/// [`Wal::replay`] and never written again.
#[derive(Debug)]
pub struct Wal {
    /// Serialized file handle; appends lock it for the duration of one record.
    file: Mutex<File>,

    /// Path of this segment on disk.
    path: PathBuf,

    /// Segment sequence number parsed from the file name.
    seq: u64,
}

impl Wal {
    /// Opens (or creates) the segment at `path` for appending.
    ///
    /// The file name must follow the `wal-<seq>.log` convention; the
    /// sequence number is recovered from it.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, WalError> {
        let path = path.as_ref();
        let seq = parse_segment_seq(path).ok_or_else(|| {
            WalError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not a WAL segment name: {}", path.display()),
            ))
        })?;

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        info!(path = %path.display(), seq, "WAL segment opened");

        Ok(Self {
            file: Mutex::new(file),
            path: path.to_path_buf(),
            seq,
        })
    }

    /// Appends one record and fsyncs.
    ///
    /// The record is durable when this returns `Ok`.
    pub fn append(&self, record: &WalRecord) -> Result<(), WalError> {
        let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + 64);
        record.encode_to(&mut buf);

        let guard = self
            .file
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut file = &*guard;
        file.write_all(&buf)?;
        file.sync_all()?;

        trace!(seq = self.seq, len = buf.len(), "WAL record appended");
        Ok(())
    }

    /// Appends every record of a batch, then fsyncs once at the end.
    ///
    /// The whole batch becomes durable together; a crash before the final
    /// sync may persist any prefix of the frames, which replay handles as a
    /// truncated tail.
    pub fn append_all(&self, records: &[WalRecord]) -> Result<(), WalError> {
        let mut buf = Vec::with_capacity(records.len() * (RECORD_HEADER_SIZE + 64));
        for record in records {
            record.encode_to(&mut buf);
        }

        let guard = self
            .file
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut file = &*guard;
        file.write_all(&buf)?;
        file.sync_all()?;

        trace!(seq = self.seq, records = records.len(), "WAL batch appended");
        Ok(())
    }

    /// Flushes the segment to disk.
    pub fn sync(&self) -> Result<(), WalError> {
        let guard = self
            .file
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.sync_all()?;
        Ok(())
    }

    /// Path of the underlying segment file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Segment sequence number.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Opens a replay iterator over the segment at `path`.
    ///
    /// Reads records sequentially from offset 0 with an independent file
    /// handle; the segment being replayed is never the active appender.
    pub fn replay(path: impl AsRef<Path>) -> Result<WalReplayIter, WalError> {
        let path = path.as_ref();
        debug!(path = %path.display(), "WAL replay started");
        let file = File::open(path)?;
        Ok(WalReplayIter {
            reader: BufReader::new(file),
            done: false,
        })
    }
}

/// Streaming replay iterator over one WAL segment.
///
/// Yields `Ok(record)` for each well-formed record. A truncated tail ends
/// iteration without an error; a CRC mismatch yields `Err` once and then
/// ends iteration (the caller discards the rest of the segment).
pub struct WalReplayIter {
    reader: BufReader<File>,
    done: bool,
}

impl WalReplayIter {
    fn read_record(&mut self) -> Result<Option<WalRecord>, WalError> {
        let mut header = [0u8; RECORD_HEADER_SIZE];
        match read_exact_or_eof(&mut self.reader, &mut header)? {
            ReadOutcome::Eof => return Ok(None),
            ReadOutcome::Truncated => {
                warn!("WAL segment ends mid-header; stopping replay");
                return Ok(None);
            }
            ReadOutcome::Full => {}
        }

        let stored_crc = u32::from_le_bytes(header[0..4].try_into().expect("4-byte slice"));
        let key_len = u32::from_le_bytes(header[4..8].try_into().expect("4-byte slice"));
        let val_len = u32::from_le_bytes(header[8..12].try_into().expect("4-byte slice"));
        let flag = header[12];

        if key_len > MAX_PART_SIZE || val_len > MAX_PART_SIZE {
            return Err(WalError::Corruption(format!(
                "record lengths out of range (key {key_len}, value {val_len})"
            )));
        }

        let mut key = vec![0u8; key_len as usize];
        match read_exact_or_eof(&mut self.reader, &mut key)? {
            ReadOutcome::Full => {}
            _ => {
                warn!("WAL segment ends mid-key; stopping replay");
                return Ok(None);
            }
        }

        let mut value = vec![0u8; val_len as usize];
        match read_exact_or_eof(&mut self.reader, &mut value)? {
            ReadOutcome::Full => {}
            _ => {
                warn!("WAL segment ends mid-value; stopping replay");
                return Ok(None);
            }
        }

        let mut hasher = Crc32::new();
        hasher.update(&[flag]);
        hasher.update(&key);
        hasher.update(&value);
        if hasher.finalize() != stored_crc {
            return Err(WalError::Corruption("record checksum mismatch".into()));
        }

        match flag {
            0 => Ok(Some(WalRecord::Put { key, value })),
            1 => Ok(Some(WalRecord::Delete { key })),
            other => Err(WalError::Corruption(format!("unknown record flag {other}"))),
        }
    }
}

impl Iterator for WalReplayIter {
    type Item = Result<WalRecord, WalError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_record() {
            Ok(Some(record)) => Some(Ok(record)),
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

enum ReadOutcome {
    /// The buffer was filled completely.
    Full,
    /// Zero bytes were available — clean end of segment.
    Eof,
    /// Some bytes were read but the buffer could not be filled.
    Truncated,
}

/// `read_exact` variant that distinguishes a clean EOF from a torn record.
fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> Result<ReadOutcome, WalError> {
    if buf.is_empty() {
        return Ok(ReadOutcome::Full);
    }
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return Ok(if filled == 0 {
                    ReadOutcome::Eof
                } else {
                    ReadOutcome::Truncated
                });
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(WalError::Io(e)),
        }
    }
    Ok(ReadOutcome::Full)
}

/// Builds the canonical segment file name for `seq`.
pub fn segment_file_name(seq: u64) -> String {
    format!("wal-{seq:06}.log")
}

/// Parses the sequence number out of a `wal-<seq>.log` path.
pub fn parse_segment_seq(path: &Path) -> Option<u64> {
    let name = path.file_name().and_then(OsStr::to_str)?;
    name.strip_prefix("wal-")
        .and_then(|s| s.strip_suffix(".log"))
        .and_then(|s| s.parse::<u64>().ok())
}

/// Lists the WAL segments in `dir`, sorted by ascending sequence number.
pub fn list_segments(dir: impl AsRef<Path>) -> Result<Vec<(u64, PathBuf)>, WalError> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir.as_ref())? {
        let entry = entry?;
        let path = entry.path();
        if path.is_file()
            && let Some(seq) = parse_segment_seq(&path)
        {
            segments.push((seq, path));
        }
    }
    segments.sort_by_key(|(seq, _)| *seq);
    Ok(segments)
}
