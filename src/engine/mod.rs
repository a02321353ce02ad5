//! # LSM Storage Engine
//!
//! The orchestration layer: lifecycle, the mutation path, the read path,
//! and the flush/compaction pipelines over the lower-level modules.
//!
//! ## Design Overview
//!
//! Data lives in three layers, queried newest-first:
//!
//! 1. **Active memtable** — the in-memory buffer receiving writes, covered
//!    by the active WAL segment.
//! 2. **Immutable memtables** — sealed buffers awaiting flush, each tied
//!    to the WAL segment(s) holding its records.
//! 3. **SSTables** — immutable sorted runs on disk, organised in levels:
//!    L0 files may overlap and are read newest-first; L1 and deeper are
//!    non-overlapping so a lookup touches at most one file per level.
//!
//! A write is appended to the WAL (fsynced) before it touches the
//! memtable, so an acknowledged mutation survives a crash. When the
//! memtable crosses the entry-count or byte-size threshold it is sealed,
//! handed to the background flush task, and replaced by a fresh one
//! backed by a fresh WAL segment.
//!
//! ## Concurrency Model
//!
//! - One writer at a time: `put`/`delete`/`apply_batch` and rotation are
//!   serialized by the engine write mutex.
//! - Readers never take the write mutex: `get` and iterator construction
//!   use shared-read locks on the active memtable, the immutable list,
//!   and the current [`Version`], each held only long enough to clone an
//!   `Arc`.
//! - One background flush task consumes sealed memtables from a bounded
//!   channel and triggers compaction after each flush; it re-enters the
//!   write mutex only briefly to swap the version.
//!
//! ## Lifecycle
//!
//! `Opening → Open → Closing → Closed`. Mutations are rejected unless the
//! engine is `Open`; reads are accepted while `Open` or `Closing`. `close`
//! is idempotent.
//!
//! ## Failure semantics
//!
//! - WAL append errors propagate to the caller before any in-memory state
//!   changes, so they are safe to retry.
//! - Flush errors are latched and surfaced on the next mutation; the
//!   sealed memtable stays readable and the flush is retried.
//! - Compaction errors roll back their output files and leave the version
//!   untouched.
//! - A manifest write failure poisons the engine: the error is surfaced
//!   once and every later mutation is rejected.

pub mod batch;
pub mod iter;

mod dump;
mod flush;

#[cfg(test)]
mod tests;

pub use batch::{Batch, BatchEntry};
pub use iter::{EngineIterator, KvIterator};

use std::{
    fs,
    io,
    mem,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};

use crossbeam::channel::{Sender, bounded};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::compaction;
use crate::manifest::{ManifestError, Version};
use crate::memtable::Memtable;
use crate::sstable::{self, DEFAULT_BLOCK_SIZE, Lookup, TableError, TableReader};
use crate::wal::{self, Wal, WalError, WalRecord};

use flush::FlushJob;
use iter::{MergingIter, SnapshotIter};

/// Sub-directory of the engine directory holding WAL segments.
pub const WAL_DIR: &str = "wal";

/// Sub-directory of the engine directory holding SSTable files.
pub const SST_DIR: &str = "sst";

/// The unit held in a memtable or emitted by an iterator: a value payload
/// plus a tombstone flag. When the flag is set the payload is empty and
/// readers treat the key as absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    /// Opaque value bytes; empty for tombstones.
    pub value: Vec<u8>,

    /// Whether this item marks the key as deleted.
    pub tombstone: bool,
}

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// The key has no live value.
    #[error("key not found")]
    NotFound,

    /// Rotation refused: the immutable list is full or the flush queue is
    /// saturated. Retryable — the caller should back off and try again.
    #[error("back-pressure: too many pending flushes")]
    BackPressure,

    /// Operation attempted on a shutting-down or closed engine.
    #[error("engine is closed")]
    Closed,

    /// Caller misuse, e.g. a restore document without `_id`.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Error originating from the WAL subsystem.
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// Error originating from the SSTable subsystem.
    #[error("SSTable error: {0}")]
    Table(#[from] TableError),

    /// Error originating from the manifest subsystem.
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    /// Underlying filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl EngineError {
    /// Whether this error reports on-disk corruption — a WAL CRC mismatch
    /// or a malformed SSTable.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            EngineError::Wal(WalError::Corruption(_)) | EngineError::Table(TableError::Corruption(_))
        )
    }
}

/// Configuration for an [`Engine`] instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Memtable entry count that triggers rotation.
    pub flush_size: usize,

    /// Memtable byte size that triggers rotation.
    pub max_mem_bytes: usize,

    /// Max sealed memtables awaiting flush before mutations get
    /// back-pressure.
    pub max_immutable: usize,

    /// Number of L0 files that triggers an L0→L1 compaction.
    pub l0_compaction_trigger: usize,

    /// Size budget scale: level n (≥ 1) may hold `level_base_bytes × 10ⁿ`
    /// bytes before compaction into the next level is triggered.
    pub level_base_bytes: u64,

    /// Target size of one compaction output file; outputs are split when
    /// they grow past it.
    pub target_file_bytes: u64,

    /// Target size of one SSTable data block.
    pub block_size: usize,

    /// How long rotation may wait for the flush queue before reporting
    /// back-pressure.
    pub rotate_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            flush_size: 1024,
            max_mem_bytes: 4 * 1024 * 1024,
            max_immutable: 3,
            l0_compaction_trigger: 4,
            level_base_bytes: 10 * 1024 * 1024,
            target_file_bytes: 64 * 1024 * 1024,
            block_size: DEFAULT_BLOCK_SIZE,
            rotate_timeout: Duration::from_millis(100),
        }
    }
}

/// Snapshot of the engine's operation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub puts: u64,
    pub gets: u64,
    pub deletes: u64,
    pub flushes: u64,
    pub compactions: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Metrics {
    pub(crate) puts: AtomicU64,
    pub(crate) gets: AtomicU64,
    pub(crate) deletes: AtomicU64,
    pub(crate) flushes: AtomicU64,
    pub(crate) compactions: AtomicU64,
}

impl Metrics {
    fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            puts: self.puts.load(Ordering::Relaxed),
            gets: self.gets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            compactions: self.compactions.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Opening,
    Open,
    Closing,
    Closed,
}

/// State owned exclusively by the writer, behind the engine write mutex.
pub(crate) struct WriterState {
    /// The active WAL segment.
    pub(crate) wal: Wal,

    /// Every WAL segment path holding records of the current active
    /// memtable. Normally just the active segment; a reverted rotation can
    /// leave more than one.
    pub(crate) active_wal_paths: Vec<PathBuf>,
}

pub(crate) struct EngineInner {
    pub(crate) dir: PathBuf,
    pub(crate) wal_dir: PathBuf,
    pub(crate) sst_dir: PathBuf,
    pub(crate) config: EngineConfig,

    lifecycle: RwLock<Lifecycle>,

    /// The engine write mutex: serializes mutations and rotation, and
    /// guards version swaps.
    pub(crate) writer: Mutex<WriterState>,

    pub(crate) active: RwLock<Arc<Memtable>>,

    /// Sealed memtables awaiting flush, newest last.
    pub(crate) immutables: RwLock<Vec<FlushJob>>,

    pub(crate) version: RwLock<Arc<Version>>,

    /// Sender side of the flush channel; dropped on close to stop the
    /// worker.
    pub(crate) flush_tx: Mutex<Option<Sender<FlushJob>>>,

    flush_handle: Mutex<Option<thread::JoinHandle<()>>>,

    /// Latched background failure, surfaced on the next mutation.
    pub(crate) flush_error: Mutex<Option<EngineError>>,

    /// Set when a manifest write failed; the engine rejects all further
    /// mutations.
    pub(crate) poisoned: AtomicBool,

    /// Test hook: the flush worker idles while this is set.
    pub(crate) flush_paused: AtomicBool,

    /// Monotonic sequence for SSTable file names.
    pub(crate) next_file_seq: AtomicU64,

    pub(crate) metrics: Metrics,
}

/// The main LSM storage engine handle.
///
/// Cheap to clone — all state is shared through an internal `Arc` — so a
/// handle can be passed to worker threads freely.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

/// Lock helpers: these locks guard in-memory state only, so a poisoned
/// lock (a panicking thread) is recovered rather than propagated.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(rwlock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    rwlock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(rwlock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    rwlock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Builds the canonical SSTable file name for a level and sequence.
pub(crate) fn table_file_name(level: u32, seq: u64) -> String {
    format!("sst-L{level}-{seq:06}.sst")
}

/// Parses the sequence number out of an `sst-L<level>-<seq>.sst` path.
pub(crate) fn parse_table_seq(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    let rest = name.strip_prefix("sst-L")?.strip_suffix(".sst")?;
    let (_level, seq) = rest.split_once('-')?;
    seq.parse().ok()
}

impl Engine {
    /// Opens (or creates) an engine rooted at `dir`.
    ///
    /// Creates the `wal/` and `sst/` sub-directories, loads the manifest,
    /// removes orphaned SSTable files, replays pre-existing WAL segments
    /// into a fresh memtable (scheduling it for flush if anything was
    /// recovered), opens a new WAL segment, and starts the background
    /// flush task.
    pub fn open(dir: impl AsRef<Path>, config: EngineConfig) -> Result<Self, EngineError> {
        let dir = dir.as_ref().to_path_buf();
        let wal_dir = dir.join(WAL_DIR);
        let sst_dir = dir.join(SST_DIR);
        fs::create_dir_all(&dir)?;
        fs::create_dir_all(&wal_dir)?;
        fs::create_dir_all(&sst_dir)?;

        let version = Version::load(&dir)?;
        remove_orphan_tables(&sst_dir, &version)?;

        // Discover the next WAL sequence and open a fresh segment.
        let segments = wal::list_segments(&wal_dir)?;
        let next_wal_seq = segments.last().map_or(1, |(seq, _)| seq + 1);
        let active_wal = Wal::open(wal_dir.join(wal::segment_file_name(next_wal_seq)))?;
        let active_wal_path = active_wal.path().to_path_buf();

        // Replay pre-existing segments into the empty memtable. A corrupt
        // record discards the rest of its segment.
        let active = Arc::new(Memtable::new());
        let mut replayed = 0u64;
        for (seq, path) in &segments {
            for record in Wal::replay(path)? {
                match record {
                    Ok(WalRecord::Put { key, value }) => {
                        active.put(key, value);
                        replayed += 1;
                    }
                    Ok(WalRecord::Delete { key }) => {
                        active.delete(key);
                        replayed += 1;
                    }
                    Err(e) => {
                        warn!(seq, error = %e, "WAL replay stopped; discarding segment tail");
                        break;
                    }
                }
            }
        }

        let next_file_seq = fs::read_dir(&sst_dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| parse_table_seq(&entry.path()))
            .max()
            .map_or(1, |seq| seq + 1);

        let (flush_tx, flush_rx) = bounded::<FlushJob>(config.max_immutable.max(1));

        let inner = Arc::new(EngineInner {
            dir: dir.clone(),
            wal_dir,
            sst_dir,
            config,
            lifecycle: RwLock::new(Lifecycle::Opening),
            writer: Mutex::new(WriterState {
                wal: active_wal,
                active_wal_paths: vec![active_wal_path],
            }),
            active: RwLock::new(active),
            immutables: RwLock::new(Vec::new()),
            version: RwLock::new(Arc::new(version)),
            flush_tx: Mutex::new(Some(flush_tx)),
            flush_handle: Mutex::new(None),
            flush_error: Mutex::new(None),
            poisoned: AtomicBool::new(false),
            flush_paused: AtomicBool::new(false),
            next_file_seq: AtomicU64::new(next_file_seq),
            metrics: Metrics::default(),
        });

        let worker_inner = Arc::downgrade(&inner);
        let handle = thread::Builder::new()
            .name("stratumdb-flush".into())
            .spawn(move || flush::run(worker_inner, flush_rx))?;
        *lock(&inner.flush_handle) = Some(handle);

        let engine = Engine { inner };

        if replayed > 0 {
            // Seal the replayed memtable and schedule it; its covering
            // segments are deleted only after the flush completes.
            let old_paths: Vec<PathBuf> = segments.iter().map(|(_, p)| p.clone()).collect();
            engine.seal_replayed(old_paths)?;
            info!(records = replayed, "WAL replay recovered records");
        } else {
            // Nothing recovered: the old segments are empty or unreadable
            // and carry no acknowledged data.
            for (_, path) in &segments {
                if let Err(e) = fs::remove_file(path) {
                    warn!(path = %path.display(), error = %e, "failed to remove empty WAL segment");
                }
            }
        }

        *write(&engine.inner.lifecycle) = Lifecycle::Open;
        info!(dir = %dir.display(), "engine opened");
        Ok(engine)
    }

    /// Inserts or updates a key.
    ///
    /// Durable (WAL fsynced) before returning. May trigger rotation;
    /// returns [`EngineError::BackPressure`] when too many flushes are
    /// pending (retryable).
    pub fn put(&self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Result<(), EngineError> {
        self.write_record(WalRecord::Put {
            key: key.into(),
            value: value.into(),
        })?;
        self.inner.metrics.puts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Deletes a key by installing a tombstone.
    pub fn delete(&self, key: impl Into<Vec<u8>>) -> Result<(), EngineError> {
        self.write_record(WalRecord::Delete { key: key.into() })?;
        self.inner.metrics.deletes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Creates an empty batch.
    pub fn new_batch(&self) -> Batch {
        Batch::new()
    }

    /// Applies a batch atomically: every record is framed into the WAL and
    /// made durable with a single fsync, then all entries are applied to
    /// the memtable in list order (later entries shadow earlier ones on
    /// the same key). On a WAL error the memtable is untouched.
    pub fn apply_batch(&self, batch: &Batch) -> Result<(), EngineError> {
        self.check_writable()?;
        if batch.is_empty() {
            return Ok(());
        }
        let mut writer = lock(&self.inner.writer);
        self.surface_latched_error()?;

        let records: Vec<WalRecord> = batch.entries().iter().map(BatchEntry::to_wal_record).collect();
        writer.wal.append_all(&records)?;

        let active = read(&self.inner.active).clone();
        let mut puts = 0u64;
        let mut deletes = 0u64;
        for entry in batch.entries() {
            if entry.tombstone {
                active.delete(entry.key.clone());
                deletes += 1;
            } else {
                active.put(entry.key.clone(), entry.value.clone());
                puts += 1;
            }
        }
        self.inner.metrics.puts.fetch_add(puts, Ordering::Relaxed);
        self.inner.metrics.deletes.fetch_add(deletes, Ordering::Relaxed);

        self.maybe_rotate(&mut writer)
    }

    /// Looks up a key.
    ///
    /// Consults the active memtable, then immutable memtables newest
    /// first, then L0 tables newest first, then at most one file per
    /// deeper level. A tombstone anywhere along the way stops the search
    /// with [`EngineError::NotFound`].
    pub fn get(&self, key: impl AsRef<[u8]>) -> Result<Vec<u8>, EngineError> {
        let key = key.as_ref();
        self.check_readable()?;
        self.inner.metrics.gets.fetch_add(1, Ordering::Relaxed);

        let active = read(&self.inner.active).clone();
        if let Some(item) = active.get(key) {
            return item_to_result(item);
        }

        let immutables: Vec<FlushJob> = read(&self.inner.immutables).clone();
        for job in immutables.iter().rev() {
            if let Some(item) = job.memtable.get(key) {
                return item_to_result(item);
            }
        }

        // A concurrent compaction can delete a file between cloning the
        // version and opening it; a vanished file means the version is
        // stale, so re-read it and rescan.
        'rescan: for attempt in 0.. {
            let version = read(&self.inner.version).clone();

            for meta in version.l0_newest_first() {
                if !meta.contains(key) {
                    continue;
                }
                let reader = match open_or_stale(&meta.path, attempt)? {
                    Some(reader) => reader,
                    None => continue 'rescan,
                };
                match reader.find(key)? {
                    Lookup::Value(value) => return Ok(value),
                    Lookup::Tombstone => return Err(EngineError::NotFound),
                    Lookup::Absent => {}
                }
            }

            for (level, _) in version.lower_levels() {
                if let Some(meta) = version.file_containing(level, key) {
                    let reader = match open_or_stale(&meta.path, attempt)? {
                        Some(reader) => reader,
                        None => continue 'rescan,
                    };
                    match reader.find(key)? {
                        Lookup::Value(value) => return Ok(value),
                        Lookup::Tombstone => return Err(EngineError::NotFound),
                        Lookup::Absent => {}
                    }
                }
            }

            break;
        }

        Err(EngineError::NotFound)
    }

    /// Builds a forward iterator over a point-in-time view of the store.
    ///
    /// Children are layered newest-first: active memtable snapshot,
    /// immutable snapshots, L0 newest-first, then deeper levels ascending.
    /// Tombstones are suppressed; each live key is emitted exactly once in
    /// ascending byte order.
    pub fn iter(&self) -> Result<EngineIterator, EngineError> {
        self.check_readable()?;

        // As in get(): a file deleted by a concurrent compaction marks the
        // cloned version stale, so rebuild the child set from a fresh one.
        'rescan: for attempt in 0.. {
            let mut children: Vec<Box<dyn KvIterator>> = Vec::new();

            let active = read(&self.inner.active).clone();
            children.push(Box::new(SnapshotIter::new(active.snapshot())));

            let immutables: Vec<FlushJob> = read(&self.inner.immutables).clone();
            for job in immutables.iter().rev() {
                children.push(Box::new(SnapshotIter::new(job.memtable.snapshot())));
            }

            let version = read(&self.inner.version).clone();
            let tables = version.l0_newest_first().chain(
                version
                    .lower_levels()
                    .flat_map(|(_, files)| files.iter()),
            );
            for meta in tables {
                match open_or_stale(&meta.path, attempt)? {
                    Some(reader) => children.push(Box::new(sstable::TableIter::new(reader))),
                    None => continue 'rescan,
                }
            }

            return Ok(EngineIterator::new(MergingIter::new(children)));
        }
        unreachable!("rescan loop always returns or errors")
    }

    /// Seals the active memtable (if non-empty) and waits until every
    /// pending flush has completed.
    pub fn flush(&self) -> Result<(), EngineError> {
        self.check_writable()?;
        {
            let mut writer = lock(&self.inner.writer);
            let active_empty = read(&self.inner.active).is_empty();
            if !active_empty {
                self.rotate(&mut writer)?;
            }
        }
        self.wait_for_flush_queue()
    }

    /// Runs compaction synchronously until no trigger fires.
    ///
    /// If no trigger fires but L0 holds files, one forced L0→L1 round runs
    /// first so callers can push data to the deepest level on demand.
    pub fn compact(&self) -> Result<(), EngineError> {
        self.check_writable()?;
        let compacted = compaction::run_pending(&self.inner)?;
        if !compacted {
            let version = read(&self.inner.version).clone();
            if let Some(task) = compaction::forced_l0_task(&version) {
                compaction::run_task(&self.inner, task)?;
                compaction::run_pending(&self.inner)?;
            }
        }
        Ok(())
    }

    /// Returns a snapshot of the engine's operation counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Gracefully shuts down the engine.
    ///
    /// Rotates a non-empty active memtable, drains the flush queue, joins
    /// the flush task, syncs the WAL, and persists the manifest. Safe to
    /// call multiple times and from multiple threads; only the first call
    /// does the work.
    pub fn close(&self) -> Result<(), EngineError> {
        {
            let mut lifecycle = write(&self.inner.lifecycle);
            match *lifecycle {
                Lifecycle::Closing | Lifecycle::Closed => return Ok(()),
                _ => *lifecycle = Lifecycle::Closing,
            }
        }
        info!(dir = %self.inner.dir.display(), "engine closing");

        // Seal whatever is still buffered. The send happens outside the
        // write mutex so the flush worker can make progress.
        let final_job = {
            let mut writer = lock(&self.inner.writer);
            let active = read(&self.inner.active).clone();
            if active.is_empty() {
                None
            } else {
                Some(self.seal_locked(&mut writer)?)
            }
        };
        if let Some(job) = final_job {
            let tx = lock(&self.inner.flush_tx).clone();
            if let Some(tx) = tx {
                tx.send(job).map_err(|_| EngineError::Closed)?;
            }
        }

        // Closing the channel lets the worker drain the queue and exit.
        drop(lock(&self.inner.flush_tx).take());
        if let Some(handle) = lock(&self.inner.flush_handle).take() {
            let _ = handle.join();
        }

        {
            let writer = lock(&self.inner.writer);
            writer.wal.sync()?;
        }
        read(&self.inner.version).save(&self.inner.dir)?;

        *write(&self.inner.lifecycle) = Lifecycle::Closed;

        if let Some(e) = lock(&self.inner.flush_error).take() {
            return Err(e);
        }
        info!(dir = %self.inner.dir.display(), "engine closed");
        Ok(())
    }

    // --------------------------------------------------------------------
    // Internal: mutation path
    // --------------------------------------------------------------------

    fn write_record(&self, record: WalRecord) -> Result<(), EngineError> {
        self.check_writable()?;
        let mut writer = lock(&self.inner.writer);
        self.surface_latched_error()?;

        // Durability boundary: nothing below this line can fail.
        writer.wal.append(&record)?;

        let active = read(&self.inner.active).clone();
        match record {
            WalRecord::Put { key, value } => active.put(key, value),
            WalRecord::Delete { key } => active.delete(key),
        }

        self.maybe_rotate(&mut writer)
    }

    fn maybe_rotate(&self, writer: &mut WriterState) -> Result<(), EngineError> {
        let (len, bytes) = {
            let active = read(&self.inner.active);
            (active.len(), active.byte_size())
        };
        if len >= self.inner.config.flush_size || bytes >= self.inner.config.max_mem_bytes {
            self.rotate(writer)?;
        }
        Ok(())
    }

    /// Seals the active memtable and hands it to the flush task.
    ///
    /// Refuses with [`EngineError::BackPressure`] when the immutable list
    /// is full; reverts the seal if the bounded channel send times out.
    fn rotate(&self, writer: &mut WriterState) -> Result<(), EngineError> {
        if read(&self.inner.immutables).len() >= self.inner.config.max_immutable {
            return Err(EngineError::BackPressure);
        }

        let job = self.seal_locked(writer)?;
        let sealed = job.memtable.clone();

        let tx = lock(&self.inner.flush_tx)
            .clone()
            .ok_or(EngineError::Closed)?;
        match tx.send_timeout(job, self.inner.config.rotate_timeout) {
            Ok(()) => Ok(()),
            Err(_) => {
                // The flush queue is saturated. Revert the seal so the
                // records covered by the old segments stay reachable: the
                // sealed memtable becomes active again and the fresh
                // segment joins its covering set.
                warn!("flush queue saturated; reverting rotation");
                let mut immutables = write(&self.inner.immutables);
                if let Some(pos) = immutables
                    .iter()
                    .position(|j| Arc::ptr_eq(&j.memtable, &sealed))
                {
                    let job = immutables.remove(pos);
                    drop(immutables);
                    *write(&self.inner.active) = job.memtable;
                    let mut paths = job.wal_paths;
                    paths.extend(writer.active_wal_paths.drain(..));
                    writer.active_wal_paths = paths;
                }
                Err(EngineError::BackPressure)
            }
        }
    }

    /// Swaps in a fresh memtable + WAL segment and returns the flush job
    /// for the sealed one. Caller holds the write mutex.
    fn seal_locked(&self, writer: &mut WriterState) -> Result<FlushJob, EngineError> {
        let next_seq = writer.wal.seq() + 1;
        let new_wal = Wal::open(self.inner.wal_dir.join(wal::segment_file_name(next_seq)))?;
        let new_path = new_wal.path().to_path_buf();
        let old_paths = mem::replace(&mut writer.active_wal_paths, vec![new_path]);
        writer.wal = new_wal;

        let sealed = read(&self.inner.active).clone();
        let job = FlushJob {
            memtable: sealed,
            wal_paths: old_paths,
        };

        // Publish to the immutable list before swapping the active map so
        // readers never observe a gap.
        write(&self.inner.immutables).push(job.clone());
        *write(&self.inner.active) = Arc::new(Memtable::new());

        debug!(
            entries = job.memtable.len(),
            bytes = job.memtable.byte_size(),
            "memtable sealed"
        );
        Ok(job)
    }

    /// Seals the memtable rebuilt by WAL replay and schedules its flush.
    fn seal_replayed(&self, old_paths: Vec<PathBuf>) -> Result<(), EngineError> {
        let job = {
            let mut writer = lock(&self.inner.writer);
            let sealed = read(&self.inner.active).clone();
            let job = FlushJob {
                memtable: sealed,
                wal_paths: old_paths,
            };
            write(&self.inner.immutables).push(job.clone());
            *write(&self.inner.active) = Arc::new(Memtable::new());
            job
        };
        let tx = lock(&self.inner.flush_tx)
            .clone()
            .ok_or(EngineError::Closed)?;
        tx.send(job).map_err(|_| EngineError::Closed)?;
        Ok(())
    }

    fn wait_for_flush_queue(&self) -> Result<(), EngineError> {
        loop {
            if let Some(e) = lock(&self.inner.flush_error).take() {
                return Err(e);
            }
            if read(&self.inner.immutables).is_empty() {
                return Ok(());
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    // --------------------------------------------------------------------
    // Internal: lifecycle checks
    // --------------------------------------------------------------------

    fn check_writable(&self) -> Result<(), EngineError> {
        if self.inner.poisoned.load(Ordering::Acquire) {
            // A manifest write failed earlier. Surface the original error
            // once; every later mutation sees the engine as closed.
            if let Some(e) = lock(&self.inner.flush_error).take() {
                return Err(e);
            }
            return Err(EngineError::Closed);
        }
        match *read(&self.inner.lifecycle) {
            Lifecycle::Open => Ok(()),
            _ => Err(EngineError::Closed),
        }
    }

    fn check_readable(&self) -> Result<(), EngineError> {
        match *read(&self.inner.lifecycle) {
            Lifecycle::Open | Lifecycle::Closing => Ok(()),
            _ => Err(EngineError::Closed),
        }
    }

    fn surface_latched_error(&self) -> Result<(), EngineError> {
        if let Some(e) = lock(&self.inner.flush_error).take() {
            return Err(e);
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn set_flush_paused(&self, paused: bool) {
        self.inner.flush_paused.store(paused, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn pending_immutables(&self) -> usize {
        read(&self.inner.immutables).len()
    }
}

/// How many times a read rescans after finding the cloned version stale.
const MAX_VERSION_RESCANS: usize = 3;

/// Opens a table, or signals a stale version when the file has been
/// deleted by a concurrent compaction (`Ok(None)` → caller rescans).
fn open_or_stale(path: &Path, attempt: usize) -> Result<Option<TableReader>, EngineError> {
    match TableReader::open(path) {
        Ok(reader) => Ok(Some(reader)),
        Err(TableError::Io(e))
            if e.kind() == io::ErrorKind::NotFound && attempt < MAX_VERSION_RESCANS =>
        {
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

fn item_to_result(item: Item) -> Result<Vec<u8>, EngineError> {
    if item.tombstone {
        Err(EngineError::NotFound)
    } else {
        Ok(item.value)
    }
}

/// Removes `.sst` files that the manifest does not reference.
///
/// Such files are left behind when a crash lands between table creation
/// and manifest persistence; they hold no acknowledged data.
fn remove_orphan_tables(sst_dir: &Path, version: &Version) -> Result<(), EngineError> {
    let live: std::collections::HashSet<std::ffi::OsString> = version
        .all_files()
        .filter_map(|meta| meta.path.file_name().map(|n| n.to_os_string()))
        .collect();

    for entry in fs::read_dir(sst_dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_file()
            && path.extension().and_then(|e| e.to_str()) == Some("sst")
            && let Some(name) = path.file_name()
            && !live.contains(name)
        {
            warn!(path = %path.display(), "removing orphaned SSTable");
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to remove orphan");
            }
        }
    }
    Ok(())
}
