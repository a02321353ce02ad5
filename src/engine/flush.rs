//! Background flush task — turns sealed memtables into L0 SSTables.
//!
//! The worker consumes [`FlushJob`]s from the bounded flush channel. For
//! each job it writes the memtable contents into a new L0 table, registers
//! the file in the version, persists the manifest, removes the memtable
//! from the immutable list, and finally deletes the WAL segments the
//! memtable was covering. That ordering makes every step crash-safe: until
//! the manifest references the new file, the WAL still holds the data; an
//! SSTable stranded by a crash before the manifest write is an orphan and
//! is swept at the next open.
//!
//! A failed flush is latched into the engine's error slot (surfaced by the
//! next mutation), the job is re-queued, and the memtable stays in the
//! immutable list so readers keep seeing its data.
//!
//! After every successful flush the worker evaluates the compaction
//! triggers.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use crossbeam::channel::Receiver;
use tracing::{error, info, warn};

use crate::compaction;
use crate::manifest::FileMetadata;
use crate::memtable::Memtable;
use crate::sstable::TableWriter;

use super::{EngineError, EngineInner, lock, read, table_file_name, write};

/// How long the worker backs off before retrying a failed flush.
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// A sealed memtable travelling to the flush task, together with the WAL
/// segments that cover its records.
#[derive(Clone)]
pub(crate) struct FlushJob {
    pub(crate) memtable: Arc<Memtable>,

    /// Segments deleted once the flush has completed.
    pub(crate) wal_paths: Vec<PathBuf>,
}

/// Worker loop. Exits when the flush channel closes (engine close) or the
/// engine itself is dropped.
pub(crate) fn run(inner: Weak<EngineInner>, rx: Receiver<FlushJob>) {
    while let Ok(job) = rx.recv() {
        let Some(inner) = inner.upgrade() else {
            break;
        };

        while inner.flush_paused.load(Ordering::Acquire) {
            thread::sleep(Duration::from_millis(1));
        }

        match flush_one(&inner, &job) {
            Ok(()) => {
                if let Err(e) = compaction::run_pending(&inner) {
                    warn!(error = %e, "background compaction failed");
                }
            }
            Err(e) => {
                error!(error = %e, "flush failed; will retry");
                *lock(&inner.flush_error) = Some(e);

                // The memtable is still in the immutable list; retry after
                // a pause unless the engine is shutting down.
                thread::sleep(RETRY_BACKOFF);
                let tx = lock(&inner.flush_tx).clone();
                if let Some(tx) = tx {
                    let _ = tx.send(job);
                }
            }
        }
    }
}

/// Flushes one sealed memtable into a new L0 table.
fn flush_one(inner: &Arc<EngineInner>, job: &FlushJob) -> Result<(), EngineError> {
    // Read, don't drain: the memtable must stay readable until the new
    // table is visible through the version.
    let entries = job.memtable.snapshot();

    if entries.is_empty() {
        remove_job(inner, job);
        delete_wal_segments(&job.wal_paths);
        return Ok(());
    }

    let seq = inner.next_file_seq.fetch_add(1, Ordering::SeqCst);
    let path = inner.sst_dir.join(table_file_name(0, seq));
    let summary = match build_table(&path, &entries, inner.config.block_size) {
        Ok(summary) => summary,
        Err(e) => {
            // Drop the partial file; the retry will write a fresh one.
            if let Err(rm) = std::fs::remove_file(&path)
                && rm.kind() != std::io::ErrorKind::NotFound
            {
                warn!(path = %path.display(), error = %rm, "failed to remove partial SSTable");
            }
            return Err(e);
        }
    };

    let meta = FileMetadata {
        level: 0,
        path: path.clone(),
        min_key: summary.min_key,
        max_key: summary.max_key,
        file_size: summary.file_size,
        key_count: summary.entry_count,
    };

    // Swap the version under the engine write mutex; the manifest on disk
    // must reflect the new version before anything else happens.
    {
        let _writer = lock(&inner.writer);
        let current = read(&inner.version).clone();
        let mut next = (*current).clone();
        next.add_file(meta);
        if let Err(e) = next.save(&inner.dir) {
            inner.poisoned.store(true, Ordering::Release);
            return Err(e.into());
        }
        *write(&inner.version) = Arc::new(next);
    }

    // The table is live: release the memtable's memory, unlink it from the
    // read path, and drop the WAL segments it was covering.
    job.memtable.snapshot_and_reset();
    remove_job(inner, job);
    delete_wal_segments(&job.wal_paths);

    inner.metrics.flushes.fetch_add(1, Ordering::Relaxed);
    info!(
        path = %path.display(),
        entries = summary.entry_count,
        bytes = summary.file_size,
        "memtable flushed to L0"
    );
    Ok(())
}

fn build_table(
    path: &std::path::Path,
    entries: &[(Vec<u8>, super::Item)],
    block_size: usize,
) -> Result<crate::sstable::BuildSummary, EngineError> {
    let mut writer = TableWriter::with_block_size(path, entries.len(), block_size)?;
    for (key, item) in entries {
        writer.add(key, item)?;
    }
    Ok(writer.finish()?)
}

fn remove_job(inner: &Arc<EngineInner>, job: &FlushJob) {
    write(&inner.immutables).retain(|j| !Arc::ptr_eq(&j.memtable, &job.memtable));
}

/// Best-effort, idempotent segment deletion.
fn delete_wal_segments(paths: &[PathBuf]) {
    for path in paths {
        if let Err(e) = std::fs::remove_file(path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %path.display(), error = %e, "failed to delete WAL segment");
        }
    }
}
