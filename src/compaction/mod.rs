//! # Compaction Module
//!
//! Leveled compaction: background merging of SSTables down the level
//! hierarchy so reads stay bounded and deleted data is eventually
//! reclaimed.
//!
//! ## Triggers
//!
//! - **L0 count** — when L0 accumulates `l0_compaction_trigger` files,
//!   all of L0 plus every L1 file overlapping the union of the L0 key
//!   ranges is merged into L1.
//! - **Level size** — when level n (≥ 1) exceeds its byte budget
//!   (`level_base_bytes × 10ⁿ`), one file is picked from Lₙ — the oldest
//!   by file sequence — and merged with the Lₙ₊₁ files overlapping its
//!   range.
//!
//! ## Execution
//!
//! Input tables are streamed through a raw-mode merging iterator (children
//! newest-first, so the newest version of each key wins) into one or more
//! output tables at the target level, split when an output passes the
//! target file size. Tombstones are dropped only when the target level is
//! the deepest populated level — otherwise they must survive to keep
//! shadowing older data below. The merge yields to the scheduler every
//! 1000 output keys so a long compaction cannot monopolise a core.
//!
//! ## Atomicity
//!
//! On success the version is swapped (inputs out, outputs in) and the
//! manifest persisted **before** any input file is deleted. On failure the
//! in-progress output is removed and the version is untouched.


use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;

use tracing::{debug, info, warn};

use crate::engine::iter::{KvIterator, MergingIter};
use crate::engine::{EngineError, EngineInner, lock, parse_table_seq, read, table_file_name, write};
use crate::manifest::{FileMetadata, Version};
use crate::sstable::{TableIter, TableWriter};

/// Output keys between cooperative yields.
const YIELD_EVERY: u64 = 1000;

/// One unit of compaction work: which files to merge and where the output
/// goes.
#[derive(Debug, Clone)]
pub(crate) struct CompactionTask {
    /// Input files in merge priority order (newest first).
    pub(crate) inputs: Vec<FileMetadata>,

    /// Level the outputs are written to.
    pub(crate) target_level: u32,

    /// Whether tombstones may be dropped: true only when the target level
    /// is the deepest populated level, so nothing below can resurrect.
    pub(crate) drop_tombstones: bool,
}

/// Evaluates the triggers against `version` and returns the next task, if
/// any.
pub(crate) fn pick_task(version: &Version, config: &crate::engine::EngineConfig) -> Option<CompactionTask> {
    if version.level_files(0).len() >= config.l0_compaction_trigger {
        return l0_task(version);
    }

    let deepest = version.deepest_level()?;
    for level in 1..=deepest {
        if version.level_size(level) > level_budget(config.level_base_bytes, level) {
            return level_task(version, level);
        }
    }
    None
}

/// Builds an L0→L1 task regardless of the count trigger. Used by the
/// manual `compact()` entry point.
pub(crate) fn forced_l0_task(version: &Version) -> Option<CompactionTask> {
    l0_task(version)
}

/// Byte budget for level n (≥ 1).
fn level_budget(base: u64, level: u32) -> u64 {
    base.saturating_mul(10u64.saturating_pow(level))
}

/// All of L0 (newest first) plus the overlapping slice of L1.
fn l0_task(version: &Version) -> Option<CompactionTask> {
    let mut inputs: Vec<FileMetadata> = version.l0_newest_first().cloned().collect();
    if inputs.is_empty() {
        return None;
    }

    let min = inputs.iter().map(|f| f.min_key.clone()).min()?;
    let max = inputs.iter().map(|f| f.max_key.clone()).max()?;
    inputs.extend(version.overlapping_files(1, &min, &max));

    Some(CompactionTask {
        inputs,
        target_level: 1,
        drop_tombstones: target_is_deepest(version, 1),
    })
}

/// One Lₙ file (oldest by file sequence) plus the overlapping slice of
/// Lₙ₊₁.
fn level_task(version: &Version, level: u32) -> Option<CompactionTask> {
    let picked = version
        .level_files(level)
        .iter()
        .min_by_key(|f| parse_table_seq(&f.path).unwrap_or(u64::MAX))?
        .clone();

    let mut inputs = vec![picked.clone()];
    inputs.extend(version.overlapping_files(level + 1, &picked.min_key, &picked.max_key));

    Some(CompactionTask {
        inputs,
        target_level: level + 1,
        drop_tombstones: target_is_deepest(version, level + 1),
    })
}

/// Whether no populated level lies below `target`.
fn target_is_deepest(version: &Version, target: u32) -> bool {
    version.deepest_level().is_none_or(|deepest| target >= deepest)
}

/// Runs compaction rounds until no trigger fires. Returns whether any
/// round ran.
pub(crate) fn run_pending(inner: &Arc<EngineInner>) -> Result<bool, EngineError> {
    let mut any = false;
    loop {
        let version = read(&inner.version).clone();
        let Some(task) = pick_task(&version, &inner.config) else {
            break;
        };
        run_task(inner, task)?;
        any = true;
    }
    Ok(any)
}

/// Executes one compaction task end to end.
pub(crate) fn run_task(inner: &Arc<EngineInner>, task: CompactionTask) -> Result<(), EngineError> {
    let input_paths: Vec<PathBuf> = task.inputs.iter().map(|f| f.path.clone()).collect();
    debug!(
        inputs = input_paths.len(),
        target_level = task.target_level,
        drop_tombstones = task.drop_tombstones,
        "compaction started"
    );

    let outputs = match merge_inputs(inner, &task) {
        Ok(outputs) => outputs,
        Err(e) => {
            warn!(error = %e, "compaction aborted; version untouched");
            return Err(e);
        }
    };

    // Swap the version under the engine write mutex; persist the manifest
    // before any input file disappears.
    {
        let _writer = lock(&inner.writer);
        let current = read(&inner.version).clone();
        let mut next = (*current).clone();
        next.delete_files(&input_paths);
        for meta in &outputs {
            next.add_file(meta.clone());
        }
        if let Err(e) = next.save(&inner.dir) {
            inner.poisoned.store(true, Ordering::Release);
            for meta in &outputs {
                let _ = std::fs::remove_file(&meta.path);
            }
            return Err(e.into());
        }
        *write(&inner.version) = Arc::new(next);
    }

    // Obsolete-input deletion is best-effort and idempotent.
    for path in &input_paths {
        if let Err(e) = std::fs::remove_file(path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %path.display(), error = %e, "failed to delete compacted input");
        }
    }

    inner.metrics.compactions.fetch_add(1, Ordering::Relaxed);
    info!(
        inputs = input_paths.len(),
        outputs = outputs.len(),
        target_level = task.target_level,
        "compaction finished"
    );
    Ok(())
}

/// Streams the inputs through a raw-mode merge into target-level outputs.
///
/// On error every finished or in-progress output file is removed before
/// the error propagates.
fn merge_inputs(
    inner: &Arc<EngineInner>,
    task: &CompactionTask,
) -> Result<Vec<FileMetadata>, EngineError> {
    let mut children: Vec<Box<dyn KvIterator>> = Vec::with_capacity(task.inputs.len());
    for meta in &task.inputs {
        children.push(Box::new(TableIter::open(&meta.path)?));
    }
    let mut merge = MergingIter::with_tombstones(children);

    let expected_keys: u64 = task.inputs.iter().map(|f| f.key_count).sum();
    let mut outputs: Vec<FileMetadata> = Vec::new();
    let mut writer: Option<(TableWriter, PathBuf)> = None;
    let mut keys_out = 0u64;

    let result = (|| -> Result<(), EngineError> {
        while merge.advance() {
            let item = merge.value().clone();
            if item.tombstone && task.drop_tombstones {
                continue;
            }
            let key = merge.key().to_vec();

            if writer.is_none() {
                let seq = inner.next_file_seq.fetch_add(1, Ordering::SeqCst);
                let path = inner.sst_dir.join(table_file_name(task.target_level, seq));
                let w = TableWriter::with_block_size(
                    &path,
                    expected_keys as usize,
                    inner.config.block_size,
                )?;
                writer = Some((w, path));
            }
            let (w, _) = writer.as_mut().expect("writer just installed");
            w.add(&key, &item)?;

            keys_out += 1;
            if keys_out % YIELD_EVERY == 0 {
                thread::yield_now();
            }

            if w.bytes_written() >= inner.config.target_file_bytes {
                let (w, path) = writer.take().expect("writer present");
                outputs.push(finish_output(w, path, task.target_level)?);
            }
        }
        if let Some(e) = merge.take_error() {
            return Err(e);
        }
        if let Some((w, path)) = writer.take() {
            outputs.push(finish_output(w, path, task.target_level)?);
        }
        Ok(())
    })();

    match result {
        Ok(()) => Ok(outputs),
        Err(e) => {
            if let Some((w, _)) = writer.take() {
                w.abort();
            }
            for meta in &outputs {
                let _ = std::fs::remove_file(&meta.path);
            }
            Err(e)
        }
    }
}

fn finish_output(
    writer: TableWriter,
    path: PathBuf,
    level: u32,
) -> Result<FileMetadata, EngineError> {
    let summary = writer.finish()?;
    Ok(FileMetadata {
        level,
        path,
        min_key: summary.min_key,
        max_key: summary.max_key,
        file_size: summary.file_size,
        key_count: summary.entry_count,
    })
}
