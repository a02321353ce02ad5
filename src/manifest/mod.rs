//! # Manifest Component
//!
//! The manifest is the durable catalog of the LSM tree: which SSTable files
//! are live, at which level, and what key range each covers. The in-memory
//! form is a [`Version`] — an immutable snapshot the engine swaps atomically
//! after every flush or compaction — and the on-disk form is a JSON file
//! named `MANIFEST` in the engine directory.
//!
//! ## Durability strategy
//!
//! The manifest is rewritten in full on every mutation using the
//! atomic-rename pattern: serialize to `MANIFEST.tmp`, fsync, then rename
//! over `MANIFEST`. POSIX same-filesystem rename atomicity guarantees that
//! a crash leaves either the old or the new catalog, never a torn one.
//! The manifest on disk always reflects the engine's current version
//! **before** any obsolete file is deleted, so a crash can strand unused
//! files (cleaned up at next open) but can never reference missing ones.
//!
//! ## Level invariants
//!
//! - L0 files may overlap; they are stored oldest-first and queried
//!   newest-first.
//! - L1 and deeper hold non-overlapping files kept sorted by min-key, so a
//!   point lookup touches at most one file per level.

#[cfg(test)]
mod tests;

use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// File name of the durable catalog inside the engine directory.
pub const MANIFEST_FILE: &str = "MANIFEST";

const MANIFEST_TMP_FILE: &str = "MANIFEST.tmp";

/// Errors returned by manifest operations.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The manifest file is not valid JSON or has an unexpected shape.
    #[error("manifest format error: {0}")]
    Format(#[from] serde_json::Error),
}

/// The per-file record persisted in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    /// Level the file belongs to.
    pub level: u32,

    /// Path of the SSTable file on disk.
    pub path: PathBuf,

    /// Smallest key stored in the file.
    pub min_key: Vec<u8>,

    /// Largest key stored in the file.
    pub max_key: Vec<u8>,

    /// Total file size in bytes.
    pub file_size: u64,

    /// Number of entries (tombstones included).
    pub key_count: u64,
}

impl FileMetadata {
    /// Whether `key` falls within this file's `[min_key, max_key]` range.
    pub fn contains(&self, key: &[u8]) -> bool {
        self.min_key.as_slice() <= key && key <= self.max_key.as_slice()
    }

    /// Whether this file's key range intersects `[min, max]`.
    pub fn overlaps(&self, min: &[u8], max: &[u8]) -> bool {
        self.min_key.as_slice() <= max && min <= self.max_key.as_slice()
    }
}

/// An immutable snapshot of the on-disk catalog: level → ordered files.
///
/// Serializes as a plain JSON map from level number (as a string) to the
/// array of [`FileMetadata`] on that level.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version {
    levels: BTreeMap<u32, Vec<FileMetadata>>,
}

impl Version {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a file into its level.
    ///
    /// L0 files are appended (newest-last storage order); files on L1 and
    /// deeper are insert-sorted by min-key so the non-overlap invariant
    /// keeps the list binary-searchable.
    pub fn add_file(&mut self, meta: FileMetadata) {
        let files = self.levels.entry(meta.level).or_default();
        if meta.level == 0 {
            files.push(meta);
        } else {
            let at = files
                .binary_search_by(|f| f.min_key.cmp(&meta.min_key))
                .unwrap_or_else(|i| i);
            files.insert(at, meta);
        }
    }

    /// Removes files by path, from every level. Unknown paths are ignored.
    pub fn delete_files(&mut self, paths: &[PathBuf]) {
        for files in self.levels.values_mut() {
            files.retain(|f| !paths.contains(&f.path));
        }
        self.levels.retain(|_, files| !files.is_empty());
    }

    /// Files of `level` in storage order (L0: oldest first).
    pub fn level_files(&self, level: u32) -> &[FileMetadata] {
        self.levels.get(&level).map_or(&[], Vec::as_slice)
    }

    /// L0 files in read order: newest first.
    pub fn l0_newest_first(&self) -> impl Iterator<Item = &FileMetadata> {
        self.level_files(0).iter().rev()
    }

    /// Deepest level that holds at least one file, if any.
    pub fn deepest_level(&self) -> Option<u32> {
        self.levels
            .iter()
            .filter(|(_, files)| !files.is_empty())
            .map(|(level, _)| *level)
            .next_back()
    }

    /// Iterates the populated levels at and below L1, ascending.
    pub fn lower_levels(&self) -> impl Iterator<Item = (u32, &[FileMetadata])> {
        self.levels
            .iter()
            .filter(|(level, _)| **level >= 1)
            .map(|(level, files)| (*level, files.as_slice()))
    }

    /// Total bytes stored on `level`.
    pub fn level_size(&self, level: u32) -> u64 {
        self.level_files(level).iter().map(|f| f.file_size).sum()
    }

    /// The single file on `level` (≥ 1) whose range contains `key`.
    ///
    /// Levels below L0 are non-overlapping and sorted by min-key, so a
    /// binary search suffices.
    pub fn file_containing(&self, level: u32, key: &[u8]) -> Option<&FileMetadata> {
        let files = self.level_files(level);
        let idx = match files.binary_search_by(|f| f.min_key.as_slice().cmp(key)) {
            Ok(i) => i,
            Err(0) => return None,
            Err(i) => i - 1,
        };
        let candidate = &files[idx];
        candidate.contains(key).then_some(candidate)
    }

    /// Files of `level` overlapping the key range `[min, max]`.
    pub fn overlapping_files(&self, level: u32, min: &[u8], max: &[u8]) -> Vec<FileMetadata> {
        self.level_files(level)
            .iter()
            .filter(|f| f.overlaps(min, max))
            .cloned()
            .collect()
    }

    /// All files across all levels, L0 first, storage order within a level.
    pub fn all_files(&self) -> impl Iterator<Item = &FileMetadata> {
        self.levels.values().flatten()
    }

    /// Total number of live files.
    pub fn file_count(&self) -> usize {
        self.levels.values().map(Vec::len).sum()
    }

    /// Whether the catalog references no files at all.
    pub fn is_empty(&self) -> bool {
        self.levels.values().all(Vec::is_empty)
    }

    /// Loads the catalog from `dir/MANIFEST`, or returns the empty catalog
    /// when the file does not exist yet.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let path = dir.as_ref().join(MANIFEST_FILE);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no manifest; starting empty");
                return Ok(Self::new());
            }
            Err(e) => return Err(ManifestError::Io(e)),
        };
        let version: Version = serde_json::from_slice(&bytes)?;
        info!(
            path = %path.display(),
            files = version.file_count(),
            "manifest loaded"
        );
        Ok(version)
    }

    /// Persists the catalog to `dir/MANIFEST` with the atomic-rename
    /// pattern: write `MANIFEST.tmp`, fsync, rename.
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<(), ManifestError> {
        let dir = dir.as_ref();
        let tmp_path = dir.join(MANIFEST_TMP_FILE);
        let final_path = dir.join(MANIFEST_FILE);

        let bytes = serde_json::to_vec_pretty(self)?;
        let mut file = File::create(&tmp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp_path, &final_path)?;

        // Make the rename itself durable.
        if let Ok(dir_handle) = File::open(dir) {
            let _ = dir_handle.sync_all();
        }

        debug!(
            path = %final_path.display(),
            files = self.file_count(),
            "manifest persisted"
        );
        Ok(())
    }
}
