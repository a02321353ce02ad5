mod tests_persistence;

use crate::manifest::FileMetadata;
use std::path::PathBuf;

pub(crate) fn meta(level: u32, name: &str, min: &[u8], max: &[u8]) -> FileMetadata {
    FileMetadata {
        level,
        path: PathBuf::from(format!("sst/{name}")),
        min_key: min.to_vec(),
        max_key: max.to_vec(),
        file_size: 1024,
        key_count: 10,
    }
}
