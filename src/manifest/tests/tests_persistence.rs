//! Save/load round trips and the atomic-rename discipline.

use super::meta;
use crate::manifest::{MANIFEST_FILE, ManifestError, Version};
use tempfile::TempDir;

#[test]
fn save_then_load_round_trips() {
    let tmp = TempDir::new().unwrap();

    let mut v = Version::new();
    v.add_file(meta(0, "sst-L0-000001.sst", b"a", b"m"));
    v.add_file(meta(1, "sst-L1-000002.sst", b"a", b"f"));
    v.add_file(meta(1, "sst-L1-000003.sst", b"g", b"z"));
    v.save(tmp.path()).unwrap();

    let loaded = Version::load(tmp.path()).unwrap();
    assert_eq!(loaded, v);
}

#[test]
fn missing_manifest_loads_empty() {
    let tmp = TempDir::new().unwrap();
    let v = Version::load(tmp.path()).unwrap();
    assert!(v.is_empty());
}

#[test]
fn save_leaves_no_tmp_file_behind() {
    let tmp = TempDir::new().unwrap();
    let mut v = Version::new();
    v.add_file(meta(0, "f.sst", b"a", b"b"));
    v.save(tmp.path()).unwrap();

    assert!(tmp.path().join(MANIFEST_FILE).exists());
    assert!(!tmp.path().join("MANIFEST.tmp").exists());
}

#[test]
fn save_overwrites_previous_catalog() {
    let tmp = TempDir::new().unwrap();

    let mut v1 = Version::new();
    v1.add_file(meta(0, "old.sst", b"a", b"b"));
    v1.save(tmp.path()).unwrap();

    let mut v2 = Version::new();
    v2.add_file(meta(1, "new.sst", b"c", b"d"));
    v2.save(tmp.path()).unwrap();

    let loaded = Version::load(tmp.path()).unwrap();
    assert_eq!(loaded, v2);
}

#[test]
fn garbage_manifest_is_a_format_error() {
    let tmp = TempDir::new().unwrap();
    std::fs::write(tmp.path().join(MANIFEST_FILE), b"not json at all").unwrap();

    assert!(matches!(
        Version::load(tmp.path()),
        Err(ManifestError::Format(_))
    ));
}

#[test]
fn manifest_json_shape_is_a_level_map() {
    let tmp = TempDir::new().unwrap();
    let mut v = Version::new();
    v.add_file(meta(1, "sst-L1-000001.sst", b"a", b"b"));
    v.save(tmp.path()).unwrap();

    let raw = std::fs::read_to_string(tmp.path().join(MANIFEST_FILE)).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();

    // Top level is a map keyed by the level number as a string.
    let files = parsed.get("1").and_then(|v| v.as_array()).unwrap();
    let entry = files[0].as_object().unwrap();
    for field in ["level", "path", "minKey", "maxKey", "fileSize", "keyCount"] {
        assert!(entry.contains_key(field), "missing field {field}");
    }
}
