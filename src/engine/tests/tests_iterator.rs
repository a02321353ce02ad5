//! Forward iteration: ordering, newest-wins, tombstone suppression.

use crate::engine::iter::KvIterator;
use crate::engine::tests::helpers::*;
use crate::engine::Engine;
use tempfile::TempDir;

#[test]
fn yields_keys_in_ascending_order_exactly_once() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(tmp.path(), memtable_only_config()).unwrap();

    for i in [9u32, 3, 7, 1, 5, 0, 8, 2, 6, 4] {
        engine
            .put(format!("key_{i}").into_bytes(), format!("val_{i}").into_bytes())
            .unwrap();
    }

    let entries = collect_all(&engine);
    assert_eq!(entries.len(), 10);
    for (i, (key, value)) in entries.iter().enumerate() {
        assert_eq!(key, &format!("key_{i}").into_bytes());
        assert_eq!(value, &format!("val_{i}").into_bytes());
    }
}

#[test]
fn merges_across_memtable_and_sstables() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(tmp.path(), memtable_only_config()).unwrap();

    // Odd keys flushed to disk, even keys in the memtable.
    for i in (1..20u32).step_by(2) {
        engine.put(format!("k_{i:02}").into_bytes(), b"disk".to_vec()).unwrap();
    }
    engine.flush().unwrap();
    for i in (0..20u32).step_by(2) {
        engine.put(format!("k_{i:02}").into_bytes(), b"mem".to_vec()).unwrap();
    }

    let entries = collect_all(&engine);
    assert_eq!(entries.len(), 20);
    let keys: Vec<_> = entries.iter().map(|(k, _)| k.clone()).collect();
    let mut sorted = keys.clone();
    sorted.sort();
    assert_eq!(keys, sorted);
}

#[test]
fn newest_version_wins_across_layers() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(tmp.path(), memtable_only_config()).unwrap();

    engine.put(b"k".to_vec(), b"old".to_vec()).unwrap();
    engine.flush().unwrap();
    engine.put(b"k".to_vec(), b"mid".to_vec()).unwrap();
    engine.flush().unwrap();
    engine.put(b"k".to_vec(), b"new".to_vec()).unwrap();

    let entries = collect_all(&engine);
    assert_eq!(entries, vec![(b"k".to_vec(), b"new".to_vec())]);
}

#[test]
fn tombstones_are_suppressed() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(tmp.path(), memtable_only_config()).unwrap();

    engine.put(b"a".to_vec(), b"1".to_vec()).unwrap();
    engine.put(b"b".to_vec(), b"2".to_vec()).unwrap();
    engine.put(b"c".to_vec(), b"3".to_vec()).unwrap();
    engine.flush().unwrap();
    engine.delete(b"b".to_vec()).unwrap();

    let entries = collect_all(&engine);
    assert_eq!(
        entries,
        vec![
            (b"a".to_vec(), b"1".to_vec()),
            (b"c".to_vec(), b"3".to_vec())
        ]
    );
}

#[test]
fn deleted_then_rewritten_key_shows_latest() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(tmp.path(), memtable_only_config()).unwrap();

    engine.put(b"k".to_vec(), b"v1".to_vec()).unwrap();
    engine.flush().unwrap();
    engine.delete(b"k".to_vec()).unwrap();
    engine.flush().unwrap();
    engine.put(b"k".to_vec(), b"v2".to_vec()).unwrap();

    let entries = collect_all(&engine);
    assert_eq!(entries, vec![(b"k".to_vec(), b"v2".to_vec())]);
}

#[test]
fn iterator_is_a_point_in_time_view() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(tmp.path(), memtable_only_config()).unwrap();

    engine.put(b"a".to_vec(), b"1".to_vec()).unwrap();
    let iter = engine.iter().unwrap();

    // Writes after construction are invisible to this iterator.
    engine.put(b"b".to_vec(), b"2".to_vec()).unwrap();

    let entries: Vec<_> = iter.collect();
    assert_eq!(entries, vec![(b"a".to_vec(), b"1".to_vec())]);
}

#[test]
fn empty_engine_yields_nothing() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(tmp.path(), memtable_only_config()).unwrap();
    assert!(collect_all(&engine).is_empty());
}

#[test]
fn trait_surface_matches_iterator_protocol() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(tmp.path(), memtable_only_config()).unwrap();
    engine.put(b"a".to_vec(), b"1".to_vec()).unwrap();
    engine.delete(b"zz".to_vec()).unwrap();

    let mut iter = engine.iter().unwrap();
    assert!(iter.advance());
    assert_eq!(iter.key(), b"a");
    assert_eq!(iter.value().value, b"1");
    assert!(!iter.value().tombstone);
    assert!(!iter.advance());
    assert!(iter.error().is_none());
    iter.close();
    assert!(!iter.advance());
}

#[test]
fn large_iteration_across_many_layers() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(tmp.path(), small_flush_config(32)).unwrap();

    for i in 0..500u32 {
        engine
            .put(format!("key_{i:05}").into_bytes(), format!("val_{i:05}").into_bytes())
            .unwrap();
    }
    // Overwrite a slice so duplicates exist across layers.
    for i in 100..200u32 {
        engine
            .put(format!("key_{i:05}").into_bytes(), b"updated".to_vec())
            .unwrap();
    }
    engine.flush().unwrap();

    let entries = collect_all(&engine);
    assert_eq!(entries.len(), 500);
    for (i, (key, value)) in entries.iter().enumerate() {
        assert_eq!(key, &format!("key_{i:05}").into_bytes());
        if (100..200).contains(&i) {
            assert_eq!(value, &b"updated".to_vec());
        } else {
            assert_eq!(value, &format!("val_{i:05}").into_bytes());
        }
    }
}
