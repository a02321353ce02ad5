//! End-to-end scenarios through the public API.

use stratumdb::{Engine, EngineConfig, EngineError, KvIterator};
use tempfile::TempDir;

fn config() -> EngineConfig {
    EngineConfig {
        flush_size: 100_000,
        max_mem_bytes: 64 * 1024 * 1024,
        ..EngineConfig::default()
    }
}

#[test]
fn put_get_across_flush() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(tmp.path(), config()).unwrap();

    engine.put(b"a".to_vec(), b"1".to_vec()).unwrap();
    engine.put(b"b".to_vec(), b"2".to_vec()).unwrap();
    engine.flush().unwrap();

    assert_eq!(engine.get(b"a").unwrap(), b"1".to_vec());
    assert_eq!(engine.get(b"b").unwrap(), b"2".to_vec());
    assert!(matches!(engine.get(b"c"), Err(EngineError::NotFound)));

    engine.close().unwrap();
}

#[test]
fn tombstone_shadowing_through_flush_and_compaction() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(tmp.path(), config()).unwrap();

    engine.put(b"k".to_vec(), b"v1".to_vec()).unwrap();
    engine.flush().unwrap();
    engine.delete(b"k".to_vec()).unwrap();
    engine.flush().unwrap();

    // The tombstone shadows the flushed value.
    let entries: Vec<_> = engine.iter().unwrap().collect();
    assert!(entries.is_empty());

    // Compacting to the deepest level may drop the tombstone entirely;
    // the key stays gone either way.
    engine.compact().unwrap();
    assert!(matches!(engine.get(b"k"), Err(EngineError::NotFound)));

    engine.close().unwrap();
}

#[test]
fn crash_recovery_replays_the_wal() {
    let tmp = TempDir::new().unwrap();
    {
        let engine = Engine::open(tmp.path(), config()).unwrap();
        engine.put(b"x".to_vec(), b"10".to_vec()).unwrap();
        engine.put(b"y".to_vec(), b"20".to_vec()).unwrap();
        // Kill the process before any flush: drop without close.
        drop(engine);
    }

    let engine = Engine::open(tmp.path(), config()).unwrap();
    assert_eq!(engine.get(b"x").unwrap(), b"10".to_vec());
    assert_eq!(engine.get(b"y").unwrap(), b"20".to_vec());

    let entries: Vec<_> = engine.iter().unwrap().collect();
    assert_eq!(
        entries,
        vec![
            (b"x".to_vec(), b"10".to_vec()),
            (b"y".to_vec(), b"20".to_vec())
        ]
    );
    engine.close().unwrap();
}

#[test]
fn corrupt_wal_tail_loses_only_the_torn_record() {
    let tmp = TempDir::new().unwrap();
    {
        let engine = Engine::open(tmp.path(), config()).unwrap();
        engine.put(b"first".to_vec(), b"1".to_vec()).unwrap();
        engine.put(b"second".to_vec(), b"2".to_vec()).unwrap();
        drop(engine);
    }

    // Truncate the last 3 bytes of the newest WAL segment.
    let wal_dir = tmp.path().join("wal");
    let mut segments: Vec<_> = std::fs::read_dir(&wal_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .collect();
    segments.sort();
    let segment = segments.last().unwrap();
    let len = std::fs::metadata(segment).unwrap().len();
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(segment)
        .unwrap();
    file.set_len(len - 3).unwrap();
    file.sync_all().unwrap();

    let engine = Engine::open(tmp.path(), config()).unwrap();
    assert_eq!(engine.get(b"first").unwrap(), b"1".to_vec());
    assert!(matches!(engine.get(b"second"), Err(EngineError::NotFound)));
    engine.close().unwrap();
}

#[test]
fn merging_precedence_newest_wins() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(tmp.path(), config()).unwrap();

    engine.put(b"k".to_vec(), b"old".to_vec()).unwrap();
    engine.flush().unwrap();
    engine.put(b"k".to_vec(), b"new".to_vec()).unwrap();

    assert_eq!(engine.get(b"k").unwrap(), b"new".to_vec());
    let entries: Vec<_> = engine.iter().unwrap().collect();
    assert_eq!(entries, vec![(b"k".to_vec(), b"new".to_vec())]);

    engine.close().unwrap();
}

#[test]
fn iteration_is_sorted_and_exactly_once() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(
        tmp.path(),
        EngineConfig {
            flush_size: 64,
            max_immutable: 8,
            ..config()
        },
    )
    .unwrap();

    // Spread data over many layers with overwrites and deletes.
    for i in 0..400u32 {
        engine
            .put(
                format!("key_{:05}", i * 7 % 400).into_bytes(),
                format!("val_{i:05}").into_bytes(),
            )
            .unwrap();
    }
    for i in (0..400u32).step_by(3) {
        engine.delete(format!("key_{i:05}").into_bytes()).unwrap();
    }

    let entries: Vec<_> = engine.iter().unwrap().collect();

    let mut prev: Option<Vec<u8>> = None;
    for (key, _) in &entries {
        if let Some(p) = &prev {
            assert!(key > p, "strictly ascending, no duplicates");
        }
        prev = Some(key.clone());
    }
    // 400 keys minus the 134 deleted ones.
    assert_eq!(entries.len(), 400 - 134);

    engine.close().unwrap();
}

#[test]
fn read_your_writes_under_load() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(
        tmp.path(),
        EngineConfig {
            flush_size: 128,
            max_immutable: 8,
            ..config()
        },
    )
    .unwrap();

    for i in 0..2000u32 {
        let key = format!("key_{i:06}").into_bytes();
        let value = format!("val_{i:06}").into_bytes();
        engine.put(key.clone(), value.clone()).unwrap();
        assert_eq!(engine.get(&key).unwrap(), value);
    }
    engine.close().unwrap();
}

#[test]
fn dump_restore_round_trip() {
    let tmp = TempDir::new().unwrap();
    let dump_path = tmp.path().join("dump.json");

    {
        let engine = Engine::open(tmp.path().join("source"), config()).unwrap();
        for i in 0..20u32 {
            engine
                .put(
                    format!("users:{i}").into_bytes(),
                    format!(r#"{{"_id":"{i}","n":{i}}}"#).into_bytes(),
                )
                .unwrap();
        }
        engine.dump_db(&dump_path).unwrap();
        engine.close().unwrap();
    }

    let engine = Engine::open(tmp.path().join("target"), config()).unwrap();
    engine.restore_db(&dump_path).unwrap();

    let entries: Vec<_> = engine.iter().unwrap().collect();
    assert_eq!(entries.len(), 20);
    for i in 0..20u32 {
        let value = engine.get(format!("users:{i}").as_bytes()).unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&value).unwrap();
        assert_eq!(doc["_id"], format!("{i}"));
    }
    engine.close().unwrap();
}

#[test]
fn batch_atomicity_and_ordering() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(tmp.path(), config()).unwrap();

    let mut batch = engine.new_batch();
    batch.put(b"a".to_vec(), b"1".to_vec());
    batch.delete(b"a".to_vec());
    batch.put(b"a".to_vec(), b"3".to_vec());
    batch.put(b"b".to_vec(), b"2".to_vec());
    engine.apply_batch(&batch).unwrap();

    // Later entries shadow earlier ones on the same key.
    assert_eq!(engine.get(b"a").unwrap(), b"3".to_vec());
    assert_eq!(engine.get(b"b").unwrap(), b"2".to_vec());
    engine.close().unwrap();
}

#[test]
fn iterator_protocol_surface() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(tmp.path(), config()).unwrap();
    engine.put(b"one".to_vec(), b"1".to_vec()).unwrap();

    let mut iter = engine.iter().unwrap();
    assert!(iter.advance());
    assert_eq!(iter.key(), b"one");
    assert_eq!(iter.value().value, b"1".to_vec());
    assert!(!iter.advance());
    assert!(iter.error().is_none());
    iter.close();

    engine.close().unwrap();
}

#[test]
fn metrics_are_exposed() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(tmp.path(), config()).unwrap();

    engine.put(b"a".to_vec(), b"1".to_vec()).unwrap();
    engine.delete(b"a".to_vec()).unwrap();
    let _ = engine.get(b"a");
    engine.flush().unwrap();

    let m = engine.metrics();
    assert_eq!(m.puts, 1);
    assert_eq!(m.deletes, 1);
    assert_eq!(m.gets, 1);
    assert_eq!(m.flushes, 1);

    engine.close().unwrap();
}
