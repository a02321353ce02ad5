//! Lifecycle: close semantics, idempotence, rejection of late operations.

use crate::engine::tests::helpers::*;
use crate::engine::{Engine, EngineError};
use tempfile::TempDir;

#[test]
fn close_flushes_buffered_writes() {
    let tmp = TempDir::new().unwrap();
    {
        let engine = Engine::open(tmp.path(), memtable_only_config()).unwrap();
        engine.put(b"buffered".to_vec(), b"v".to_vec()).unwrap();
        engine.close().unwrap();
    }

    // Everything was persisted to an SSTable; the reopened engine reads it
    // without replaying any WAL.
    let engine = Engine::open(tmp.path(), memtable_only_config()).unwrap();
    assert_eq!(engine.get(b"buffered").unwrap(), b"v".to_vec());
}

#[test]
fn close_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(tmp.path(), memtable_only_config()).unwrap();
    engine.put(b"k".to_vec(), b"v".to_vec()).unwrap();

    engine.close().unwrap();
    engine.close().unwrap();
    engine.close().unwrap();
}

#[test]
fn close_from_multiple_threads() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(tmp.path(), memtable_only_config()).unwrap();
    engine.put(b"k".to_vec(), b"v".to_vec()).unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let engine = engine.clone();
            std::thread::spawn(move || engine.close())
        })
        .collect();
    for h in handles {
        h.join().unwrap().unwrap();
    }
}

#[test]
fn mutations_rejected_after_close() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(tmp.path(), memtable_only_config()).unwrap();
    engine.close().unwrap();

    assert!(matches!(
        engine.put(b"k".to_vec(), b"v".to_vec()),
        Err(EngineError::Closed)
    ));
    assert!(matches!(
        engine.delete(b"k".to_vec()),
        Err(EngineError::Closed)
    ));
    let mut batch = engine.new_batch();
    batch.put(b"k".to_vec(), b"v".to_vec());
    assert!(matches!(
        engine.apply_batch(&batch),
        Err(EngineError::Closed)
    ));
    assert!(matches!(engine.compact(), Err(EngineError::Closed)));
}

#[test]
fn reads_rejected_after_close() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(tmp.path(), memtable_only_config()).unwrap();
    engine.put(b"k".to_vec(), b"v".to_vec()).unwrap();
    engine.close().unwrap();

    assert!(matches!(engine.get(b"k"), Err(EngineError::Closed)));
    assert!(engine.iter().is_err());
}

#[test]
fn close_empty_engine() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(tmp.path(), memtable_only_config()).unwrap();
    engine.close().unwrap();
}
