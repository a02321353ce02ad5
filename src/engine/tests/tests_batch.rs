//! Atomic batch application.

use crate::engine::tests::helpers::*;
use crate::engine::{Engine, EngineError};
use tempfile::TempDir;

#[test]
fn batch_applies_all_entries() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(tmp.path(), memtable_only_config()).unwrap();

    let mut batch = engine.new_batch();
    batch.put(b"a".to_vec(), b"1".to_vec());
    batch.put(b"b".to_vec(), b"2".to_vec());
    batch.delete(b"c".to_vec());
    assert_eq!(batch.len(), 3);

    engine.apply_batch(&batch).unwrap();

    assert_eq!(engine.get(b"a").unwrap(), b"1".to_vec());
    assert_eq!(engine.get(b"b").unwrap(), b"2".to_vec());
    assert!(matches!(engine.get(b"c"), Err(EngineError::NotFound)));
}

#[test]
fn empty_batch_is_a_no_op() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(tmp.path(), memtable_only_config()).unwrap();

    let batch = engine.new_batch();
    engine.apply_batch(&batch).unwrap();
    assert_eq!(engine.metrics().puts, 0);
}

#[test]
fn duplicate_keys_last_entry_wins() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(tmp.path(), memtable_only_config()).unwrap();

    let mut batch = engine.new_batch();
    batch.put(b"k".to_vec(), b"first".to_vec());
    batch.put(b"k".to_vec(), b"second".to_vec());
    engine.apply_batch(&batch).unwrap();
    assert_eq!(engine.get(b"k").unwrap(), b"second".to_vec());

    let mut batch = engine.new_batch();
    batch.put(b"k".to_vec(), b"third".to_vec());
    batch.delete(b"k".to_vec());
    engine.apply_batch(&batch).unwrap();
    assert!(matches!(engine.get(b"k"), Err(EngineError::NotFound)));
}

#[test]
fn batch_survives_restart() {
    let tmp = TempDir::new().unwrap();
    {
        let engine = Engine::open(tmp.path(), memtable_only_config()).unwrap();
        let mut batch = engine.new_batch();
        for i in 0..50u32 {
            batch.put(format!("b_{i:03}").into_bytes(), format!("v_{i:03}").into_bytes());
        }
        engine.apply_batch(&batch).unwrap();
        engine.close().unwrap();
    }

    let engine = Engine::open(tmp.path(), memtable_only_config()).unwrap();
    for i in 0..50u32 {
        assert_eq!(
            engine.get(format!("b_{i:03}").as_bytes()).unwrap(),
            format!("v_{i:03}").into_bytes()
        );
    }
}

#[test]
fn batch_counts_in_metrics() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(tmp.path(), memtable_only_config()).unwrap();

    let mut batch = engine.new_batch();
    batch.put(b"a".to_vec(), b"1".to_vec());
    batch.put(b"b".to_vec(), b"2".to_vec());
    batch.delete(b"a".to_vec());
    engine.apply_batch(&batch).unwrap();

    let m = engine.metrics();
    assert_eq!(m.puts, 2);
    assert_eq!(m.deletes, 1);
}

#[test]
fn batch_can_trigger_rotation() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(tmp.path(), small_flush_config(8)).unwrap();

    let mut batch = engine.new_batch();
    for i in 0..20u32 {
        batch.put(format!("k_{i:03}").into_bytes(), b"v".to_vec());
    }
    engine.apply_batch(&batch).unwrap();
    engine.flush().unwrap();

    for i in 0..20u32 {
        assert_eq!(
            engine.get(format!("k_{i:03}").as_bytes()).unwrap(),
            b"v".to_vec()
        );
    }
}
