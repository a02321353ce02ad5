use std::time::Duration;

use crate::engine::{Engine, EngineConfig};
use tracing_subscriber::EnvFilter;

/// Initialize tracing controlled by `RUST_LOG`. Safe to call repeatedly —
/// only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Large thresholds: nothing rotates unless the test asks for it.
pub fn memtable_only_config() -> EngineConfig {
    init_tracing();
    EngineConfig {
        flush_size: 100_000,
        max_mem_bytes: 64 * 1024 * 1024,
        ..EngineConfig::default()
    }
}

/// Rotates every `flush_size` entries; small blocks so tables have
/// several. A generous immutable cap keeps rotation-heavy tests from
/// tripping back-pressure when the flush worker is scheduled late.
pub fn small_flush_config(flush_size: usize) -> EngineConfig {
    init_tracing();
    EngineConfig {
        flush_size,
        max_mem_bytes: 64 * 1024 * 1024,
        max_immutable: 8,
        block_size: 256,
        ..EngineConfig::default()
    }
}

/// Back-pressure quickly: one entry per memtable, one pending flush slot.
pub fn backpressure_config() -> EngineConfig {
    init_tracing();
    EngineConfig {
        flush_size: 1,
        max_immutable: 1,
        rotate_timeout: Duration::from_millis(10),
        ..EngineConfig::default()
    }
}

/// Opens an engine and loads `n` keys of the form `key_%04d` → `val_%04d`.
pub fn engine_with_keys(path: &std::path::Path, config: EngineConfig, n: u32) -> Engine {
    let engine = Engine::open(path, config).expect("open");
    for i in 0..n {
        engine
            .put(format!("key_{i:04}").into_bytes(), format!("val_{i:04}").into_bytes())
            .expect("put");
    }
    engine
}

/// Collects the full forward iteration as (key, value) pairs.
pub fn collect_all(engine: &Engine) -> Vec<(Vec<u8>, Vec<u8>)> {
    engine.iter().expect("iter").collect()
}
