use crate::engine::{Engine, EngineConfig};
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times; only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Entries per table (and memtable capacity) under [`small_config`].
pub const SMALL_TABLE_ENTRIES: usize = 8;

/// Eight entries per table, 256-bit Bloom filters, no fsync.
///
/// Flushes and compaction rounds happen after a handful of writes.
pub fn small_config() -> EngineConfig {
    init_tracing();
    EngineConfig {
        max_table_bytes: 32 + 32 + 20 * SMALL_TABLE_ENTRIES as u64,
        bloom_bits: 256,
        bloom_hashes: 3,
        use_bloom: true,
        level_fanout: 2,
        sync_writes: false,
        vlog_path: None,
    }
}

/// Large tables: nothing is flushed unless asked to.
pub fn memtable_only_config() -> EngineConfig {
    init_tracing();
    EngineConfig {
        sync_writes: false,
        ..EngineConfig::default()
    }
}

/// `i + 1` copies of `'s'`.
pub fn value_for(i: u64) -> Vec<u8> {
    vec![b's'; i as usize + 1]
}

/// Opens a small-table engine and writes `value_for(k)` for every `k` in `keys`.
pub fn engine_with_keys(path: &Path, keys: impl IntoIterator<Item = u64>) -> Engine {
    let engine = Engine::open(path, small_config()).expect("open");
    for k in keys {
        engine.put(k, value_for(k)).expect("put");
    }
    engine
}

/// Reopens with the small-table config.
pub fn reopen(path: &Path) -> Engine {
    Engine::open(path, small_config()).expect("reopen")
}

/// Per-key `get` over `[lo, hi]`, the reference for merge scans.
pub fn scan_by_get(engine: &Engine, lo: u64, hi: u64) -> Vec<(u64, Vec<u8>)> {
    (lo..=hi)
        .filter_map(|k| engine.get(k).expect("get").map(|v| (k, v)))
        .collect()
}
