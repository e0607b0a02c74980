//! Shared test utilities

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use oxicache::{BlockCache, BlockCacheConfig, FsDevice};

/// A small synchronous cache configuration: tiny files and buffers so tests
/// exercise rotation and eviction with little data.
pub fn small_config(path: &Path) -> BlockCacheConfig {
    BlockCacheConfig::new(path)
        .with_cache_size(1 << 20)
        .with_cache_file_size(64 * 1024)
        .with_write_buffer_size(4 * 1024)
        .with_write_buffer_count(4)
        .with_bufferpool_limit(256 * 1024)
        .with_pipeline_writes(false)
}

/// Open a cache over the local filesystem.
pub fn open_cache(config: BlockCacheConfig) -> Arc<BlockCache<FsDevice>> {
    BlockCache::open(config, FsDevice::new()).expect("open cache")
}

/// Zero-padded test key.
pub fn padded_key(i: usize) -> Vec<u8> {
    format!("key_prefix_{i:08}").into_bytes()
}

/// Deterministic value for `padded_key(i)`.
pub fn value_for(i: usize, len: usize) -> Vec<u8> {
    vec![b'0' + (i % 10) as u8; len]
}

/// Poll `pred` until it holds or the timeout elapses.
pub fn wait_until(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    pred()
}

/// Sum of the on-disk sizes of every cache file in `dir`.
pub fn on_disk_bytes(dir: &Path) -> u64 {
    std::fs::read_dir(dir)
        .expect("cache dir readable")
        .flatten()
        .filter_map(|entry| entry.metadata().ok())
        .filter(|meta| meta.is_file())
        .map(|meta| meta.len())
        .sum()
}

/// Decimal-named cache files present in `dir`, sorted numerically.
pub fn cache_file_ids(dir: &Path) -> Vec<u32> {
    let mut ids: Vec<u32> = std::fs::read_dir(dir)
        .expect("cache dir readable")
        .flatten()
        .filter_map(|entry| entry.file_name().to_str().and_then(|n| n.parse().ok()))
        .collect();
    ids.sort_unstable();
    ids
}
