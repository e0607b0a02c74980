//! File rotation: records flow into numbered files in order, every record
//! stays reachable, and the on-disk bytes are exactly the dispatched buffers
//! in dispatch order.

mod common;

use std::time::Duration;

use oxicache::record;
use tempfile::tempdir;

use common::{cache_file_ids, open_cache, small_config, wait_until};

const RECORDS: usize = 20;

fn key(i: usize) -> Vec<u8> {
    format!("k{i:02}").into_bytes()
}

fn value(i: usize) -> Vec<u8> {
    vec![b'a' + (i % 26) as u8; 17]
}

/// 8 + 3 + 17 + 4 bytes per record: four per 128-byte buffer, eight per
/// 256-byte file.
fn rotation_config(path: &std::path::Path) -> oxicache::BlockCacheConfig {
    small_config(path)
        .with_cache_size(1 << 20)
        .with_cache_file_size(256)
        .with_write_buffer_size(128)
        .with_write_buffer_count(8)
        .with_bufferpool_limit(16 * 128)
}

#[test]
fn test_rotation_keeps_every_record_reachable() {
    let dir = tempdir().unwrap();
    let cache = open_cache(rotation_config(dir.path()));

    for i in 0..RECORDS {
        cache.insert(&key(i), &value(i)).unwrap();
    }

    // 20 records of 32 bytes at 8 per file: at least three files exist.
    let ids = cache_file_ids(cache.cache_dir());
    assert!(ids.len() >= 3, "expected >= 3 cache files, got {ids:?}");

    for i in 0..RECORDS {
        assert_eq!(cache.lookup(&key(i)), Some(value(i)), "record {i} lost");
    }

    cache.close();
}

#[test]
fn test_cache_ids_are_monotone_from_zero() {
    let dir = tempdir().unwrap();
    let cache = open_cache(rotation_config(dir.path()));

    for i in 0..RECORDS {
        cache.insert(&key(i), &value(i)).unwrap();
    }

    let ids = cache_file_ids(cache.cache_dir());
    let expected: Vec<u32> = (0..ids.len() as u32).collect();
    assert_eq!(ids, expected, "cache ids not contiguous from zero");

    cache.close();
}

#[test]
fn test_disk_content_is_records_in_append_order() {
    let dir = tempdir().unwrap();
    let cache = open_cache(rotation_config(dir.path()));

    for i in 0..RECORDS {
        cache.insert(&key(i), &value(i)).unwrap();
    }

    // The first file holds records 0..8 and finalizes once its two buffers
    // have been written.
    let file0 = cache.cache_dir().join("0");
    assert!(
        wait_until(Duration::from_secs(5), || {
            std::fs::metadata(&file0).map(|m| m.len()).unwrap_or(0) == 256
        }),
        "first file never fully flushed"
    );

    let mut expected = Vec::with_capacity(256);
    for i in 0..8 {
        let (k, v) = (key(i), value(i));
        let mut rec = vec![0u8; record::encoded_len(&k, &v)];
        record::encode_into(&mut rec, &k, &v);
        expected.extend_from_slice(&rec);
    }
    let actual = std::fs::read(&file0).unwrap();
    assert_eq!(actual, expected, "file 0 is not the dispatched buffers in order");

    // Reads of those records now come from disk and still verify.
    for i in 0..8 {
        assert_eq!(cache.lookup(&key(i)), Some(value(i)));
    }

    cache.close();
}
