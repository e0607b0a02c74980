//! Block cache facade
//!
//! [`BlockCache`] ties the pieces together: the active writable file and its
//! rotation, the metadata index, admission and whole-file eviction, the
//! background flusher, and the optional insert worker.
//!
//! Locking: a cache-level `RwLock` serializes the insert path (duplicate
//! check, admission, append, index update) and file rotation. Lookups never
//! take it: they go through the sharded index and pin the target file with
//! a refcount taken under the file-table lock, so eviction can never delete
//! a file out from under a reader.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::buffer::BufferPool;
use crate::config::BlockCacheConfig;
use crate::device::CacheDevice;
use crate::error::Error;
use crate::file::{AppendOutcome, CacheFile};
use crate::flush::Flusher;
use crate::index::CacheMetadata;
use crate::record;
use crate::stats::{CacheStats, StatsSnapshot};

/// Eviction drains the cache to this fraction of the budget before
/// admitting new bytes.
const EVICTION_LOW_WATER: f64 = 0.9;

enum InsertOp {
    Insert { key: Vec<u8>, value: Vec<u8> },
    Quit,
}

struct WriterState<D: CacheDevice> {
    active: Arc<CacheFile<D>>,
    next_cache_id: u32,
}

/// A persistent secondary block cache.
///
/// Writes are staged in memory, flushed to numbered cache files in the
/// background, and indexed by key; the total on-disk footprint is bounded by
/// evicting whole files, least-recently-finalized first.
pub struct BlockCache<D: CacheDevice> {
    config: BlockCacheConfig,
    device: Arc<D>,
    cache_dir: PathBuf,
    pool: BufferPool,
    metadata: Arc<CacheMetadata<D>>,
    flusher: Flusher<D>,
    stats: Arc<CacheStats>,
    writer: RwLock<WriterState<D>>,
    bytes_used: AtomicU64,
    insert_tx: Option<Sender<InsertOp>>,
    insert_worker: Mutex<Option<thread::JoinHandle<()>>>,
    closed: AtomicBool,
}

impl<D: CacheDevice> BlockCache<D> {
    /// Create the cache directory and the first cache file, and start the
    /// background workers.
    pub fn open(config: BlockCacheConfig, device: D) -> Result<Arc<Self>, Error> {
        config.validate()?;

        let device = Arc::new(device);
        device.create_dir_if_missing(&config.path)?;
        let cache_dir = config.path.join(Uuid::new_v4().to_string());
        device.create_dir_if_missing(&cache_dir)?;
        info!(
            path = %cache_dir.display(),
            cache_size = config.cache_size,
            cache_file_size = config.cache_file_size,
            "opening block cache"
        );

        let pool = BufferPool::new(
            config.write_buffer_size as usize,
            config.write_buffer_count as usize,
            config.bufferpool_limit as usize,
        );
        let metadata = Arc::new(CacheMetadata::new());
        let stats = Arc::new(CacheStats::new());

        let finalize_meta = Arc::clone(&metadata);
        let flusher = Flusher::new(
            config.writer_qdepth,
            Arc::clone(&device),
            Arc::clone(&stats),
            Arc::new(move |file: &Arc<CacheFile<D>>| finalize_meta.mark_finalized(file)),
        );

        let active = Arc::new(CacheFile::create(
            device.as_ref(),
            &cache_dir,
            0,
            config.cache_file_size,
            pool.clone(),
        )?);
        metadata.insert_file(Arc::clone(&active));
        stats.record_file_created();

        let (insert_tx, insert_rx) = if config.pipeline_writes {
            let (tx, rx) = bounded(config.insert_queue_depth);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let cache = Arc::new(Self {
            config,
            device,
            cache_dir,
            pool,
            metadata,
            flusher,
            stats,
            writer: RwLock::new(WriterState {
                active,
                next_cache_id: 1,
            }),
            bytes_used: AtomicU64::new(0),
            insert_tx,
            insert_worker: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        if let Some(rx) = insert_rx {
            let weak = Arc::downgrade(&cache);
            *cache.insert_worker.lock() =
                Some(thread::spawn(move || insert_worker_loop(weak, rx)));
        }

        Ok(cache)
    }

    /// Store a key/value pair.
    ///
    /// With `pipeline_writes` the pair is copied, queued, and written by the
    /// insert worker; the call blocks only on the queue bound, and a pair
    /// refused later (capacity) is silently dropped. Without pipelining the
    /// insert happens inline and refusals are returned.
    ///
    /// Inserting an existing key succeeds and keeps the first value.
    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        self.stats.record_pipelined(value.len() as u64);

        if let Some(tx) = &self.insert_tx {
            let op = InsertOp::Insert {
                key: key.to_vec(),
                value: value.to_vec(),
            };
            return tx.send(op).map_err(|_| Error::Closed);
        }

        self.insert_impl(key, value)
    }

    /// Fetch the value stored for `key`. Integrity or I/O failures along the
    /// read path surface as a miss, never as a panic or wrong data.
    pub fn lookup(&self, key: &[u8]) -> Option<Vec<u8>> {
        let Some(lba) = self.metadata.lookup_lba(key) else {
            self.stats.record_miss();
            return None;
        };

        // The file can disappear between the two index lookups; that race
        // resolves as a miss.
        let Some(file) = self.metadata.lookup_file(lba.cache_id()) else {
            self.stats.record_miss();
            return None;
        };

        let Some(block) = file.read(&lba) else {
            self.stats.record_read_error();
            self.stats.record_miss();
            return None;
        };
        drop(file);

        if block.key() != key {
            debug_assert!(false, "index resolved to a record with another key");
            warn!(lba = %lba, "index/file key mismatch");
            self.stats.record_read_error();
            self.stats.record_miss();
            return None;
        }

        let value = block.value().to_vec();
        self.stats.record_hit(value.len() as u64);
        Some(value)
    }

    /// Whether `key` is currently indexed, without reading its bytes.
    pub fn contains(&self, key: &[u8]) -> bool {
        self.metadata.lookup_lba(key).is_some()
    }

    /// Drop `key` from the index. The record's bytes stay on disk until the
    /// containing file is evicted. Returns whether the key was present.
    pub fn erase(&self, key: &[u8]) -> bool {
        let _writer = self.writer.write();
        self.metadata.remove_block(key)
    }

    /// Admit `size` bytes against the cache budget, evicting files if
    /// necessary. `insert` performs its own admission; this entry point is
    /// for embedding tiers that pre-reserve.
    pub fn reserve(&self, size: u64) -> bool {
        let _writer = self.writer.write();
        self.reserve_locked(size)
    }

    /// Seal and dispatch the active file's partial buffer so everything
    /// accepted so far reaches the flusher.
    pub fn flush(&self) {
        let writer = self.writer.write();
        writer.active.flush(&self.flusher);
    }

    /// Stop the workers, draining queued inserts and dispatched buffers, and
    /// drop all metadata. Idempotent; also runs on drop.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(files = self.metadata.file_count(), "closing block cache");

        if let Some(tx) = &self.insert_tx {
            let _ = tx.send(InsertOp::Quit);
        }
        if let Some(worker) = self.insert_worker.lock().take() {
            let _ = worker.join();
        }

        self.flusher.stop();
        self.metadata.clear();
    }

    /// Current operation counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Bytes currently reserved against the budget.
    pub fn bytes_used(&self) -> u64 {
        self.bytes_used.load(Ordering::Relaxed)
    }

    /// The directory holding this instance's cache files.
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn insert_impl(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        let needed = record::encoded_len(key, value) as u64;
        if needed > self.config.cache_file_size as u64 {
            self.stats.record_insert_dropped();
            return Err(Error::RecordTooLarge(needed as usize));
        }

        let mut writer = self.writer.write();

        if self.metadata.lookup_lba(key).is_some() {
            // Duplicate insert; the first value wins.
            return Ok(());
        }

        if !self.reserve_locked(needed) {
            self.stats.record_insert_dropped();
            debug!(needed, "insert refused, cache full");
            return Err(Error::CacheFull);
        }

        let lba = loop {
            match writer.active.append(key, value, &self.flusher) {
                AppendOutcome::Appended(lba) => break lba,
                AppendOutcome::Eof => {
                    if let Err(e) = self.rotate_file(&mut writer) {
                        self.unreserve(needed);
                        return Err(e);
                    }
                }
                AppendOutcome::Retry => {
                    self.unreserve(needed);
                    return Err(Error::Busy);
                }
                AppendOutcome::TooLarge => {
                    self.unreserve(needed);
                    self.stats.record_insert_dropped();
                    return Err(Error::RecordTooLarge(needed as usize));
                }
            }
        };

        let handle = self.metadata.insert_block(key, lba);
        writer.active.add_handle(handle);
        self.stats.record_written(needed);

        Ok(())
    }

    /// Replace the full active file with a fresh one. The old file keeps
    /// draining; it finalizes from the flusher, or right here when nothing
    /// was left resident.
    fn rotate_file(&self, writer: &mut WriterState<D>) -> Result<(), Error> {
        let old = Arc::clone(&writer.active);

        let cache_id = writer.next_cache_id;
        info!(cache_id, "rotating to new cache file");
        let file = Arc::new(CacheFile::create(
            self.device.as_ref(),
            &self.cache_dir,
            cache_id,
            self.config.cache_file_size,
            self.pool.clone(),
        )?);
        self.metadata.insert_file(Arc::clone(&file));
        self.stats.record_file_created();
        writer.next_cache_id += 1;
        writer.active = file;

        if old.try_finalize(self.device.as_ref()) {
            self.metadata.mark_finalized(&old);
        }

        Ok(())
    }

    /// Admission under the cache-level write lock.
    fn reserve_locked(&self, size: u64) -> bool {
        let used = self.bytes_used.load(Ordering::Relaxed);
        if used.saturating_add(size) <= self.config.cache_size {
            self.bytes_used.fetch_add(size, Ordering::Relaxed);
            return true;
        }

        let low_water = (self.config.cache_size as f64 * EVICTION_LOW_WATER) as u64;
        while self.bytes_used.load(Ordering::Relaxed).saturating_add(size) > low_water {
            let Some(freed) = self.metadata.evict_one(self.device.as_ref()) else {
                // Nothing evictable; the caller gives up rather than wait.
                return false;
            };
            self.stats.record_file_evicted();
            let prev = self.bytes_used.fetch_sub(freed, Ordering::Relaxed);
            debug_assert!(prev >= freed, "eviction freed more than was reserved");
        }

        self.bytes_used.fetch_add(size, Ordering::Relaxed);
        true
    }

    fn unreserve(&self, size: u64) {
        let prev = self.bytes_used.fetch_sub(size, Ordering::Relaxed);
        debug_assert!(prev >= size);
    }
}

impl<D: CacheDevice> Drop for BlockCache<D> {
    fn drop(&mut self) {
        self.close();
    }
}

fn insert_worker_loop<D: CacheDevice>(cache: Weak<BlockCache<D>>, rx: Receiver<InsertOp>) {
    while let Ok(op) = rx.recv() {
        let (key, value) = match op {
            InsertOp::Insert { key, value } => (key, value),
            InsertOp::Quit => break,
        };

        loop {
            let Some(cache) = cache.upgrade() else {
                return;
            };
            match cache.insert_impl(&key, &value) {
                Ok(()) => break,
                Err(Error::Busy) => {
                    // Transient buffer pressure; the flusher will free
                    // buffers shortly.
                    cache.stats.record_insert_retry();
                    drop(cache);
                    thread::yield_now();
                }
                Err(e) => {
                    debug!(error = %e, "pipelined insert dropped");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::FsDevice;
    use tempfile::tempdir;

    fn config(dir: &Path) -> BlockCacheConfig {
        BlockCacheConfig::new(dir)
            .with_cache_size(1 << 20)
            .with_cache_file_size(64 * 1024)
            .with_write_buffer_size(4 * 1024)
            .with_write_buffer_count(4)
            .with_bufferpool_limit(64 * 1024)
            .with_pipeline_writes(false)
    }

    #[test]
    fn test_open_creates_directory() {
        let dir = tempdir().unwrap();
        let cache = BlockCache::open(config(dir.path()), FsDevice::new()).unwrap();
        assert!(cache.cache_dir().is_dir());
        assert!(cache.cache_dir().join("0").is_file());
        cache.close();
    }

    #[test]
    fn test_insert_lookup_erase() {
        let dir = tempdir().unwrap();
        let cache = BlockCache::open(config(dir.path()), FsDevice::new()).unwrap();

        cache.insert(b"a", b"alpha").unwrap();
        assert!(cache.contains(b"a"));
        assert_eq!(cache.lookup(b"a").as_deref(), Some(&b"alpha"[..]));

        assert!(cache.erase(b"a"));
        assert!(!cache.contains(b"a"));
        assert_eq!(cache.lookup(b"a"), None);
        assert!(!cache.erase(b"a"));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        cache.close();
    }

    #[test]
    fn test_close_is_idempotent() {
        let dir = tempdir().unwrap();
        let cache = BlockCache::open(config(dir.path()), FsDevice::new()).unwrap();
        cache.close();
        cache.close();
        assert!(matches!(cache.insert(b"k", b"v"), Err(Error::Closed)));
    }

    #[test]
    fn test_oversized_record_refused() {
        let dir = tempdir().unwrap();
        let cache = BlockCache::open(config(dir.path()), FsDevice::new()).unwrap();
        let huge = vec![0u8; 128 * 1024];
        assert!(matches!(
            cache.insert(b"big", &huge),
            Err(Error::RecordTooLarge(_))
        ));
        cache.close();
    }
}
