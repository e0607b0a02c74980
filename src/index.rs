//! Cache-wide metadata
//!
//! Two logical tables plus the eviction order:
//!
//! - the key index maps a key to a block handle, sharded by key hash so
//!   lookups only contend with writers of the same shard;
//! - the block arena maps a handle to its [`BlockInfo`] (key + LBA). Handles
//!   are `u64`s drawn from a counter and never reused, so a handle held by a
//!   file can always be resolved-or-ignored, never misresolved;
//! - the file table maps a `cache_id` to its [`CacheFile`] and keeps
//!   read-only files in finalization order for eviction.
//!
//! A key entry can briefly outlive its file while an eviction is tearing the
//! file down; lookups treat the window as a miss.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::device::CacheDevice;
use crate::file::CacheFile;
use crate::lba::Lba;

/// Never-reused identifier of one indexed block.
pub(crate) type BlockHandle = u64;

/// Index entry for one record.
pub(crate) struct BlockInfo {
    key: Box<[u8]>,
    lba: Lba,
}

const SHARD_COUNT: usize = 16;

fn key_shard(key: &[u8]) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish() as usize % SHARD_COUNT
}

struct FileTable<D: CacheDevice> {
    map: HashMap<u32, Arc<CacheFile<D>>>,
    /// Finalization order; the eviction victim is the first eligible entry.
    finalized: VecDeque<u32>,
}

/// A file checked out for reading. Holds one refcount; eviction skips the
/// file until the guard drops.
pub(crate) struct FileReadGuard<D: CacheDevice> {
    file: Arc<CacheFile<D>>,
}

impl<D: CacheDevice> Deref for FileReadGuard<D> {
    type Target = CacheFile<D>;

    fn deref(&self) -> &Self::Target {
        &self.file
    }
}

impl<D: CacheDevice> Drop for FileReadGuard<D> {
    fn drop(&mut self) {
        self.file.release_ref();
    }
}

/// The cache's metadata index.
pub(crate) struct CacheMetadata<D: CacheDevice> {
    key_shards: Vec<RwLock<HashMap<Box<[u8]>, BlockHandle>>>,
    block_shards: Vec<Mutex<HashMap<BlockHandle, BlockInfo>>>,
    next_handle: AtomicU64,
    files: RwLock<FileTable<D>>,
}

impl<D: CacheDevice> CacheMetadata<D> {
    pub(crate) fn new() -> Self {
        Self {
            key_shards: (0..SHARD_COUNT).map(|_| RwLock::default()).collect(),
            block_shards: (0..SHARD_COUNT).map(|_| Mutex::default()).collect(),
            next_handle: AtomicU64::new(0),
            files: RwLock::new(FileTable {
                map: HashMap::new(),
                finalized: VecDeque::new(),
            }),
        }
    }

    /// Index a record. The caller has already checked the key is absent.
    pub(crate) fn insert_block(&self, key: &[u8], lba: Lba) -> BlockHandle {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);

        let info = BlockInfo {
            key: key.into(),
            lba,
        };
        self.block_shards[handle as usize % SHARD_COUNT]
            .lock()
            .insert(handle, info);

        let prev = self.key_shards[key_shard(key)]
            .write()
            .insert(key.into(), handle);
        debug_assert!(prev.is_none(), "duplicate block for key");

        handle
    }

    /// Resolve a key to its address.
    pub(crate) fn lookup_lba(&self, key: &[u8]) -> Option<Lba> {
        let handle = *self.key_shards[key_shard(key)].read().get(key)?;
        self.block_shards[handle as usize % SHARD_COUNT]
            .lock()
            .get(&handle)
            .map(|info| info.lba)
    }

    /// Remove a key from the index. The on-disk record stays until its file
    /// is evicted. Returns whether the key was present.
    pub(crate) fn remove_block(&self, key: &[u8]) -> bool {
        let Some(handle) = self.key_shards[key_shard(key)].write().remove(key) else {
            return false;
        };
        self.block_shards[handle as usize % SHARD_COUNT]
            .lock()
            .remove(&handle);
        true
    }

    /// Drop one block by handle, used when evicting its file. The key entry
    /// is removed only if it still resolves to this handle.
    fn purge_handle(&self, handle: BlockHandle) {
        let Some(info) = self.block_shards[handle as usize % SHARD_COUNT]
            .lock()
            .remove(&handle)
        else {
            // Already erased through the key path.
            return;
        };

        let mut shard = self.key_shards[key_shard(&info.key)].write();
        if shard.get(info.key.as_ref()) == Some(&handle) {
            shard.remove(info.key.as_ref());
        }
    }

    /// Register a newly created file.
    pub(crate) fn insert_file(&self, file: Arc<CacheFile<D>>) {
        let mut files = self.files.write();
        let prev = files.map.insert(file.cache_id(), file);
        debug_assert!(prev.is_none(), "duplicate cache_id");
    }

    /// Record that a file has become read-only, making it evictable.
    pub(crate) fn mark_finalized(&self, file: &Arc<CacheFile<D>>) {
        let mut files = self.files.write();
        if files.map.contains_key(&file.cache_id()) {
            files.finalized.push_back(file.cache_id());
        }
    }

    /// Check a file out for reading, taking a refcount under the table lock
    /// so eviction cannot delete it while the guard lives.
    pub(crate) fn lookup_file(&self, cache_id: u32) -> Option<FileReadGuard<D>> {
        let files = self.files.read();
        let file = files.map.get(&cache_id)?;
        file.acquire_ref();
        Some(FileReadGuard {
            file: Arc::clone(file),
        })
    }

    /// Evict the least-recently-finalized file with no readers: detach it,
    /// purge its blocks, delete its bytes. Returns the bytes freed, or `None`
    /// when nothing is evictable.
    pub(crate) fn evict_one(&self, device: &D) -> Option<u64> {
        let victim = {
            let mut files = self.files.write();
            let pos = files.finalized.iter().position(|id| {
                files
                    .map
                    .get(id)
                    .is_some_and(|f| f.is_read_only() && f.ref_count() == 0)
            })?;
            let id = files.finalized.remove(pos).expect("position just found");
            files.map.remove(&id).expect("finalized id is mapped")
        };

        for handle in victim.take_handles() {
            self.purge_handle(handle);
        }

        match victim.delete(device) {
            Ok(size) => {
                debug!(cache_id = victim.cache_id(), size, "evicted cache file");
                Some(size)
            }
            Err(e) => {
                warn!(
                    cache_id = victim.cache_id(),
                    error = %e,
                    "failed to delete evicted file"
                );
                None
            }
        }
    }

    /// Number of registered files.
    pub(crate) fn file_count(&self) -> usize {
        self.files.read().map.len()
    }

    /// Drop every index entry and file reference. All refcounts must be zero.
    pub(crate) fn clear(&self) {
        let mut files = self.files.write();
        for file in files.map.values() {
            debug_assert_eq!(file.ref_count(), 0, "reader outlived close");
        }
        files.map.clear();
        files.finalized.clear();
        drop(files);

        for shard in &self.key_shards {
            shard.write().clear();
        }
        for shard in &self.block_shards {
            shard.lock().clear();
        }
    }
}
