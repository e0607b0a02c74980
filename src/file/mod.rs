//! Cache files
//!
//! A [`CacheFile`] owns one on-disk file named by its decimal `cache_id`. It
//! starts writable, with appends staging records in write buffers while the
//! flusher drains them to disk, and becomes read-only in place once it has
//! hit its size limit and every dispatched buffer has been written. Reads
//! work in every state: from resident buffers, from the flushed prefix of a
//! writable file, or through the positional reader after finalization.
//!
//! The writable/read-only split is a tagged state behind the per-file lock;
//! the identity (`cache_id`, path, refcount, owned block handles) lives in
//! the shared part and survives the transition.

mod writable;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::buffer::BufferPool;
use crate::device::{CacheDevice, DeviceFile};
use crate::flush::Flusher;
use crate::index::BlockHandle;
use crate::lba::Lba;
use crate::record;

pub(crate) use writable::AppendOutcome;
use writable::WritableState;

/// A record read out of a cache file, carrying its scratch buffer.
pub(crate) struct ParsedBlock {
    scratch: Vec<u8>,
    key_len: usize,
}

impl ParsedBlock {
    /// The key embedded in the record.
    pub(crate) fn key(&self) -> &[u8] {
        &self.scratch[record::HEADER_SIZE..record::HEADER_SIZE + self.key_len]
    }

    /// The value embedded in the record.
    pub(crate) fn value(&self) -> &[u8] {
        let end = self.scratch.len() - record::TRAILER_SIZE;
        &self.scratch[record::HEADER_SIZE + self.key_len..end]
    }

}

struct ReadOnlyState<D: CacheDevice> {
    file: Arc<D::File>,
}

enum FileState<D: CacheDevice> {
    Writable(WritableState<D>),
    ReadOnly(ReadOnlyState<D>),
}

/// One cache file: shared identity plus a writable/read-only state.
pub(crate) struct CacheFile<D: CacheDevice> {
    cache_id: u32,
    path: PathBuf,
    /// Readers currently holding this file; eviction requires zero.
    refs: AtomicU32,
    /// Block handles owned by this file, purged from the index at eviction.
    handles: Mutex<Vec<BlockHandle>>,
    state: RwLock<FileState<D>>,
}

impl<D: CacheDevice> CacheFile<D> {
    /// Create the backing file and a writable cache file over it.
    pub(crate) fn create(
        device: &D,
        dir: &Path,
        cache_id: u32,
        max_size: u32,
        pool: BufferPool,
    ) -> std::io::Result<Self> {
        let path = dir.join(cache_id.to_string());
        debug!(cache_id, path = %path.display(), max_size, "creating cache file");

        if device.exists(&path) {
            warn!(path = %path.display(), "cache file already exists, truncating");
        }
        let file = device.open_writable(&path)?;

        Ok(Self {
            cache_id,
            path,
            refs: AtomicU32::new(0),
            handles: Mutex::new(Vec::new()),
            state: RwLock::new(FileState::Writable(WritableState::new(
                Arc::new(file),
                max_size,
                pool,
            ))),
        })
    }

    /// File identifier.
    #[inline]
    pub(crate) fn cache_id(&self) -> u32 {
        self.cache_id
    }

    /// Append an encoded record, returning its address or why it was
    /// refused. Sealed buffers are handed to `flusher` as a side effect.
    pub(crate) fn append(
        self: &Arc<Self>,
        key: &[u8],
        value: &[u8],
        flusher: &Flusher<D>,
    ) -> AppendOutcome {
        let mut state = self.state.write();
        match &mut *state {
            FileState::Writable(w) => w.append(self, key, value, flusher),
            FileState::ReadOnly(_) => {
                debug_assert!(false, "append on finalized file {}", self.cache_id);
                AppendOutcome::Eof
            }
        }
    }

    /// Read the record at `lba`. Any failure (short read, checksum
    /// mismatch, I/O error) is a miss, not an error.
    pub(crate) fn read(&self, lba: &Lba) -> Option<ParsedBlock> {
        debug_assert_eq!(lba.cache_id(), self.cache_id);

        let state = self.state.read();
        let scratch = match &*state {
            FileState::ReadOnly(r) => self.read_from_handle(r.file.as_ref(), lba)?,
            FileState::Writable(w) => {
                if lba.end() <= w.disk_woff() as u64 {
                    self.read_from_handle(w.handle(), lba)?
                } else {
                    w.read_resident(lba)?
                }
            }
        };
        drop(state);

        self.parse(scratch, lba)
    }

    fn read_from_handle(&self, file: &D::File, lba: &Lba) -> Option<Vec<u8>> {
        let mut scratch = vec![0u8; lba.size() as usize];
        match file.read_at(lba.offset() as u64, &mut scratch) {
            Ok(n) if n == scratch.len() => Some(scratch),
            Ok(n) => {
                warn!(
                    cache_id = self.cache_id,
                    lba = %lba,
                    read = n,
                    "short read from cache file"
                );
                None
            }
            Err(e) => {
                warn!(cache_id = self.cache_id, lba = %lba, error = %e, "cache file read failed");
                None
            }
        }
    }

    fn parse(&self, scratch: Vec<u8>, lba: &Lba) -> Option<ParsedBlock> {
        match record::decode(&scratch) {
            Ok(rec) => {
                let key_len = rec.key().len();
                Some(ParsedBlock { scratch, key_len })
            }
            Err(e) => {
                warn!(
                    cache_id = self.cache_id,
                    lba = %lba,
                    error = ?e,
                    "failed to decode cache record"
                );
                None
            }
        }
    }

    /// Seal and dispatch the tail buffer, if any, so every accepted record
    /// is on its way to disk.
    pub(crate) fn flush(self: &Arc<Self>, flusher: &Flusher<D>) {
        let mut state = self.state.write();
        if let FileState::Writable(w) = &mut *state {
            w.flush(self, flusher);
        }
    }

    /// Bookkeeping after the flusher wrote one buffer. Returns `true` when
    /// the file has hit EOF and drained completely, i.e. is ready to
    /// finalize.
    pub(crate) fn buffer_write_done(&self) -> bool {
        let mut state = self.state.write();
        match &mut *state {
            FileState::Writable(w) => w.write_done(),
            FileState::ReadOnly(_) => {
                debug_assert!(false, "write completion on finalized file {}", self.cache_id);
                false
            }
        }
    }

    /// Transition to read-only if EOF has been reached and nothing is
    /// resident. Returns `true` on the transition that actually happened.
    pub(crate) fn try_finalize(&self, device: &D) -> bool {
        let mut state = self.state.write();
        let drained = match &*state {
            FileState::Writable(w) => w.drained(),
            FileState::ReadOnly(_) => false,
        };
        if !drained {
            return false;
        }

        if let FileState::Writable(w) = &*state {
            if let Err(e) = w.handle().sync() {
                warn!(cache_id = self.cache_id, error = %e, "sync before finalize failed");
            }
        }

        match device.open_readable(&self.path) {
            Ok(file) => {
                debug!(cache_id = self.cache_id, "cache file finalized");
                *state = FileState::ReadOnly(ReadOnlyState {
                    file: Arc::new(file),
                });
                true
            }
            Err(e) => {
                warn!(
                    cache_id = self.cache_id,
                    error = %e,
                    "reopen for read failed, file stays writable"
                );
                false
            }
        }
    }

    /// Whether the file has finalized.
    pub(crate) fn is_read_only(&self) -> bool {
        matches!(&*self.state.read(), FileState::ReadOnly(_))
    }

    /// Delete the backing file, returning the bytes it occupied on disk.
    pub(crate) fn delete(&self, device: &D) -> std::io::Result<u64> {
        debug_assert_eq!(self.refs.load(Ordering::Acquire), 0);
        let size = device.file_size(&self.path)?;
        device.delete_file(&self.path)?;
        debug!(cache_id = self.cache_id, size, "cache file deleted");
        Ok(size)
    }

    /// Attach a block handle owned by this file.
    pub(crate) fn add_handle(&self, handle: BlockHandle) {
        self.handles.lock().push(handle);
    }

    /// Detach and return every block handle this file owns.
    pub(crate) fn take_handles(&self) -> Vec<BlockHandle> {
        std::mem::take(&mut self.handles.lock())
    }

    #[inline]
    pub(crate) fn acquire_ref(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    #[inline]
    pub(crate) fn release_ref(&self) {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
    }

    #[inline]
    pub(crate) fn ref_count(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }
}
