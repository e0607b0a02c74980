//! Storage traits for cache files

use std::io;
use std::path::Path;

/// A single cache file opened through a [`CacheDevice`].
///
/// Handles are shared between the writable file, the flusher, and concurrent
/// readers, so all operations take `&self`; implementations synchronize
/// internally.
pub trait DeviceFile: Send + Sync + 'static {
    /// Read up to `buf.len()` bytes at `offset`. Returns the number of bytes
    /// read; fewer than requested means the file ends inside the range.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Write all of `buf` at `offset`.
    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()>;

    /// Flush written data to stable storage.
    fn sync(&self) -> io::Result<()>;
}

/// Filesystem operations the cache needs from its environment.
pub trait CacheDevice: Send + Sync + 'static {
    /// Handle type for opened cache files.
    type File: DeviceFile;

    /// Create a directory and any missing parents.
    fn create_dir_if_missing(&self, path: &Path) -> io::Result<()>;

    /// Create (or truncate) a cache file for writing. The returned handle
    /// must also support positional reads of already-written bytes.
    fn open_writable(&self, path: &Path) -> io::Result<Self::File>;

    /// Open an existing, finalized cache file for positional reads.
    fn open_readable(&self, path: &Path) -> io::Result<Self::File>;

    /// Delete a cache file.
    fn delete_file(&self, path: &Path) -> io::Result<()>;

    /// Size of a cache file in bytes.
    fn file_size(&self, path: &Path) -> io::Result<u64>;

    /// Whether a path exists.
    fn exists(&self, path: &Path) -> bool;
}
