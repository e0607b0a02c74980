//! Standard-filesystem device

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use parking_lot::Mutex;

use crate::device::{CacheDevice, DeviceFile};

/// Cache file backed by a [`std::fs::File`].
///
/// The handle is opened read+write so the flushed prefix of a still-writable
/// cache file can be read back through it. A mutex serializes the seek/IO
/// pairs.
pub struct FsFile {
    file: Mutex<File>,
}

impl FsFile {
    fn new(file: File) -> Self {
        Self {
            file: Mutex::new(file),
        }
    }
}

impl DeviceFile for FsFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        let mut read = 0;
        while read < buf.len() {
            match file.read(&mut buf[read..]) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(read)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)
    }

    fn sync(&self) -> io::Result<()> {
        self.file.lock().sync_all()
    }
}

/// [`CacheDevice`] over the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsDevice;

impl FsDevice {
    /// Create a filesystem device.
    pub fn new() -> Self {
        Self
    }
}

impl CacheDevice for FsDevice {
    type File = FsFile;

    fn create_dir_if_missing(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn open_writable(&self, path: &Path) -> io::Result<Self::File> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(FsFile::new(file))
    }

    fn open_readable(&self, path: &Path) -> io::Result<Self::File> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(FsFile::new(file))
    }

    fn delete_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn file_size(&self, path: &Path) -> io::Result<u64> {
        fs::metadata(path).map(|m| m.len())
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}
