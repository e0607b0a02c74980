//! Filesystem abstraction
//!
//! The cache talks to storage through the [`CacheDevice`] trait: directory
//! creation, opening cache files for sequential writing or positional
//! reading, deletion, and size queries. File handles implement
//! [`DeviceFile`], which provides positional reads and writes: the flusher
//! writes each buffer at an explicit offset, and lookups read the flushed
//! prefix of a still-writable file through the same handle.
//!
//! [`FsDevice`] is the standard-filesystem implementation. Embedders with an
//! unusual storage layer (object stores, fault injection in tests) implement
//! the traits themselves.

mod file_device;
mod traits;

pub use file_device::{FsDevice, FsFile};
pub use traits::{CacheDevice, DeviceFile};
