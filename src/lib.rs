//! oxicache - a persistent secondary block cache
//!
//! A disk-backed cache tier that sits beneath an in-memory block cache and
//! above a slow backing store, providing:
//! - **Pipelined writes**: inserts stage records in pooled write buffers,
//!   drained to numbered cache files by a background flusher
//! - **Concurrent reads**: lookups are served from resident buffers, from the
//!   flushed prefix of a file still being written, or from finalized files,
//!   with every record protected by a CRC
//! - **Bounded footprint**: admission reserves bytes against a budget and
//!   evicts whole files, least-recently-finalized first
//!
//! The cache is not a database: no ordering, no transactions, no cross-process
//! sharing, and no durability for records still in volatile buffers.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use oxicache::{BlockCache, BlockCacheConfig, FsDevice};
//!
//! let config = BlockCacheConfig::new("/var/cache/blocks")
//!     .with_cache_size(1 << 30);
//! let cache = BlockCache::open(config, FsDevice::new())?;
//!
//! cache.insert(b"key", b"value")?;
//! let value = cache.lookup(b"key");
//! cache.close();
//! ```

#![warn(missing_docs)]

pub mod buffer;
pub mod cache;
pub mod config;
pub mod device;
pub mod error;
pub mod lba;
pub mod record;
pub mod stats;

mod file;
mod flush;
mod index;

// Re-exports for convenience
pub use cache::BlockCache;
pub use config::{BlockCacheConfig, BlockCacheConfigSpec, ConfigError};
pub use device::{CacheDevice, DeviceFile, FsDevice};
pub use error::Error;
pub use lba::Lba;
pub use stats::{CacheStats, StatsSnapshot};

/// Utility for size literals (e.g. `4 * size::MIB`)
pub mod size {
    /// 1 KiB in bytes
    pub const KIB: u64 = 1024;
    /// 1 MiB in bytes
    pub const MIB: u64 = 1024 * KIB;
    /// 1 GiB in bytes
    pub const GIB: u64 = 1024 * MIB;
}
