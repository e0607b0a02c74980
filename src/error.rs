//! Operational errors
//!
//! Read-path integrity failures (checksum mismatch, short read, parse
//! failure) are never surfaced through this type: a lookup that hits one is a
//! miss. `Error` covers the insert and lifecycle paths only.

use std::io;

/// Errors returned by cache operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Filesystem operation failed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The configuration failed validation.
    #[error("configuration: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Admission refused: the cache is at capacity and nothing is evictable.
    #[error("cache full")]
    CacheFull,

    /// Transient buffer-pool pressure; the operation can be retried.
    #[error("write buffers exhausted, retry")]
    Busy,

    /// The encoded record does not fit in a single write buffer.
    #[error("record of {0} bytes exceeds the write buffer size")]
    RecordTooLarge(usize),

    /// The cache has been closed.
    #[error("cache is closed")]
    Closed,
}
