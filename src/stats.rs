//! Cache statistics
//!
//! Counters are plain relaxed atomics; callers read a consistent-enough
//! [`StatsSnapshot`] for reporting.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic operation counters for one cache instance.
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Bytes accepted by `insert`, whether or not they were admitted.
    pub bytes_pipelined: AtomicU64,
    /// Bytes staged into write buffers.
    pub bytes_written: AtomicU64,
    /// Bytes the flusher has written to disk.
    pub bytes_flushed: AtomicU64,
    /// Bytes copied out by successful lookups.
    pub bytes_read: AtomicU64,
    /// Lookups that returned a value.
    pub hits: AtomicU64,
    /// Lookups that returned nothing.
    pub misses: AtomicU64,
    /// Reads that failed integrity checks (counted as misses too).
    pub read_errors: AtomicU64,
    /// Inserts dropped because admission refused the bytes.
    pub inserts_dropped: AtomicU64,
    /// Insert attempts retried after transient buffer pressure.
    pub insert_retries: AtomicU64,
    /// Cache files created.
    pub files_created: AtomicU64,
    /// Cache files evicted.
    pub files_evicted: AtomicU64,
}

impl CacheStats {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_pipelined(&self, bytes: u64) {
        self.bytes_pipelined.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_written(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_flushed(&self, bytes: u64) {
        self.bytes_flushed.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_hit(&self, bytes: u64) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_read_error(&self) {
        self.read_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_insert_dropped(&self) {
        self.inserts_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_insert_retry(&self) {
        self.insert_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_file_created(&self) {
        self.files_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_file_evicted(&self) {
        self.files_evicted.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the counters out.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_pipelined: self.bytes_pipelined.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            bytes_flushed: self.bytes_flushed.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            inserts_dropped: self.inserts_dropped.load(Ordering::Relaxed),
            insert_retries: self.insert_retries.load(Ordering::Relaxed),
            files_created: self.files_created.load(Ordering::Relaxed),
            files_evicted: self.files_evicted.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`CacheStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct StatsSnapshot {
    pub bytes_pipelined: u64,
    pub bytes_written: u64,
    pub bytes_flushed: u64,
    pub bytes_read: u64,
    pub hits: u64,
    pub misses: u64,
    pub read_errors: u64,
    pub inserts_dropped: u64,
    pub insert_retries: u64,
    pub files_created: u64,
    pub files_evicted: u64,
}

impl StatsSnapshot {
    /// Fraction of lookups that hit, in `[0, 1]`.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = CacheStats::new();
        stats.record_pipelined(100);
        stats.record_written(90);
        stats.record_flushed(90);
        stats.record_hit(40);
        stats.record_miss();
        stats.record_miss();

        let snap = stats.snapshot();
        assert_eq!(snap.bytes_pipelined, 100);
        assert_eq!(snap.bytes_written, 90);
        assert_eq!(snap.bytes_flushed, 90);
        assert_eq!(snap.bytes_read, 40);
        assert_eq!(snap.hits, 1);
        assert_eq!(snap.misses, 2);
    }

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats::new();
        assert_eq!(stats.snapshot().hit_rate(), 0.0);
        stats.record_hit(1);
        stats.record_hit(1);
        stats.record_hit(1);
        stats.record_miss();
        assert_eq!(stats.snapshot().hit_rate(), 0.75);
    }
}
