//! Writable-state internals of a cache file

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::debug;

use crate::buffer::{BufferPool, WriteBuffer};
use crate::device::CacheDevice;
use crate::file::CacheFile;
use crate::flush::{Flusher, FlushJob};
use crate::lba::Lba;
use crate::record;

/// Result of an append attempt.
#[derive(Debug)]
pub(crate) enum AppendOutcome {
    /// The record was staged; its address is final.
    Appended(Lba),
    /// The file is full; the caller rotates to a new file and retries.
    Eof,
    /// The buffer pool is saturated; the caller retries later.
    Retry,
    /// The record cannot fit in any write buffer.
    TooLarge,
}

/// The filling tail buffer and the file offset of its first byte.
struct TailBuffer {
    start: u32,
    buf: WriteBuffer,
}

/// A sealed buffer handed to the flusher; kept here so reads can still see
/// it until its write completes.
struct InFlightBuffer {
    start: u32,
    used: u32,
    buf: Arc<WriteBuffer>,
}

pub(super) struct WritableState<D: CacheDevice> {
    file: Arc<D::File>,
    pool: BufferPool,
    tail: Option<TailBuffer>,
    /// Dispatch order; the flusher completes these front to back.
    in_flight: VecDeque<InFlightBuffer>,
    /// Bytes accepted into the file, on disk or not.
    size: u32,
    /// Bytes durably written; the next flush lands here.
    disk_woff: u32,
    max_size: u32,
    eof: bool,
}

impl<D: CacheDevice> WritableState<D> {
    pub(super) fn new(file: Arc<D::File>, max_size: u32, pool: BufferPool) -> Self {
        Self {
            file,
            pool,
            tail: None,
            in_flight: VecDeque::new(),
            size: 0,
            disk_woff: 0,
            max_size,
            eof: false,
        }
    }

    #[inline]
    pub(super) fn handle(&self) -> &D::File {
        &self.file
    }

    #[inline]
    pub(super) fn disk_woff(&self) -> u32 {
        self.disk_woff
    }

    /// EOF reached and no buffers resident: ready to finalize.
    pub(super) fn drained(&self) -> bool {
        self.eof && self.tail.is_none() && self.in_flight.is_empty()
    }

    pub(super) fn append(
        &mut self,
        owner: &Arc<CacheFile<D>>,
        key: &[u8],
        value: &[u8],
        flusher: &Flusher<D>,
    ) -> AppendOutcome {
        if self.eof {
            return AppendOutcome::Eof;
        }

        let needed = record::encoded_len(key, value);
        if needed > self.pool.buffer_size() {
            return AppendOutcome::TooLarge;
        }

        if self.size as u64 + needed as u64 > self.max_size as u64 {
            debug!(
                cache_id = owner.cache_id(),
                size = self.size,
                needed,
                "cache file full, draining"
            );
            self.eof = true;
            self.dispatch_tail(owner, flusher);
            return AppendOutcome::Eof;
        }

        // Records never span buffers: a tail without room is sealed early
        // (it flushes partially used) and a fresh buffer takes over.
        if self.tail.as_ref().map_or(true, |t| t.buf.free() < needed) {
            self.dispatch_tail(owner, flusher);
            match self.pool.allocate() {
                Some(buf) => {
                    self.tail = Some(TailBuffer {
                        start: self.size,
                        buf,
                    });
                }
                None => return AppendOutcome::Retry,
            }
        }

        let lba = Lba::new(owner.cache_id(), self.size, needed as u32);
        let tail = self.tail.as_mut().expect("tail ensured above");
        record::encode_into(tail.buf.reserve(needed), key, value);
        self.size += needed as u32;

        if tail.buf.free() == 0 {
            self.dispatch_tail(owner, flusher);
        }

        AppendOutcome::Appended(lba)
    }

    /// Seal and dispatch the tail without ending the file.
    pub(super) fn flush(&mut self, owner: &Arc<CacheFile<D>>, flusher: &Flusher<D>) {
        self.dispatch_tail(owner, flusher);
    }

    /// Seal the tail (if any) and hand it to the flusher.
    fn dispatch_tail(&mut self, owner: &Arc<CacheFile<D>>, flusher: &Flusher<D>) {
        let Some(TailBuffer { start, buf }) = self.tail.take() else {
            return;
        };
        if buf.used() == 0 {
            self.pool.release(buf);
            return;
        }

        let used = buf.used() as u32;
        let buf = Arc::new(buf);
        self.in_flight.push_back(InFlightBuffer {
            start,
            used,
            buf: Arc::clone(&buf),
        });
        flusher.submit(FlushJob {
            file: Arc::clone(owner),
            handle: Arc::clone(&self.file),
            buf,
            offset: start as u64,
        });
    }

    /// Copy the record bytes for `lba` out of a resident buffer.
    ///
    /// The caller has ruled out the flushed prefix, so the range lies in
    /// exactly one in-flight buffer or the tail; records never straddle.
    pub(super) fn read_resident(&self, lba: &Lba) -> Option<Vec<u8>> {
        let off = lba.offset();
        let len = lba.size() as usize;

        for entry in &self.in_flight {
            if off >= entry.start && lba.end() <= entry.start as u64 + entry.used as u64 {
                let begin = (off - entry.start) as usize;
                return Some(entry.buf.filled()[begin..begin + len].to_vec());
            }
        }

        if let Some(tail) = &self.tail {
            if off >= tail.start && lba.end() <= tail.start as u64 + tail.buf.used() as u64 {
                let begin = (off - tail.start) as usize;
                return Some(tail.buf.filled()[begin..begin + len].to_vec());
            }
        }

        None
    }

    /// Account one completed buffer write. Returns `drained()`.
    pub(super) fn write_done(&mut self) -> bool {
        let Some(entry) = self.in_flight.pop_front() else {
            debug_assert!(false, "write completion with nothing in flight");
            return false;
        };
        debug_assert_eq!(entry.start, self.disk_woff);
        self.disk_woff = entry.start + entry.used;

        // The flusher has dropped its clone by now; a failed unwrap only
        // means the buffer cannot be pooled again.
        if let Ok(buf) = Arc::try_unwrap(entry.buf) {
            self.pool.release(buf);
        }

        self.drained()
    }
}

impl<D: CacheDevice> Drop for WritableState<D> {
    fn drop(&mut self) {
        if let Some(tail) = self.tail.take() {
            self.pool.release(tail.buf);
        }
        for entry in self.in_flight.drain(..) {
            if let Ok(buf) = Arc::try_unwrap(entry.buf) {
                self.pool.release(buf);
            }
        }
    }
}
