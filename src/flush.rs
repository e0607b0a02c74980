//! Background flusher
//!
//! Sealed write buffers are flushed to disk by a small pool of worker
//! threads. Jobs are sharded across workers by `cache_id`, so the buffers of
//! any one file are written strictly in dispatch order while different files
//! can flush in parallel. Each completed write feeds back into the file's
//! bookkeeping; the write that drains a full file triggers its finalization.
//!
//! Shutdown pushes a stop message behind whatever is queued, so every
//! dispatched buffer is written before `stop` returns.

use std::sync::Arc;
use std::thread;

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::error;

use crate::buffer::WriteBuffer;
use crate::device::{CacheDevice, DeviceFile};
use crate::file::CacheFile;
use crate::stats::CacheStats;

/// Called with a file that has just finalized, so the metadata index can make
/// it eligible for eviction.
pub(crate) type FinalizeHook<D> = Arc<dyn Fn(&Arc<CacheFile<D>>) + Send + Sync>;

/// One sealed buffer to write.
pub(crate) struct FlushJob<D: CacheDevice> {
    pub(crate) file: Arc<CacheFile<D>>,
    pub(crate) handle: Arc<D::File>,
    pub(crate) buf: Arc<WriteBuffer>,
    pub(crate) offset: u64,
}

enum Message<D: CacheDevice> {
    Write(FlushJob<D>),
    Stop,
}

/// Pool of flush workers.
pub(crate) struct Flusher<D: CacheDevice> {
    senders: Vec<Sender<Message<D>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl<D: CacheDevice> Flusher<D> {
    /// Start `qdepth` workers.
    pub(crate) fn new(
        qdepth: usize,
        device: Arc<D>,
        stats: Arc<CacheStats>,
        on_finalize: FinalizeHook<D>,
    ) -> Self {
        debug_assert!(qdepth >= 1);

        let mut senders = Vec::with_capacity(qdepth);
        let mut workers = Vec::with_capacity(qdepth);
        for _ in 0..qdepth {
            let (tx, rx) = unbounded::<Message<D>>();
            let device = Arc::clone(&device);
            let stats = Arc::clone(&stats);
            let on_finalize = Arc::clone(&on_finalize);
            workers.push(thread::spawn(move || {
                worker_loop(rx, device, stats, on_finalize)
            }));
            senders.push(tx);
        }

        Self {
            senders,
            workers: Mutex::new(workers),
        }
    }

    /// Queue one buffer write. Buffers of a given file always land on the
    /// same worker.
    pub(crate) fn submit(&self, job: FlushJob<D>) {
        let shard = job.file.cache_id() as usize % self.senders.len();
        let _ = self.senders[shard].send(Message::Write(job));
    }

    /// Drain queued writes and join the workers. Idempotent.
    pub(crate) fn stop(&self) {
        let workers = std::mem::take(&mut *self.workers.lock());
        if workers.is_empty() {
            return;
        }
        for tx in &self.senders {
            let _ = tx.send(Message::Stop);
        }
        for worker in workers {
            let _ = worker.join();
        }
    }
}

impl<D: CacheDevice> Drop for Flusher<D> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop<D: CacheDevice>(
    rx: Receiver<Message<D>>,
    device: Arc<D>,
    stats: Arc<CacheStats>,
    on_finalize: FinalizeHook<D>,
) {
    while let Ok(message) = rx.recv() {
        let job = match message {
            Message::Write(job) => job,
            Message::Stop => break,
        };

        let FlushJob {
            file,
            handle,
            buf,
            offset,
        } = job;

        let used = buf.used();
        match handle.write_at(offset, buf.filled()) {
            Ok(()) => stats.record_flushed(used as u64),
            Err(e) => {
                // The slot is still accounted below: the damaged range will
                // fail its checksum and read as a miss.
                error!(
                    cache_id = file.cache_id(),
                    offset,
                    len = used,
                    error = %e,
                    "buffer flush failed"
                );
            }
        }

        // Drop our buffer reference before completion so the file can return
        // it to the pool.
        drop(buf);
        drop(handle);

        if file.buffer_write_done() && file.try_finalize(device.as_ref()) {
            on_finalize(&file);
        }
    }
}
