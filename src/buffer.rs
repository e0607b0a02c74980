//! Write buffers and the bounded buffer pool
//!
//! Appends are staged in fixed-size [`WriteBuffer`]s drawn from a
//! [`BufferPool`]. The pool pre-allocates a configured number of buffers and
//! grows on demand up to a byte ceiling; past the ceiling, allocation fails
//! and the caller treats it as back-pressure. Buffers return to the pool once
//! the flusher has written them out.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

/// A fixed-capacity staging buffer with a write cursor.
pub struct WriteBuffer {
    data: Box<[u8]>,
    pos: usize,
}

impl WriteBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            pos: 0,
        }
    }

    /// Total capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes written so far.
    #[inline]
    pub fn used(&self) -> usize {
        self.pos
    }

    /// Bytes still available.
    #[inline]
    pub fn free(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Reserve `len` bytes at the cursor and return them for in-place
    /// encoding. The caller must have checked `free()` first.
    pub fn reserve(&mut self, len: usize) -> &mut [u8] {
        debug_assert!(len <= self.free());
        let start = self.pos;
        self.pos += len;
        &mut self.data[start..start + len]
    }

    /// The used prefix of the buffer.
    #[inline]
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.pos]
    }

    /// Rewind the cursor so the buffer can be reused.
    pub fn reset(&mut self) {
        self.pos = 0;
    }
}

struct PoolInner {
    free: Mutex<Vec<WriteBuffer>>,
    buffer_size: usize,
    /// Total bytes handed out or pooled; never shrinks.
    allocated: Mutex<usize>,
    limit: usize,
}

/// Bounded pool of [`WriteBuffer`]s.
///
/// Cloning the pool clones a handle to the same shared state; files and the
/// flusher each hold one.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Create a pool of `buffer_size`-byte buffers, pre-allocating
    /// `initial_count` of them and growing on demand up to `limit` total
    /// bytes.
    pub fn new(buffer_size: usize, initial_count: usize, limit: usize) -> Self {
        debug_assert!(buffer_size > 0);

        let mut free = Vec::with_capacity(initial_count);
        for _ in 0..initial_count {
            free.push(WriteBuffer::new(buffer_size));
        }

        Self {
            inner: Arc::new(PoolInner {
                allocated: Mutex::new(buffer_size * free.len()),
                free: Mutex::new(free),
                buffer_size,
                limit,
            }),
        }
    }

    /// Take a buffer from the pool, growing it if the ceiling allows.
    /// Returns `None` when the pool is saturated; callers retry later.
    pub fn allocate(&self) -> Option<WriteBuffer> {
        if let Some(buf) = self.inner.free.lock().pop() {
            return Some(buf);
        }

        let mut allocated = self.inner.allocated.lock();
        if *allocated + self.inner.buffer_size > self.inner.limit {
            debug!(
                allocated = *allocated,
                limit = self.inner.limit,
                "buffer pool saturated"
            );
            return None;
        }
        *allocated += self.inner.buffer_size;
        Some(WriteBuffer::new(self.inner.buffer_size))
    }

    /// Return a buffer to the pool. Never fails.
    pub fn release(&self, mut buf: WriteBuffer) {
        debug_assert_eq!(buf.capacity(), self.inner.buffer_size);
        buf.reset();
        self.inner.free.lock().push(buf);
    }

    /// Size of each buffer in bytes.
    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Number of buffers currently available without growing.
    pub fn available(&self) -> usize {
        self.inner.free.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preallocation() {
        let pool = BufferPool::new(4096, 4, 8 * 4096);
        assert_eq!(pool.available(), 4);
        assert_eq!(pool.buffer_size(), 4096);
    }

    #[test]
    fn test_allocate_release() {
        let pool = BufferPool::new(1024, 1, 4 * 1024);
        let mut buf = pool.allocate().unwrap();
        assert_eq!(pool.available(), 0);
        assert_eq!(buf.free(), 1024);

        buf.reserve(100).fill(7);
        assert_eq!(buf.used(), 100);
        assert_eq!(buf.filled(), &[7u8; 100][..]);

        pool.release(buf);
        assert_eq!(pool.available(), 1);
        let buf = pool.allocate().unwrap();
        assert_eq!(buf.used(), 0);
    }

    #[test]
    fn test_ceiling() {
        let pool = BufferPool::new(1024, 0, 2 * 1024);
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert!(pool.allocate().is_none());

        pool.release(a);
        assert!(pool.allocate().is_some());
        drop(b);
    }

    #[test]
    fn test_reserve_cursor() {
        let pool = BufferPool::new(64, 1, 64);
        let mut buf = pool.allocate().unwrap();
        buf.reserve(10).copy_from_slice(&[1u8; 10]);
        buf.reserve(5).copy_from_slice(&[2u8; 5]);
        assert_eq!(buf.used(), 15);
        assert_eq!(&buf.filled()[..10], &[1u8; 10][..]);
        assert_eq!(&buf.filled()[10..], &[2u8; 5][..]);
    }
}
