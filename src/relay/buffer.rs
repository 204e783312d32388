use bytes::BytesMut;
use crossbeam::queue::SegQueue;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// Lock-free pool of relay read buffers
///
/// Every session takes one read buffer for its client side and returns it
/// when the client goes away, which keeps the allocations warm across
/// short-lived client connections. Backend connections outlive sessions
/// and keep their own buffers.
#[derive(Debug, Clone)]
pub struct BufferPool {
    pool: Arc<SegQueue<BytesMut>>,
    buffer_size: usize,
    max_pool_size: usize,
    pool_size: Arc<AtomicUsize>,
}

impl BufferPool {
    /// Create a pool of `max_pool_size` buffers of `buffer_size` bytes each
    ///
    /// Buffers are allocated lazily and kept once returned.
    #[must_use]
    pub fn new(buffer_size: usize, max_pool_size: usize) -> Self {
        debug!(
            "Relay buffer pool: up to {} buffers of {}KB",
            max_pool_size,
            buffer_size / 1024
        );
        Self {
            pool: Arc::new(SegQueue::new()),
            buffer_size,
            max_pool_size,
            pool_size: Arc::new(AtomicUsize::new(0)),
        }
    }

    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Number of buffers currently parked in the pool
    #[must_use]
    pub fn available(&self) -> usize {
        self.pool_size.load(Ordering::Relaxed)
    }

    /// Get an empty buffer with at least `buffer_size` capacity
    pub fn acquire(&self) -> BytesMut {
        if let Some(buffer) = self.pool.pop() {
            self.pool_size.fetch_sub(1, Ordering::Relaxed);
            debug_assert!(buffer.is_empty());
            buffer
        } else {
            BytesMut::with_capacity(self.buffer_size)
        }
    }

    /// Return a buffer; dropped if the pool is full or the buffer shrank
    pub fn release(&self, mut buffer: BytesMut) {
        buffer.clear();
        if buffer.capacity() < self.buffer_size {
            return;
        }
        let mut current_size = self.pool_size.load(Ordering::Relaxed);
        while current_size < self.max_pool_size {
            match self.pool_size.compare_exchange_weak(
                current_size,
                current_size + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.pool.push(buffer);
                    return;
                }
                Err(new_size) => current_size = new_size,
            }
        }
    }
}
