//! Pooled message buffers
//!
//! Every inbound frame and every outbound message travels in a [`MessageBuffer`] taken from a
//! [`BufferPool`]. The buffer is exclusively owned by one decode or encode operation at a
//! time. Dropping it clears the content and hands the storage back to the pool it came from,
//! so no bytes of one connection can ever be observed by another.

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::fmt;
use std::mem::take;
use std::sync::{Arc, Weak};

/// Buffers which grew past this size are not kept for reuse
const MAX_POOLED_CAPACITY: usize = 128 * 1024;

/// Concurrent pool of reusable byte buffers. Cheap to clone.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    free: Mutex<Vec<BytesMut>>,
    capacity: usize,
    buffer_capacity: usize,
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("idle", &self.idle())
            .field("capacity", &self.inner.capacity)
            .finish()
    }
}

impl BufferPool {
    /// Create a pool keeping at most `capacity` idle buffers, each allocated with
    /// `buffer_capacity` bytes
    pub fn new(capacity: usize, buffer_capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(Vec::with_capacity(capacity.min(64))),
                capacity,
                buffer_capacity,
            }),
        }
    }

    /// Take an empty buffer out of the pool, allocating one if the pool is empty
    pub fn acquire(&self) -> MessageBuffer {
        let bytes = self
            .inner
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.inner.buffer_capacity));

        debug_assert!(bytes.is_empty());

        MessageBuffer {
            bytes,
            pool: Some(Arc::downgrade(&self.inner)),
        }
    }

    /// Number of buffers currently waiting for reuse
    pub fn idle(&self) -> usize {
        self.inner.free.lock().len()
    }
}

impl PoolInner {
    fn release(&self, mut bytes: BytesMut) {
        if bytes.capacity() > MAX_POOLED_CAPACITY {
            return;
        }

        bytes.clear();

        let mut free = self.free.lock();

        if free.len() < self.capacity {
            free.push(bytes);
        }
    }
}

/// One framed protocol message, or the bytes of a stream read so far.
///
/// The "marked" bytes are the bytes written into the buffer since it was acquired or last
/// [`reset`](MessageBuffer::reset).
pub struct MessageBuffer {
    bytes: BytesMut,
    pool: Option<Weak<PoolInner>>,
}

impl MessageBuffer {
    /// Create a buffer which does not belong to any pool
    pub fn unpooled(bytes: &[u8]) -> Self {
        Self {
            bytes: BytesMut::from(bytes),
            pool: None,
        }
    }

    pub fn put(&mut self, byte: u8) {
        self.bytes.extend_from_slice(&[byte]);
    }

    pub fn put_slice(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    /// The marked bytes
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Number of marked bytes
    pub fn marked_len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Forget all marked bytes, keeping the allocation for reuse
    pub fn reset(&mut self) {
        self.bytes.clear();
    }

    /// Take the marked bytes out of the buffer. The storage is not returned to the pool.
    pub fn freeze(mut self) -> Bytes {
        self.pool = None;
        take(&mut self.bytes).freeze()
    }
}

impl AsRef<[u8]> for MessageBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for MessageBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBuffer")
            .field("marked", &self.bytes.len())
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}

impl Drop for MessageBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take().and_then(|pool| pool.upgrade()) {
            pool.release(take(&mut self.bytes));
        }
    }
}
