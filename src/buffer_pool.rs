//! Buffer pool for connection read/write buffers
//!
//! Reuses BytesMut allocations across connection lifetimes instead of
//! allocating per accept.

use bytes::BytesMut;
use crossbeam_queue::ArrayQueue;
use std::sync::Arc;

const BUFFER_SIZE: usize = 4096;
const MAX_POOLED_BUFFERS: usize = 512;
/// Oversized buffers are dropped rather than pooled
const MAX_POOLED_BUFFER_SIZE: usize = 32768;

pub struct BufferPool {
    pool: ArrayQueue<BytesMut>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            pool: ArrayQueue::new(MAX_POOLED_BUFFERS),
        }
    }

    #[inline]
    pub fn get(&self) -> BytesMut {
        self.pool
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(BUFFER_SIZE))
    }

    #[inline]
    pub fn put(&self, mut buf: BytesMut) {
        if buf.capacity() <= MAX_POOLED_BUFFER_SIZE {
            buf.clear();
            let _ = self.pool.push(buf);
        }
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_POOL: std::sync::OnceLock<Arc<BufferPool>> = std::sync::OnceLock::new();

fn global_pool() -> &'static Arc<BufferPool> {
    GLOBAL_POOL.get_or_init(|| Arc::new(BufferPool::new()))
}

#[inline]
pub fn get_buffer() -> BytesMut {
    global_pool().get()
}

#[inline]
pub fn put_buffer(buf: BytesMut) {
    global_pool().put(buf);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_put_reuses() {
        let pool = BufferPool::new();

        let mut buf = pool.get();
        buf.extend_from_slice(b"data");
        pool.put(buf);
        assert_eq!(pool.len(), 1);

        let buf = pool.get();
        assert!(buf.is_empty());
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn test_oversized_not_pooled() {
        let pool = BufferPool::new();
        pool.put(BytesMut::with_capacity(MAX_POOLED_BUFFER_SIZE + 1));
        assert!(pool.is_empty());
    }
}
