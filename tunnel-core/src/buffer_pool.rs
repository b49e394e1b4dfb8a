//! Shared 4 KiB buffer pool for the copy engine.
//!
//! The teacher's own `BufferPool` (`router-core/src/app/proxy.rs`) keeps a
//! thread-local free list; the spec calls for a single shared free-list
//! instead, so buffers taken on one task's poll can be returned by another.
//! We keep the teacher's "get/put, clear on return, cap the free list" shape
//! and swap the backing store for a `Mutex<Vec<BytesMut>>` shared via an
//! `Arc`, which is what a buffer pool crosses task boundaries over the pack's
//! own idiom (`parking_lot`-free, matching this crate's own light dependency
//! footprint).

use bytes::BytesMut;
use std::sync::{Arc, Mutex};

pub const BUFFER_SIZE: usize = 4096;
const MAX_POOLED: usize = 256;

#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<Mutex<Vec<BytesMut>>>,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::with_capacity(MAX_POOLED))),
        }
    }

    /// Take a buffer from the free list, or allocate a fresh 4 KiB one.
    pub fn get(&self) -> PooledBuffer {
        let buf = self
            .inner
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(BUFFER_SIZE));
        PooledBuffer {
            buf: Some(buf),
            pool: self.clone(),
        }
    }

    fn put(&self, mut buf: BytesMut) {
        buf.clear();
        let mut guard = self.inner.lock().unwrap();
        if guard.len() < MAX_POOLED {
            guard.push(buf);
        }
    }
}

/// RAII handle: the buffer is returned to the pool on every exit path,
/// including early returns on error, once this value drops.
pub struct PooledBuffer {
    buf: Option<BytesMut>,
    pool: BufferPool,
}

impl std::ops::Deref for PooledBuffer {
    type Target = BytesMut;
    fn deref(&self) -> &BytesMut {
        self.buf.as_ref().unwrap()
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        self.buf.as_mut().unwrap()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_released_buffers() {
        let pool = BufferPool::new();
        {
            let mut b = pool.get();
            b.extend_from_slice(b"hello");
        }
        let b2 = pool.get();
        // the buffer was cleared on release, not the capacity
        assert_eq!(b2.len(), 0);
        assert!(b2.capacity() >= BUFFER_SIZE);
    }

    #[test]
    fn caps_the_free_list() {
        let pool = BufferPool::new();
        let mut held = Vec::new();
        for _ in 0..(MAX_POOLED + 16) {
            held.push(pool.get());
        }
        drop(held);
        assert!(pool.inner.lock().unwrap().len() <= MAX_POOLED);
    }
}
