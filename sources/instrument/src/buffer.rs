use std::ops::{Deref, DerefMut};

use parking_lot::Mutex;

/// Most buffers the pool holds on to between checkouts.
const RETAINED: usize = 4;

/// Recycles the scratch buffers method bodies are rewritten in. A session
/// may be shared between threads, each checkout gets its own buffer.
#[derive(Debug, Default)]
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty buffer with room for at least `capacity` bytes.
    pub fn checkout(&self, capacity: usize) -> PooledBuf<'_> {
        let mut buf = self.free.lock().pop().unwrap_or_default();
        buf.clear();
        buf.reserve(capacity);

        PooledBuf { pool: self, buf }
    }

    pub fn retained(&self) -> usize {
        self.free.lock().len()
    }
}

/// A buffer on loan from a [`BufferPool`], handed back when dropped.
#[derive(Debug)]
pub struct PooledBuf<'a> {
    pool: &'a BufferPool,
    buf: Vec<u8>,
}

impl Deref for PooledBuf<'_> {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl DerefMut for PooledBuf<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl Drop for PooledBuf<'_> {
    fn drop(&mut self) {
        let mut free = self.pool.free.lock();
        if free.len() < RETAINED {
            free.push(std::mem::take(&mut self.buf));
        }
    }
}
