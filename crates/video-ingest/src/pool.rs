//! Recycled frame storage shared between a frame source and its consumers.
//!
//! Camera stacks hand out a fixed set of preview buffers and expect each one back before
//! they can fill it again. [`PooledBuffer`] returns its bytes to the pool on drop, so a
//! buffer comes back exactly once no matter whether the frame was consumed or overwritten.

use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use crossbeam_channel::{Receiver, Sender, bounded};

/// Number of preview buffers kept in rotation by default.
pub const DEFAULT_POOL_DEPTH: usize = 4;

struct PoolInner {
    free_tx: Sender<Vec<u8>>,
    free_rx: Receiver<Vec<u8>>,
    depth: usize,
    outstanding: AtomicUsize,
    returned: AtomicU64,
}

/// Fixed-size set of byte buffers handed out to frames.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Allocate `depth` buffers of `buffer_len` bytes each.
    pub fn new(buffer_len: usize, depth: usize) -> Self {
        let depth = depth.max(1);
        let (free_tx, free_rx) = bounded(depth);
        for _ in 0..depth {
            let _ = free_tx.try_send(vec![0u8; buffer_len]);
        }
        Self {
            inner: Arc::new(PoolInner {
                free_tx,
                free_rx,
                depth,
                outstanding: AtomicUsize::new(0),
                returned: AtomicU64::new(0),
            }),
        }
    }

    /// Take a free buffer, or `None` when every buffer is still held by a frame.
    pub fn acquire(&self) -> Option<PooledBuffer> {
        let bytes = self.inner.free_rx.try_recv().ok()?;
        self.inner.outstanding.fetch_add(1, Ordering::SeqCst);
        Some(PooledBuffer {
            bytes: Some(bytes),
            pool: Some(self.inner.clone()),
        })
    }

    pub fn depth(&self) -> usize {
        self.inner.depth
    }

    pub fn available(&self) -> usize {
        self.inner.free_rx.len()
    }

    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::SeqCst)
    }

    /// Total number of buffers given back since the pool was created.
    pub fn returned_total(&self) -> u64 {
        self.inner.returned.load(Ordering::SeqCst)
    }
}

/// Frame storage that goes back to its pool when dropped.
pub struct PooledBuffer {
    bytes: Option<Vec<u8>>,
    pool: Option<Arc<PoolInner>>,
}

impl PooledBuffer {
    /// Wrap bytes that do not belong to any pool.
    pub fn unpooled(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Some(bytes),
            pool: None,
        }
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.bytes.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.bytes.as_deref_mut().unwrap_or(&mut [])
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.len())
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let (Some(bytes), Some(pool)) = (self.bytes.take(), self.pool.take()) else {
            return;
        };
        pool.outstanding.fetch_sub(1, Ordering::SeqCst);
        pool.returned.fetch_add(1, Ordering::SeqCst);
        let _ = pool.free_tx.try_send(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_starves_once_every_buffer_is_out() {
        let pool = BufferPool::new(8, 2);
        let a = pool.acquire().expect("first buffer");
        let b = pool.acquire().expect("second buffer");
        assert!(pool.acquire().is_none());
        assert_eq!(pool.outstanding(), 2);

        drop(a);
        assert_eq!(pool.available(), 1);
        assert!(pool.acquire().is_some());
        drop(b);
    }

    #[test]
    fn dropped_buffers_are_returned_exactly_once() {
        let pool = BufferPool::new(4, DEFAULT_POOL_DEPTH);
        for _ in 0..10 {
            let mut buffer = pool.acquire().expect("buffer available");
            buffer[0] = 7;
        }
        assert_eq!(pool.returned_total(), 10);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.available(), DEFAULT_POOL_DEPTH);
    }

    #[test]
    fn unpooled_buffers_do_not_touch_any_pool() {
        let buffer = PooledBuffer::unpooled(vec![1, 2, 3]);
        assert_eq!(&*buffer, &[1, 2, 3]);
    }
}
