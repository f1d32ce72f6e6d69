//! Recycled pixel buffers shared by the conversion and rotation stages

use std::fmt;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::queue::ArrayQueue;
use crossbeam::utils::CachePadded;

/// Bounded free-list of RGB buffers.
///
/// Buffers go back to the pool when their [`PooledBuffer`] is dropped, so the
/// steady-state pipeline allocates nothing per frame. Buffers returned while
/// the free-list is full are simply freed.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    free: ArrayQueue<Vec<u8>>,
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    allocated: AtomicUsize,
    reused: AtomicUsize,
    outstanding: AtomicUsize,
}

/// Point-in-time pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub allocated: usize,
    pub reused: usize,
    pub outstanding: usize,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: ArrayQueue::new(capacity.max(1)),
                stats: CachePadded::new(Stats::default()),
            }),
        }
    }

    /// Zero-filled buffer of exactly `len` bytes
    pub fn acquire(&self, len: usize) -> PooledBuffer {
        let stats = &self.inner.stats;
        let data = match self.inner.free.pop() {
            Some(mut buf) => {
                stats.reused.fetch_add(1, Ordering::Relaxed);
                buf.clear();
                buf.resize(len, 0);
                buf
            }
            None => {
                stats.allocated.fetch_add(1, Ordering::Relaxed);
                vec![0; len]
            }
        };
        stats.outstanding.fetch_add(1, Ordering::Relaxed);

        PooledBuffer {
            data,
            home: Some(Arc::clone(&self.inner)),
        }
    }

    /// Buffer of `len` bytes tiled with one RGB color
    pub fn filled(&self, len: usize, rgb: [u8; 3]) -> PooledBuffer {
        let mut buf = self.acquire(len);
        for px in buf.chunks_exact_mut(3) {
            px.copy_from_slice(&rgb);
        }
        buf
    }

    /// Buffers handed out and not yet dropped
    pub fn outstanding(&self) -> usize {
        self.inner.stats.outstanding.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> PoolStats {
        let stats = &self.inner.stats;
        PoolStats {
            allocated: stats.allocated.load(Ordering::Relaxed),
            reused: stats.reused.load(Ordering::Relaxed),
            outstanding: stats.outstanding.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("free", &self.inner.free.len())
            .field("stats", &self.stats())
            .finish()
    }
}

/// Byte buffer that returns to its pool on drop
pub struct PooledBuffer {
    data: Vec<u8>,
    home: Option<Arc<PoolInner>>,
}

impl PooledBuffer {
    /// Buffer owned outside any pool
    pub fn detached(data: Vec<u8>) -> Self {
        Self { data, home: None }
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(home) = self.home.take() {
            home.stats.outstanding.fetch_sub(1, Ordering::Relaxed);
            // Full free-list: let the buffer go
            let _ = home.free.push(mem::take(&mut self.data));
        }
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.data.len())
            .field("pooled", &self.home.is_some())
            .finish()
    }
}
