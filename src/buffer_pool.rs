// Relay buffer pool
// Lock-free fast slots backed by a bounded overflow list

use bytes::BytesMut;
use crossbeam_queue::ArrayQueue;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Pool of fixed-size byte buffers for the relay hot path.
///
/// Buffers come out of a lock-free [`ArrayQueue`] first, then from the
/// overflow list, and are freshly allocated only when both are empty.
/// Release mirrors that order; a buffer that fits in neither is dropped.
///
/// Every [`acquire`](BufferPool::acquire) returns a [`PooledBuffer`] guard
/// whose `Drop` releases the buffer, so unwinding and early returns cannot
/// leak one.
pub struct BufferPool {
    fast: ArrayQueue<BytesMut>,
    overflow: Mutex<Vec<BytesMut>>,
    overflow_slots: usize,
    buffer_size: usize,
    acquired: AtomicU64,
    released: AtomicU64,
}

impl BufferPool {
    /// `fast_slots` buffers are pre-allocated; a zero value is treated as 1.
    pub fn new(buffer_size: usize, fast_slots: usize, overflow_slots: usize) -> Arc<Self> {
        let fast = ArrayQueue::new(fast_slots.max(1));
        for _ in 0..fast.capacity() {
            let _ = fast.push(BytesMut::zeroed(buffer_size));
        }

        Arc::new(Self {
            fast,
            overflow: Mutex::new(Vec::with_capacity(overflow_slots)),
            overflow_slots,
            buffer_size,
            acquired: AtomicU64::new(0),
            released: AtomicU64::new(0),
        })
    }

    /// Take a buffer of exactly `buffer_size` bytes.
    pub fn acquire(self: &Arc<Self>) -> PooledBuffer {
        let buf = self
            .fast
            .pop()
            .or_else(|| self.overflow.lock().ok().and_then(|mut list| list.pop()))
            .unwrap_or_else(|| BytesMut::zeroed(self.buffer_size));

        self.acquired.fetch_add(1, Ordering::Relaxed);
        PooledBuffer {
            buf,
            pool: Arc::clone(self),
        }
    }

    fn release(&self, mut buf: BytesMut) {
        self.released.fetch_add(1, Ordering::Relaxed);

        // split_to/truncate by callers can leave a short buffer; restore it
        if buf.len() != self.buffer_size {
            if buf.capacity() < self.buffer_size {
                return;
            }
            buf.resize(self.buffer_size, 0);
        }

        if let Err(buf) = self.fast.push(buf) {
            if let Ok(mut list) = self.overflow.lock() {
                if list.len() < self.overflow_slots {
                    list.push(buf);
                }
            }
        }
    }

    /// Buffers handed out and not yet returned.
    pub fn outstanding(&self) -> u64 {
        self.acquired
            .load(Ordering::Relaxed)
            .saturating_sub(self.released.load(Ordering::Relaxed))
    }

    pub fn stats(&self) -> BufferPoolStats {
        BufferPoolStats {
            buffer_size: self.buffer_size,
            fast_available: self.fast.len(),
            overflow_available: self.overflow.lock().map(|list| list.len()).unwrap_or(0),
            acquired: self.acquired.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BufferPoolStats {
    pub buffer_size: usize,
    pub fast_available: usize,
    pub overflow_available: usize,
    pub acquired: u64,
    pub released: u64,
}

/// Scoped loan of a pool buffer; returned on drop.
pub struct PooledBuffer {
    buf: BytesMut,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.pool.release(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_balances() {
        let pool = BufferPool::new(1024, 2, 4);

        let a = pool.acquire();
        let b = pool.acquire();
        let c = pool.acquire(); // fast slots exhausted, fresh allocation
        assert_eq!(a.len(), 1024);
        assert_eq!(c.len(), 1024);
        assert_eq!(pool.outstanding(), 3);

        drop(a);
        drop(b);
        drop(c);
        assert_eq!(pool.outstanding(), 0);

        let stats = pool.stats();
        assert_eq!(stats.fast_available, 2);
        assert_eq!(stats.overflow_available, 1);
    }

    #[test]
    fn test_overflow_is_bounded() {
        let pool = BufferPool::new(64, 1, 1);
        let held: Vec<_> = (0..5).map(|_| pool.acquire()).collect();
        drop(held);

        let stats = pool.stats();
        assert_eq!(stats.fast_available, 1);
        assert_eq!(stats.overflow_available, 1);
        assert_eq!(stats.acquired, 5);
        assert_eq!(stats.released, 5);
    }

    #[test]
    fn test_truncated_buffer_is_restored() {
        let pool = BufferPool::new(128, 1, 0);
        {
            let mut buf = pool.acquire();
            buf.truncate(10);
        }
        assert_eq!(pool.acquire().len(), 128);
    }

    #[test]
    fn test_release_on_panic() {
        let pool = BufferPool::new(32, 1, 1);
        let cloned = Arc::clone(&pool);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _buf = cloned.acquire();
            panic!("relay task died");
        }));
        assert!(result.is_err());
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_use() {
        let pool = BufferPool::new(256, 4, 4);
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let pool = Arc::clone(&pool);
            tasks.push(tokio::spawn(async move {
                for _ in 0..100 {
                    let mut buf = pool.acquire();
                    buf[0] = 1;
                    tokio::task::yield_now().await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(pool.outstanding(), 0);
    }
}
