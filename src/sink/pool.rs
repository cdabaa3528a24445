//! Producer-side frame memory pool
//!
//! Decoder threads `acquire` a buffer, fill it and hand it to the sink.
//! When the pool is empty `acquire` blocks until a buffer is recycled or
//! the pool starts flushing, which cancels every waiter.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};

use super::FlowError;

struct PoolState {
    free: Vec<Vec<u8>>,
    buffer_size: usize,
    capacity: usize,
    outstanding: usize,
    flushing: bool,
    /// Bumped on every configure so stale buffers are not recycled
    generation: u64,
}

struct PoolInner {
    state: Mutex<PoolState>,
    available: Condvar,
}

/// Fixed-capacity pool of frame-sized buffers. Cheap to clone.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    free: Vec::new(),
                    buffer_size: 0,
                    capacity: capacity.max(1),
                    outstanding: 0,
                    flushing: false,
                    generation: 0,
                }),
                available: Condvar::new(),
            }),
        }
    }

    /// Reallocate for `buffer_size` byte buffers and leave flushing
    pub fn configure(&self, buffer_size: usize) {
        let mut state = self.inner.state.lock();
        state.generation += 1;
        state.buffer_size = buffer_size;
        state.outstanding = 0;
        state.flushing = false;
        let capacity = state.capacity;
        state.free = (0..capacity).map(|_| vec![0; buffer_size]).collect();
        tracing::debug!(buffer_size, capacity, "buffer pool configured");
        self.inner.available.notify_all();
    }

    /// Block until a buffer is free or the pool is flushing
    pub fn acquire(&self) -> Result<PooledBuffer, FlowError> {
        let mut state = self.inner.state.lock();
        loop {
            if state.flushing {
                return Err(FlowError::Flushing);
            }
            if state.buffer_size == 0 {
                return Err(FlowError::NotNegotiated);
            }
            if let Some(data) = state.free.pop() {
                state.outstanding += 1;
                return Ok(PooledBuffer {
                    data,
                    generation: state.generation,
                    pool: Arc::downgrade(&self.inner),
                });
            }
            self.inner.available.wait(&mut state);
        }
    }

    /// Non-blocking `acquire`
    pub fn try_acquire(&self) -> Option<PooledBuffer> {
        let mut state = self.inner.state.lock();
        if state.flushing || state.buffer_size == 0 {
            return None;
        }
        let data = state.free.pop()?;
        state.outstanding += 1;
        Some(PooledBuffer {
            data,
            generation: state.generation,
            pool: Arc::downgrade(&self.inner),
        })
    }

    /// While flushing every `acquire` fails with `FlowError::Flushing`
    pub fn set_flushing(&self, flushing: bool) {
        let mut state = self.inner.state.lock();
        state.flushing = flushing;
        self.inner.available.notify_all();
    }

    pub fn is_flushing(&self) -> bool {
        self.inner.state.lock().flushing
    }

    /// Buffers handed out and not yet returned
    pub fn outstanding(&self) -> usize {
        self.inner.state.lock().outstanding
    }

    pub fn free_count(&self) -> usize {
        self.inner.state.lock().free.len()
    }
}

/// Pool memory; returns to its pool on drop
pub struct PooledBuffer {
    data: Vec<u8>,
    generation: u64,
    pool: Weak<PoolInner>,
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
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        let mut state = pool.state.lock();
        if state.generation != self.generation {
            return;
        }
        state.outstanding = state.outstanding.saturating_sub(1);
        state.free.push(std::mem::take(&mut self.data));
        pool.available.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_unconfigured_pool_not_negotiated() {
        let pool = BufferPool::new(2);
        assert_eq!(pool.acquire().err(), Some(FlowError::NotNegotiated));
    }

    #[test]
    fn test_buffers_recycle_on_drop() {
        let pool = BufferPool::new(2);
        pool.configure(16);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(a.len(), 16);
        assert_eq!(pool.outstanding(), 2);
        assert!(pool.try_acquire().is_none());
        drop(a);
        assert_eq!(pool.free_count(), 1);
        drop(b);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_acquire_wakes_on_recycle() {
        let pool = BufferPool::new(1);
        pool.configure(4);
        let held = pool.acquire().unwrap();
        let waiter_pool = pool.clone();
        let waiter = thread::spawn(move || waiter_pool.acquire().map(|b| b.len()));
        thread::sleep(Duration::from_millis(20));
        drop(held);
        assert_eq!(waiter.join().unwrap(), Ok(4));
    }

    #[test]
    fn test_flush_cancels_waiter() {
        let pool = BufferPool::new(1);
        pool.configure(4);
        let _held = pool.acquire().unwrap();
        let waiter_pool = pool.clone();
        let waiter = thread::spawn(move || waiter_pool.acquire().map(|b| b.len()));
        thread::sleep(Duration::from_millis(20));
        pool.set_flushing(true);
        assert_eq!(waiter.join().unwrap(), Err(FlowError::Flushing));
    }

    #[test]
    fn test_reconfigure_discards_stale_buffers() {
        let pool = BufferPool::new(1);
        pool.configure(4);
        let stale = pool.acquire().unwrap();
        pool.configure(8);
        drop(stale);
        assert_eq!(pool.free_count(), 1);
        assert_eq!(pool.acquire().unwrap().len(), 8);
    }
}
