//! Read buffers reused across runs.
//!
//! Each run borrows its sample buffers from a lock-free queue and hands them
//! back when it ends, so steady-state acquisition does not allocate. Buffers
//! beyond the retained count are only released by [`ReadBufferPool::reclaim`],
//! which the acquisition loop calls while it is idle anyway (waiting for the
//! status lines), and which stops once its time budget is spent.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use tracing::debug;

/// Pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers handed out
    pub takes: u64,
    /// Takes served from the queue without allocating
    pub reuses: u64,
    /// Buffers released by `reclaim`
    pub reclaimed: u64,
    /// Buffers currently queued
    pub idle: usize,
}

/// Lock-free pool of sample buffers.
#[derive(Debug)]
pub struct ReadBufferPool<T> {
    free: SegQueue<Vec<T>>,
    retain: usize,
    takes: AtomicU64,
    reuses: AtomicU64,
    reclaimed: AtomicU64,
}

impl<T: Copy + Default> ReadBufferPool<T> {
    /// Create an empty pool keeping at most `retain` idle buffers after reclaim.
    pub fn new(retain: usize) -> Self {
        Self {
            free: SegQueue::new(),
            retain,
            takes: AtomicU64::new(0),
            reuses: AtomicU64::new(0),
            reclaimed: AtomicU64::new(0),
        }
    }

    /// Get a zeroed buffer of exactly `len` samples.
    pub fn take(&self, len: usize) -> Vec<T> {
        self.takes.fetch_add(1, Ordering::Relaxed);
        match self.free.pop() {
            Some(mut buf) => {
                self.reuses.fetch_add(1, Ordering::Relaxed);
                buf.clear();
                buf.resize(len, T::default());
                buf
            }
            None => vec![T::default(); len],
        }
    }

    /// Return a buffer for reuse.
    pub fn give(&self, buf: Vec<T>) {
        self.free.push(buf);
    }

    /// Release idle buffers above the retained count until `budget` elapses.
    ///
    /// Returns the number of buffers released.
    pub fn reclaim(&self, budget: Duration) -> usize {
        let started = Instant::now();
        let mut released = 0;
        while self.free.len() > self.retain && started.elapsed() < budget {
            match self.free.pop() {
                Some(buf) => {
                    drop(buf);
                    released += 1;
                }
                None => break,
            }
        }
        if released > 0 {
            self.reclaimed.fetch_add(released as u64, Ordering::Relaxed);
            debug!(released, idle = self.free.len(), "Reclaimed read buffers");
        }
        released
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            takes: self.takes.load(Ordering::Relaxed),
            reuses: self.reuses.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
            idle: self.free.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_reuses_returned_buffers() {
        let pool = ReadBufferPool::<i16>::new(1);
        let mut buf = pool.take(8);
        buf[0] = 42;
        pool.give(buf);
        let buf = pool.take(4);
        assert_eq!(buf, vec![0; 4]);
        let stats = pool.stats();
        assert_eq!(stats.takes, 2);
        assert_eq!(stats.reuses, 1);
    }

    #[test]
    fn test_reclaim_keeps_retained() {
        let pool = ReadBufferPool::<u32>::new(2);
        for _ in 0..5 {
            pool.give(vec![0; 16]);
        }
        assert_eq!(pool.reclaim(Duration::from_secs(1)), 3);
        assert_eq!(pool.stats().idle, 2);
        assert_eq!(pool.reclaim(Duration::from_secs(1)), 0);
    }

    #[test]
    fn test_reclaim_respects_zero_budget() {
        let pool = ReadBufferPool::<u32>::new(0);
        pool.give(vec![0; 16]);
        assert_eq!(pool.reclaim(Duration::ZERO), 0);
        assert_eq!(pool.stats().idle, 1);
    }
}
