//! Bounded bucket handoff between the sampler thread and the storage worker.
//!
//! The sampler must never block on storage. When the queue is full the oldest unwritten
//! bucket is dropped and handed back to the caller for logging; memory stays bounded and
//! at most one second is lost per overflow.

use crate::acquisition::bucket::SealedBucket;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Outcome of [`HandoffQueue::pop_timeout`].
#[derive(Debug)]
pub enum Pop {
    /// Next sealed bucket in order.
    Bucket(SealedBucket),
    /// Nothing arrived before the timeout.
    Timeout,
    /// The queue is closed and fully drained.
    Closed,
}

#[derive(Debug, Default)]
struct QueueState {
    buckets: VecDeque<SealedBucket>,
    closed: bool,
    dropped: u64,
}

/// Fixed-capacity FIFO with drop-oldest overflow.
#[derive(Debug)]
pub struct HandoffQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
    capacity: usize,
}

impl HandoffQueue {
    /// Create a queue holding at most `capacity` buckets.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            ready: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue a bucket. Returns the bucket that had to be dropped, if any.
    ///
    /// After [`HandoffQueue::close`] the pushed bucket itself is returned.
    pub fn push(&self, bucket: SealedBucket) -> Option<SealedBucket> {
        let mut state = self.lock();
        if state.closed {
            return Some(bucket);
        }
        let dropped = if state.buckets.len() >= self.capacity {
            state.dropped += 1;
            state.buckets.pop_front()
        } else {
            None
        };
        state.buckets.push_back(bucket);
        drop(state);
        self.ready.notify_one();
        dropped
    }

    /// Wait up to `timeout` for the next bucket.
    ///
    /// Buckets queued before `close` are still delivered; `Closed` is only returned
    /// once the queue is empty.
    pub fn pop_timeout(&self, timeout: Duration) -> Pop {
        let state = self.lock();
        let (mut state, _) = self
            .ready
            .wait_timeout_while(state, timeout, |s| s.buckets.is_empty() && !s.closed)
            .unwrap_or_else(PoisonError::into_inner);
        match state.buckets.pop_front() {
            Some(bucket) => Pop::Bucket(bucket),
            None if state.closed => Pop::Closed,
            None => Pop::Timeout,
        }
    }

    /// Stop accepting buckets and wake the consumer.
    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }

    /// Buckets waiting for the storage worker.
    pub fn len(&self) -> usize {
        self.lock().buckets.len()
    }

    /// True if nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total buckets dropped because of overflow.
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }
}
