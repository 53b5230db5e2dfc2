//! Out-of-order chunk holding area for one upload.
//!
//! Chunks arrive in any order and wait here until the feeder owning their
//! segment drains them in ascending order. Waiters suspend on a [`Notify`]
//! instead of polling.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insert {
    Accepted,
    /// Already cached or already consumed; nothing was stored.
    Duplicate,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    Ready,
    TimedOut,
    Closed,
}

/// A chunk taken out of the cache.
#[derive(Debug, Clone)]
pub struct Taken {
    pub data: Bytes,
    /// The sender expects a `next` once this chunk is consumed.
    pub acknowledge: bool,
}

#[derive(Default)]
struct Inner {
    completed: HashSet<u64>,
    pending: HashMap<u64, (Bytes, bool)>,
    closed: bool,
}

#[derive(Default)]
pub struct ChunkCache {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl ChunkCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock only means a panicking test thread; the sets stay valid.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert(&self, index: u64, data: Bytes, acknowledge: bool) -> Insert {
        let mut inner = self.lock();
        if inner.closed {
            return Insert::Closed;
        }
        if inner.completed.contains(&index) || inner.pending.contains_key(&index) {
            return Insert::Duplicate;
        }
        inner.pending.insert(index, (data, acknowledge));
        drop(inner);
        self.notify.notify_waiters();
        Insert::Accepted
    }

    /// Suspend until `index` is cached, the cache closes, or `timeout` passes.
    pub async fn wait(&self, index: u64, timeout: Duration) -> Wait {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let inner = self.lock();
                if inner.closed {
                    return Wait::Closed;
                }
                if inner.pending.contains_key(&index) {
                    return Wait::Ready;
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Wait::TimedOut;
            }
        }
    }

    /// Move `index` from the cache into the completed set.
    pub fn take(&self, index: u64) -> Option<Taken> {
        let mut inner = self.lock();
        let (data, acknowledge) = inner.pending.remove(&index)?;
        inner.completed.insert(index);
        drop(inner);
        self.notify.notify_waiters();
        Some(Taken { data, acknowledge })
    }

    /// Suspend until no more than `depth` chunks are waiting.
    ///
    /// Returns `false` when the cache closed first.
    pub async fn wait_capacity(&self, depth: usize) -> bool {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let inner = self.lock();
                if inner.closed {
                    return false;
                }
                if inner.pending.len() <= depth {
                    return true;
                }
            }
            notified.await;
        }
    }

    /// Every index in `0..total` has been consumed.
    pub fn is_complete(&self, total: u64) -> bool {
        let inner = self.lock();
        (0..total).all(|index| inner.completed.contains(&index))
    }

    pub fn completed_count(&self) -> u64 {
        self.lock().completed.len() as u64
    }

    /// Indices in `0..total` that were never delivered, cached or consumed.
    pub fn missing_count(&self, total: u64) -> u64 {
        let inner = self.lock();
        (0..total)
            .filter(|index| !inner.completed.contains(index) && !inner.pending.contains_key(index))
            .count() as u64
    }

    /// Drop cached chunks and wake every waiter.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.pending.clear();
        drop(inner);
        self.notify.notify_waiters();
    }
}
