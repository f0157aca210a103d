//! Bounded blocking deque
//!
//! The queue primitive behind the per-link write, verify and missing queues:
//! - bounded, never blocks on push (full is reported, or oldest is evicted)
//! - front pushes for control traffic that must preempt data traffic
//! - cancellable blocking wait for the writer thread
//! - search/remove by predicate for the verify and missing queues

use std::sync::atomic::{AtomicBool, Ordering};
use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

pub struct BlockingDeque<T> {
    inner: Mutex<VecDeque<T>>,
    nonempty: Condvar,
    capacity: usize,
    closed: AtomicBool,
}

impl<T> BlockingDeque<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            nonempty: Condvar::new(),
            capacity,
            closed: AtomicBool::new(false),
        }
    }

    /// Append at the back. Returns the item when the queue is full.
    pub fn push_back(&self, item: T) -> Result<(), T> {
        let mut q = self.inner.lock();
        if q.len() >= self.capacity {
            return Err(item);
        }
        q.push_back(item);
        drop(q);
        self.nonempty.notify_one();
        Ok(())
    }

    /// Insert at the front, ahead of ordinary traffic.
    pub fn push_front(&self, item: T) -> Result<(), T> {
        let mut q = self.inner.lock();
        if q.len() >= self.capacity {
            return Err(item);
        }
        q.push_front(item);
        drop(q);
        self.nonempty.notify_one();
        Ok(())
    }

    /// Append at the back, evicting the oldest entry when full.
    /// Returns the evicted entry, if any.
    pub fn push_force(&self, item: T) -> Option<T> {
        let mut q = self.inner.lock();
        let evicted = if q.len() >= self.capacity {
            q.pop_front()
        } else {
            None
        };
        q.push_back(item);
        drop(q);
        self.nonempty.notify_one();
        evicted
    }

    /// Remove and return the head, without blocking.
    pub fn pop_front(&self) -> Option<T> {
        self.inner.lock().pop_front()
    }

    /// Apply `f` to the head without removing it.
    pub fn peek_map<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.inner.lock().front().map(f)
    }

    /// Remove the head only if it still satisfies `pred`.
    /// Guards against a concurrent flush/detach between peek and pop.
    pub fn pop_front_if(&self, pred: impl FnOnce(&T) -> bool) -> Option<T> {
        let mut q = self.inner.lock();
        match q.front() {
            Some(front) if pred(front) => q.pop_front(),
            _ => None,
        }
    }

    /// First non-`None` result of `f` over the queue, front to back.
    pub fn find_map<R>(&self, mut f: impl FnMut(&T) -> Option<R>) -> Option<R> {
        self.inner.lock().iter().find_map(|item| f(item))
    }

    /// True if any entry satisfies `pred`.
    pub fn any(&self, pred: impl FnMut(&T) -> bool) -> bool {
        let mut pred = pred;
        self.inner.lock().iter().any(|item| pred(item))
    }

    /// Remove and return the first entry satisfying `pred`.
    pub fn remove_first(&self, mut pred: impl FnMut(&T) -> bool) -> Option<T> {
        let mut q = self.inner.lock();
        let pos = q.iter().position(|item| pred(item))?;
        q.remove(pos)
    }

    /// Block until the queue is non-empty, closed, or the timeout elapses.
    /// Returns true if the queue is non-empty.
    pub fn wait_nonempty(&self, timeout: Duration) -> bool {
        let mut q = self.inner.lock();
        if !q.is_empty() {
            return true;
        }
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        self.nonempty.wait_for(&mut q, timeout);
        !q.is_empty()
    }

    /// Remove everything, returning the drained entries for cleanup.
    pub fn drain(&self) -> Vec<T> {
        self.inner.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Wake all waiters and make subsequent waits return immediately.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.nonempty.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
