use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Outcome of [`WorkQueue::pop`].
#[derive(Debug, PartialEq, Eq)]
pub enum Pop<T> {
    Item(T),
    Timeout,
    Closed,
}

struct Inner<T> {
    items: VecDeque<T>,
    queued: HashSet<T>,
    closed: bool,
}

/// FIFO of work items where pushing an already queued item is a no-op.
pub struct WorkQueue<T> {
    inner: Mutex<Inner<T>>,
    cv: Condvar,
}

impl<T: Copy + Eq + Hash> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy + Eq + Hash> WorkQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                queued: HashSet::new(),
                closed: false,
            }),
            cv: Condvar::new(),
        }
    }

    /// Queue `item` unless it is already queued. Returns `true` if it was
    /// added.
    pub fn push(&self, item: T) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed || !inner.queued.insert(item) {
            return false;
        }
        inner.items.push_back(item);
        drop(inner);
        self.cv.notify_one();
        true
    }

    /// Take the oldest item, waiting up to `timeout` (forever if `None`).
    /// Items left when the queue is closed are discarded.
    pub fn pop(&self, timeout: Option<Duration>) -> Pop<T> {
        let deadline = timeout.map(|t| std::time::Instant::now() + t);
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return Pop::Closed;
            }
            if let Some(item) = inner.items.pop_front() {
                inner.queued.remove(&item);
                return Pop::Item(item);
            }
            match deadline {
                Some(deadline) => {
                    if self.cv.wait_until(&mut inner, deadline).timed_out() {
                        return Pop::Timeout;
                    }
                }
                None => self.cv.wait(&mut inner),
            }
        }
    }

    /// Wake every waiter and refuse further items.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.items.clear();
        inner.queued.clear();
        drop(inner);
        self.cv.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }
}
