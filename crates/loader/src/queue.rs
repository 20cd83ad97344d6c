use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

/// An item returned to a producer whose push was refused because the
/// queue had already entered end-wait or was terminated.
#[derive(Debug)]
pub struct Rejected<T>(pub T);

struct Inner<T> {
    items: VecDeque<T>,
    end_wait: bool,
    terminate: bool,
}

/// BoundedQueue is the universal hand-off between pipeline stages: a
/// FIFO of fixed capacity where producers block while full and
/// consumers block while empty.
///
/// A single condition variable serves both sides. That works because
/// producers wait only when the queue is full and consumers only when
/// it is empty, so the two wait sets are never populated at once. Wakes
/// are two-level: the first item (or first freed slot) wakes one
/// waiter, and the second wakes all of them, which recovers liveness
/// near the boundary without a thundering herd in the common case.
pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    cond: Condvar,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                end_wait: false,
                terminate: false,
            }),
            cond: Condvar::new(),
            capacity,
        }
    }

    /// Push an item, blocking while the queue is at capacity. A push
    /// against a queue in end-wait (or terminated) is rejected and
    /// hands the item back.
    pub fn push(&self, item: T) -> Result<(), Rejected<T>> {
        let mut inner = self.inner.lock().unwrap();
        while inner.items.len() == self.capacity && !inner.end_wait && !inner.terminate {
            inner = self.cond.wait(inner).unwrap();
        }
        if inner.end_wait || inner.terminate {
            return Err(Rejected(item));
        }

        inner.items.push_back(item);
        match inner.items.len() {
            1 => self.cond.notify_one(),
            2 => self.cond.notify_all(),
            _ => (),
        }
        Ok(())
    }

    /// Pop the next item, blocking while the queue is empty. Returns
    /// None once the queue is in end-wait and drained, or terminated.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.terminate {
                return None;
            }
            if let Some(item) = inner.items.pop_front() {
                if inner.items.len() == self.capacity - 1 {
                    self.cond.notify_one();
                } else if self.capacity >= 2 && inner.items.len() == self.capacity - 2 {
                    self.cond.notify_all();
                }
                return Some(item);
            }
            if inner.end_wait {
                return None;
            }
            inner = self.cond.wait(inner).unwrap();
        }
    }

    /// Pop without blocking.
    pub fn try_pop(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        if inner.terminate {
            return None;
        }
        let item = inner.items.pop_front()?;
        if inner.items.len() == self.capacity - 1 {
            self.cond.notify_one();
        } else if self.capacity >= 2 && inner.items.len() == self.capacity - 2 {
            self.cond.notify_all();
        }
        Some(item)
    }

    /// Take everything currently buffered.
    pub fn drain(&self) -> Vec<T> {
        let mut inner = self.inner.lock().unwrap();
        let items = inner.items.drain(..).collect();
        self.cond.notify_all();
        items
    }

    /// Accept no further pushes; consumers drain what remains and then
    /// observe None. Idempotent.
    pub fn end_wait(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.end_wait = true;
        self.cond.notify_all();
    }

    /// Stop as soon as possible. Pending items are discarded.
    pub fn terminate(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.terminate = true;
        inner.items.clear();
        self.cond.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
