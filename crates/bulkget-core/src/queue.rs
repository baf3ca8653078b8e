//! Closable bounded FIFO shared by the distributor and the worker pool.
//!
//! Producers `push` until they `close`; consumers `recv` until the queue is
//! closed and drained. `push` blocks only while the queue is full, so a
//! producer that sizes the queue to its item count never waits on a consumer.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard};

/// Returned by `push` once the queue has been closed. Carries the rejected item back.
#[derive(Debug, PartialEq, Eq)]
pub struct QueueClosed<T>(pub T);

impl<T> fmt::Display for QueueClosed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "work queue is closed")
    }
}

impl<T: fmt::Debug> std::error::Error for QueueClosed<T> {}

#[derive(Debug)]
struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Bounded multi-producer multi-consumer FIFO with a one-way close signal.
///
/// Share it across threads via `Arc<WorkQueue<T>>`.
#[derive(Debug)]
pub struct WorkQueue<T> {
    capacity: usize,
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> WorkQueue<T> {
    /// Create an open queue holding at most `capacity` items (minimum 1).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Lock with poison recovery. A panicking consumer must not wedge the rest of the pool.
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Append `item`, blocking while the queue is full.
    pub fn push(&self, item: T) -> Result<(), QueueClosed<T>> {
        let mut st = self.lock();
        loop {
            if st.closed {
                return Err(QueueClosed(item));
            }
            if st.items.len() < self.capacity {
                break;
            }
            st = self
                .not_full
                .wait(st)
                .unwrap_or_else(|poison| poison.into_inner());
        }
        st.items.push_back(item);
        drop(st);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Mark the queue closed. Items already queued stay available to consumers.
    /// Calling it again is a no-op.
    pub fn close(&self) {
        let mut st = self.lock();
        if st.closed {
            return;
        }
        st.closed = true;
        drop(st);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Take the oldest item, blocking while the queue is open and empty.
    /// Returns `None` once the queue is closed and drained.
    pub fn recv(&self) -> Option<T> {
        let mut st = self.lock();
        loop {
            if let Some(item) = st.items.pop_front() {
                drop(st);
                self.not_full.notify_one();
                return Some(item);
            }
            if st.closed {
                return None;
            }
            st = self
                .not_empty
                .wait(st)
                .unwrap_or_else(|poison| poison.into_inner());
        }
    }

    /// Number of queued items (snapshot).
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
