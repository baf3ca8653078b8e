//! Completion barrier: a wait-group released once per worker.
//!
//! Each worker holds a `BarrierGuard`; dropping it (normal return or unwind)
//! counts the worker out. `wait` blocks until every worker has been counted.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::control::CancelToken;

/// How often `wait_or_cancelled` rechecks the token while workers are still out.
const CANCEL_POLL: Duration = Duration::from_millis(25);

#[derive(Debug)]
pub struct CompletionBarrier {
    remaining: Mutex<usize>,
    cv: Condvar,
}

impl CompletionBarrier {
    /// Barrier expecting `count` releases.
    pub fn new(count: usize) -> Arc<Self> {
        Arc::new(Self {
            remaining: Mutex::new(count),
            cv: Condvar::new(),
        })
    }

    /// Poison-tolerant: releases happen in Drop, possibly during a panic.
    fn lock(&self) -> MutexGuard<'_, usize> {
        self.remaining
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    /// Guard that releases one count when dropped.
    pub fn guard(self: &Arc<Self>) -> BarrierGuard {
        BarrierGuard {
            barrier: Arc::clone(self),
        }
    }

    fn release(&self) {
        let mut remaining = self.lock();
        debug_assert!(*remaining > 0, "completion barrier released too many times");
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            self.cv.notify_all();
        }
    }

    /// Outstanding releases (snapshot).
    pub fn remaining(&self) -> usize {
        *self.lock()
    }

    /// Block until the count reaches zero. No timeout.
    pub fn wait(&self) {
        let mut remaining = self.lock();
        while *remaining > 0 {
            remaining = self
                .cv
                .wait(remaining)
                .unwrap_or_else(|poison| poison.into_inner());
        }
    }

    /// Like `wait`, but gives up once `cancel` is raised. Returns `true` if every
    /// count was released, `false` if it stopped waiting because of the token.
    pub fn wait_or_cancelled(&self, cancel: &CancelToken) -> bool {
        let mut remaining = self.lock();
        while *remaining > 0 {
            if cancel.is_cancelled() {
                return false;
            }
            let (guard, _) = self
                .cv
                .wait_timeout(remaining, CANCEL_POLL)
                .unwrap_or_else(|poison| poison.into_inner());
            remaining = guard;
        }
        true
    }
}

/// Releases one barrier count when dropped.
#[derive(Debug)]
pub struct BarrierGuard {
    barrier: Arc<CompletionBarrier>,
}

impl Drop for BarrierGuard {
    fn drop(&mut self) {
        self.barrier.release();
    }
}
