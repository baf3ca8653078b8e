//! Fixed-size worker pool draining a `WorkQueue`.
//!
//! Generic over the item type and the per-item handler, so the consumer loop
//! can be exercised without any network I/O. Every worker owns a
//! `BarrierGuard`; the pool's `wait` returns once all of them have been
//! dropped, whichever way each worker exited.

use std::io;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::barrier::CompletionBarrier;
use crate::control::CancelToken;
use crate::queue::WorkQueue;

/// Per-worker results gathered after the barrier releases.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolReport {
    /// Items taken off the queue by each worker that exited normally, indexed by worker id.
    pub handled: Vec<usize>,
    /// Workers that terminated by panicking.
    pub panicked: usize,
}

impl PoolReport {
    /// Items dequeued by workers that exited normally.
    pub fn total_handled(&self) -> usize {
        self.handled.iter().sum()
    }
}

/// Running pool. Call `wait` to block on the completion barrier.
pub struct WorkerPool {
    barrier: Arc<CompletionBarrier>,
    handles: Vec<JoinHandle<usize>>,
}

impl WorkerPool {
    /// Spawn exactly `worker_count` threads pulling from `queue` until it is closed and drained,
    /// `stop` is raised, or the handler returns `ControlFlow::Break`.
    ///
    /// If a thread cannot be spawned, `stop` is raised, the workers already running are
    /// waited for, and the spawn error is returned.
    pub fn spawn<T, F>(
        queue: Arc<WorkQueue<T>>,
        worker_count: usize,
        stop: CancelToken,
        handler: F,
    ) -> io::Result<Self>
    where
        T: Send + 'static,
        F: Fn(usize, T) -> ControlFlow<()> + Send + Sync + 'static,
    {
        let barrier = CompletionBarrier::new(worker_count);
        let handler = Arc::new(handler);
        let mut handles = Vec::with_capacity(worker_count);

        for id in 0..worker_count {
            let guard = barrier.guard();
            let queue = Arc::clone(&queue);
            let stop_w = stop.clone();
            let handler = Arc::clone(&handler);
            let spawned = thread::Builder::new()
                .name(format!("bulkget-worker-{}", id))
                .spawn(move || {
                    let _guard = guard;
                    worker_loop(id, &queue, &stop_w, handler.as_ref())
                });
            match spawned {
                Ok(h) => handles.push(h),
                Err(e) => {
                    tracing::error!(worker = id, "failed to spawn worker: {}", e);
                    stop.cancel();
                    // Counts for workers that will never exist.
                    for _ in id + 1..worker_count {
                        drop(barrier.guard());
                    }
                    let pool = WorkerPool { barrier, handles };
                    pool.wait();
                    return Err(e);
                }
            }
        }

        tracing::debug!(workers = worker_count, "worker pool started");
        Ok(WorkerPool { barrier, handles })
    }

    /// Like `wait`, but returns `None` as soon as `abort` is raised.
    ///
    /// Workers still inside a handler are detached; they exit on their own at
    /// their next stop check.
    pub fn wait_unless(self, abort: &CancelToken) -> Option<PoolReport> {
        if self.barrier.wait_or_cancelled(abort) {
            return Some(self.wait());
        }
        tracing::debug!(
            busy = self.barrier.remaining(),
            "abort raised; not waiting for busy workers"
        );
        None
    }

    /// Block until every worker has released the barrier, then collect per-worker counts.
    pub fn wait(self) -> PoolReport {
        self.barrier.wait();
        let mut report = PoolReport::default();
        for (id, h) in self.handles.into_iter().enumerate() {
            match h.join() {
                Ok(n) => report.handled.push(n),
                Err(e) => {
                    tracing::error!(worker = id, "worker panicked: {:?}", e);
                    report.handled.push(0);
                    report.panicked += 1;
                }
            }
        }
        report
    }
}

fn worker_loop<T, F>(id: usize, queue: &WorkQueue<T>, stop: &CancelToken, handler: &F) -> usize
where
    F: Fn(usize, T) -> ControlFlow<()>,
{
    let mut handled = 0usize;
    loop {
        if stop.is_cancelled() {
            tracing::debug!(worker = id, "stop requested");
            break;
        }
        let Some(item) = queue.recv() else {
            break;
        };
        handled += 1;
        if handler(id, item).is_break() {
            break;
        }
    }
    tracing::debug!(worker = id, handled, "worker finished");
    handled
}
