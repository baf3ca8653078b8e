//! Batch orchestration: distribute, run the pool, wait, report.
//!
//! One call to `run_batch` is one independent run. Everything it needs comes
//! in through `BatchContext`; nothing is process-global, so several batches
//! can run side by side against different output directories.

use std::collections::HashSet;
use std::io;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::BulkgetConfig;
use crate::control::CancelToken;
use crate::destination::{find_collisions, prepare_output_dir};
use crate::failure::{FailureCollector, FailureRecord};
use crate::fetcher::{Fetcher, ItemOutcome, LocalFault, Transport};
use crate::pool::WorkerPool;
use crate::queue::{QueueClosed, WorkQueue};
use crate::report;

/// Sent after every processed item when a progress channel is attached.
#[derive(Debug, Clone)]
pub struct ItemEvent {
    pub worker: usize,
    pub resource: String,
    pub ok: bool,
}

/// Inputs for one batch run.
#[derive(Clone)]
pub struct BatchContext {
    pub config: BulkgetConfig,
    pub transport: Arc<dyn Transport>,
    /// Stops the batch: workers stop dequeuing and in-flight transfers are cut off.
    /// A local fault under the abort policy raises it too.
    pub cancel: CancelToken,
    /// Per-item events; dropped when the channel is full.
    pub progress: Option<tokio::sync::mpsc::Sender<ItemEvent>>,
}

impl BatchContext {
    pub fn new(config: BulkgetConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            transport,
            cancel: CancelToken::new(),
            progress: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, tx: tokio::sync::mpsc::Sender<ItemEvent>) -> Self {
        self.progress = Some(tx);
        self
    }
}

/// What a completed batch produced.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub total: usize,
    pub succeeded: usize,
    pub failures: Vec<FailureRecord>,
    pub elapsed: Duration,
    /// Set when at least one failure was written to the report.
    pub report_path: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    /// A destination file could not be created or written (abort policy).
    #[error(transparent)]
    LocalFault(#[from] LocalFault),
    #[error("batch cancelled after {handled} of {total} items")]
    Cancelled { handled: usize, total: usize },
    #[error("{count} worker(s) panicked")]
    WorkerPanicked { count: usize },
    #[error("failed to start worker pool: {0}")]
    Spawn(#[source] io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Build a queue holding every resource in input order, then close it.
///
/// `capacity` is raised to the item count so filling never waits on a consumer.
pub fn distribute(resources: Vec<String>, capacity: usize) -> Arc<WorkQueue<String>> {
    let queue = Arc::new(WorkQueue::with_capacity(capacity.max(resources.len())));
    for resource in resources {
        if let Err(QueueClosed(resource)) = queue.push(resource) {
            tracing::error!(resource = %resource, "work queue closed during distribution");
        }
    }
    queue.close();
    queue
}

/// Split off items whose destination file is already claimed by a different resource.
fn split_collisions(resources: Vec<String>) -> (Vec<String>, Vec<FailureRecord>) {
    let collisions = find_collisions(&resources);
    if collisions.is_empty() {
        return (resources, Vec::new());
    }
    let records: Vec<FailureRecord> = collisions
        .iter()
        .map(|(i, owner)| FailureRecord::collision(&resources[*i], owner))
        .collect();
    let skip: HashSet<usize> = collisions.iter().map(|(i, _)| *i).collect();
    let kept = resources
        .into_iter()
        .enumerate()
        .filter(|(i, _)| !skip.contains(i))
        .map(|(_, r)| r)
        .collect();
    (kept, records)
}

/// Fetch every resource with `config.worker_count` workers and report failures.
///
/// Blocks the calling thread until all workers have exited. A local fault
/// under the abort policy is the exception: it returns at once, and workers
/// still mid-transfer are left to wind down on their own with their results
/// discarded. Call from `spawn_blocking` when used from async code.
pub fn run_batch(ctx: &BatchContext, resources: Vec<String>) -> Result<BatchOutcome, BatchError> {
    let cfg = &ctx.config;
    cfg.validate()?;
    prepare_output_dir(&cfg.output_dir, cfg.clean_output_dir)?;
    report::remove_stale_reports(&cfg.output_dir)?;

    let total = resources.len();
    tracing::info!(
        total,
        workers = cfg.worker_count,
        output_dir = %cfg.output_dir.display(),
        "batch starting"
    );

    let collector = FailureCollector::with_capacity(total);
    let (work, collision_records) = if cfg.detect_collisions {
        split_collisions(resources)
    } else {
        (resources, Vec::new())
    };
    if !collision_records.is_empty() {
        let tx = collector.sender();
        for record in collision_records {
            tx.record(record);
        }
    }

    let start = Instant::now();
    if !work.is_empty() {
        let enqueued = work.len();
        let queue = distribute(work, cfg.effective_queue_capacity(enqueued));
        let fault: Arc<Mutex<Option<LocalFault>>> = Arc::new(Mutex::new(None));
        // Items whose outcome was fully recorded.
        let finished = Arc::new(AtomicUsize::new(0));
        // Raised only by a local fault; ends the wait below without the barrier.
        let abort = CancelToken::new();
        let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        tracing::info!(enqueued, cpus, "processing begins");

        let handler = {
            let config = cfg.clone();
            let transport = Arc::clone(&ctx.transport);
            let failures = collector.sender();
            let stop = ctx.cancel.clone();
            let fault = Arc::clone(&fault);
            let abort = abort.clone();
            let finished = Arc::clone(&finished);
            let progress = ctx.progress.clone();
            move |worker: usize, resource: String| {
                let outcome = Fetcher::new(transport.as_ref(), &config, &stop).fetch_item(&resource);
                let ok = outcome.is_success();
                let flow = match outcome {
                    ItemOutcome::Fetched { .. } => {
                        finished.fetch_add(1, Ordering::SeqCst);
                        ControlFlow::Continue(())
                    }
                    ItemOutcome::Failed(record) => {
                        failures.record(record);
                        finished.fetch_add(1, Ordering::SeqCst);
                        ControlFlow::Continue(())
                    }
                    ItemOutcome::Cancelled => return ControlFlow::Break(()),
                    ItemOutcome::Fault(f) => {
                        tracing::error!(worker, "{}; aborting batch", f);
                        // Store before raising the token so the orchestrator sees it on wake-up.
                        let mut slot = fault.lock().unwrap_or_else(|p| p.into_inner());
                        if slot.is_none() {
                            *slot = Some(f);
                        }
                        drop(slot);
                        stop.cancel();
                        abort.cancel();
                        ControlFlow::Break(())
                    }
                };
                if let Some(tx) = &progress {
                    let _ = tx.try_send(ItemEvent { worker, resource, ok });
                }
                flow
            }
        };

        let pool = WorkerPool::spawn(queue, cfg.worker_count, ctx.cancel.clone(), handler)
            .map_err(BatchError::Spawn)?;
        if let Some(pool_report) = pool.wait_unless(&abort) {
            if pool_report.panicked > 0 {
                return Err(BatchError::WorkerPanicked {
                    count: pool_report.panicked,
                });
            }
        }
        if let Some(f) = fault.lock().unwrap_or_else(|p| p.into_inner()).take() {
            return Err(BatchError::LocalFault(f));
        }
        let done = finished.load(Ordering::SeqCst);
        if done < enqueued {
            return Err(BatchError::Cancelled {
                handled: done,
                total,
            });
        }
        if ctx.cancel.is_cancelled() {
            tracing::debug!("cancel raised after the last item finished; batch is complete");
        }
    }
    let elapsed = start.elapsed();
    tracing::info!("download time elapsed: {:.2}s", elapsed.as_secs_f64());

    let failures = collector.drain();
    tracing::info!("download error count: {}", failures.len());
    let report_path = report::write_report(&cfg.output_dir, cfg.report_format, &failures)?;
    if let Some(path) = &report_path {
        tracing::info!("see error file for details: {}", path.display());
    }

    Ok(BatchOutcome {
        total,
        succeeded: total - failures.len(),
        failures,
        elapsed,
        report_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LocalFaultPolicy;
    use crate::failure::FailureKind;
    use crate::fetcher::FetchError;
    use std::io::Write;

    /// Status and body are encoded in the resource: `http://h/<status>/<name>`;
    /// `http://down/<name>` is a transport failure.
    #[derive(Default)]
    struct PathEncoded {
        calls: AtomicUsize,
    }

    impl Transport for PathEncoded {
        fn fetch(&self, resource: &str, sink: &mut dyn Write, _: &CancelToken) -> Result<u32, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if resource.starts_with("http://down/") {
                return Err(FetchError::Transport("Couldn't connect to server".into()));
            }
            let mut parts = resource.trim_start_matches("http://h/").splitn(2, '/');
            let status: u32 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(200);
            let name = parts.next().unwrap_or("");
            sink.write_all(format!("body of {}", name).as_bytes())
                .map_err(FetchError::Storage)?;
            Ok(status)
        }
    }

    fn ctx_for(dir: &std::path::Path, workers: usize, transport: Arc<dyn Transport>) -> BatchContext {
        let config = BulkgetConfig {
            worker_count: workers,
            output_dir: dir.to_path_buf(),
            ..BulkgetConfig::default()
        };
        BatchContext::new(config, transport)
    }

    fn urls(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn distribute_preserves_order_and_closes() {
        let q = distribute(urls(&["a", "b", "c"]), 1);
        assert!(q.is_closed());
        assert!(q.capacity() >= 3);
        assert_eq!(q.recv().as_deref(), Some("a"));
        assert_eq!(q.recv().as_deref(), Some("b"));
        assert_eq!(q.recv().as_deref(), Some("c"));
        assert_eq!(q.recv(), None);
    }

    #[test]
    fn mixed_outcomes_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_for(dir.path(), 3, Arc::new(PathEncoded::default()));
        let outcome = run_batch(
            &ctx,
            urls(&["http://h/200/a.jpg", "http://h/404/b.jpg", "http://down/c.jpg"]),
        )
        .unwrap();

        assert_eq!(outcome.total, 3);
        assert_eq!(outcome.succeeded, 1);
        assert_eq!(std::fs::read_to_string(dir.path().join("a.jpg")).unwrap(), "body of a.jpg");
        assert_eq!(std::fs::read_to_string(dir.path().join("b.jpg")).unwrap(), "body of b.jpg");
        assert_eq!(std::fs::read(dir.path().join("c.jpg")).unwrap(), b"");

        let report = std::fs::read_to_string(outcome.report_path.unwrap()).unwrap();
        let mut lines: Vec<_> = report.lines().collect();
        lines.sort_unstable();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "NOTOK http://h/404/b.jpg 404");
        assert!(lines[1].starts_with("TRANSPORT_ERROR http://down/c.jpg -1"), "{}", lines[1]);
    }

    #[test]
    fn every_item_fetched_once_for_any_worker_count() {
        let list: Vec<String> = (0..40).map(|i| format!("http://h/200/f{}.bin", i)).collect();
        for workers in [1, 4, 40, 100] {
            let dir = tempfile::tempdir().unwrap();
            let transport = Arc::new(PathEncoded::default());
            let ctx = ctx_for(dir.path(), workers, transport.clone());
            let outcome = run_batch(&ctx, list.clone()).unwrap();
            assert_eq!(transport.calls.load(Ordering::SeqCst), 40, "workers={}", workers);
            assert_eq!(outcome.succeeded, 40);
            assert!(outcome.failures.is_empty());
            assert!(outcome.report_path.is_none());
        }
    }

    #[test]
    fn empty_input_spawns_nothing_and_writes_no_report() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(report::TEXT_REPORT_NAME), "stale").unwrap();
        let transport = Arc::new(PathEncoded::default());
        let ctx = ctx_for(dir.path(), 50, transport.clone());
        let outcome = run_batch(&ctx, Vec::new()).unwrap();
        assert_eq!(outcome.total, 0);
        assert!(outcome.report_path.is_none());
        assert!(!dir.path().join(report::TEXT_REPORT_NAME).exists());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn rerun_yields_same_file_set() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_for(dir.path(), 2, Arc::new(PathEncoded::default()));
        let list = urls(&["http://h/200/a.txt", "http://h/500/b.txt"]);
        let listing = |d: &std::path::Path| {
            let mut names: Vec<_> = std::fs::read_dir(d)
                .unwrap()
                .map(|e| e.unwrap().file_name().into_string().unwrap())
                .collect();
            names.sort();
            names
        };
        run_batch(&ctx, list.clone()).unwrap();
        let first = listing(dir.path());
        let first_body = std::fs::read(dir.path().join("a.txt")).unwrap();
        run_batch(&ctx, list).unwrap();
        assert_eq!(listing(dir.path()), first);
        assert_eq!(std::fs::read(dir.path().join("a.txt")).unwrap(), first_body);
    }

    #[test]
    fn collisions_detected_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(PathEncoded::default());
        let mut ctx = ctx_for(dir.path(), 2, transport.clone());
        ctx.config.detect_collisions = true;
        let outcome = run_batch(&ctx, urls(&["http://h/200/x.jpg", "http://h/201/x.jpg"])).unwrap();
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].kind, FailureKind::Collision);
        assert_eq!(outcome.failures[0].resource, "http://h/201/x.jpg");
    }

    #[test]
    fn local_fault_aborts_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_for(dir.path(), 2, Arc::new(PathEncoded::default()));
        // A trailing slash yields an empty basename: the destination is the directory itself.
        let err = run_batch(&ctx, urls(&["http://h/200/"])).unwrap_err();
        assert!(matches!(err, BatchError::LocalFault(_)), "{:?}", err);
        assert!(ctx.cancel.is_cancelled());
        assert!(!dir.path().join(report::TEXT_REPORT_NAME).exists());
    }

    #[test]
    fn local_fault_recorded_under_record_policy() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = ctx_for(dir.path(), 2, Arc::new(PathEncoded::default()));
        ctx.config.local_fault_policy = LocalFaultPolicy::Record;
        let outcome = run_batch(&ctx, urls(&["http://h/200/", "http://h/200/ok.txt"])).unwrap();
        assert_eq!(outcome.succeeded, 1);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].kind, FailureKind::LocalIo);
    }

    #[test]
    fn pre_cancelled_batch_reports_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let ctx = ctx_for(dir.path(), 2, Arc::new(PathEncoded::default())).with_cancel(cancel);
        let err = run_batch(&ctx, urls(&["http://h/200/a"])).unwrap_err();
        assert!(matches!(err, BatchError::Cancelled { handled: 0, total: 1 }), "{:?}", err);
    }

    #[test]
    fn progress_events_cover_every_item() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::channel(16);
        let ctx = ctx_for(dir.path(), 3, Arc::new(PathEncoded::default())).with_progress(tx);
        run_batch(&ctx, urls(&["http://h/200/a", "http://h/404/b", "http://down/c"])).unwrap();
        drop(ctx);
        let mut ok = 0;
        let mut failed = 0;
        while let Ok(ev) = rx.try_recv() {
            if ev.ok {
                ok += 1;
            } else {
                failed += 1;
            }
        }
        assert_eq!((ok, failed), (1, 2));
    }

    #[test]
    fn zero_workers_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_for(dir.path(), 0, Arc::new(PathEncoded::default()));
        assert!(matches!(run_batch(&ctx, urls(&["http://h/200/a"])), Err(BatchError::Other(_))));
    }

    /// `slow.bin` blocks for `hold`, checking the token only if `honor_cancel`;
    /// anything else is delegated to `PathEncoded`.
    struct Stalling {
        hold: Duration,
        honor_cancel: bool,
        inner: PathEncoded,
    }

    impl Transport for Stalling {
        fn fetch(&self, resource: &str, sink: &mut dyn Write, cancel: &CancelToken) -> Result<u32, FetchError> {
            if !resource.ends_with("/slow.bin") {
                return self.inner.fetch(resource, sink, cancel);
            }
            let start = Instant::now();
            while start.elapsed() < self.hold {
                if self.honor_cancel && cancel.is_cancelled() {
                    return Err(FetchError::Cancelled);
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            sink.write_all(b"slow body").map_err(FetchError::Storage)?;
            Ok(200)
        }
    }

    #[test]
    fn local_fault_returns_without_waiting_for_busy_workers() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(Stalling {
            hold: Duration::from_secs(3),
            honor_cancel: false,
            inner: PathEncoded::default(),
        });
        let ctx = ctx_for(dir.path(), 2, transport);
        let started = Instant::now();
        let err = run_batch(&ctx, urls(&["http://h/200/slow.bin", "http://h/200/"])).unwrap_err();
        let elapsed = started.elapsed();
        assert!(matches!(err, BatchError::LocalFault(_)), "{:?}", err);
        assert!(elapsed < Duration::from_secs(1), "abort took {:?}", elapsed);
        assert!(!dir.path().join(report::TEXT_REPORT_NAME).exists());
    }

    #[test]
    fn local_fault_discards_in_flight_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(Stalling {
            hold: Duration::from_secs(30),
            honor_cancel: true,
            inner: PathEncoded::default(),
        });
        let ctx = ctx_for(dir.path(), 2, transport);
        let err = run_batch(&ctx, urls(&["http://h/200/slow.bin", "http://h/200/"])).unwrap_err();
        assert!(matches!(err, BatchError::LocalFault(_)), "{:?}", err);
        // Give the abandoned worker time to see the token and unwind.
        std::thread::sleep(Duration::from_millis(200));
        let slow = dir.path().join("slow.bin");
        assert!(!slow.exists() || std::fs::read(&slow).unwrap().is_empty());
    }

    #[test]
    fn cancel_after_last_item_still_reports() {
        /// Raises the token while fetching the final resource, then completes it.
        struct CancelOnLast {
            last: &'static str,
            inner: PathEncoded,
        }

        impl Transport for CancelOnLast {
            fn fetch(&self, resource: &str, sink: &mut dyn Write, cancel: &CancelToken) -> Result<u32, FetchError> {
                let status = self.inner.fetch(resource, sink, cancel)?;
                if resource == self.last {
                    cancel.cancel();
                }
                Ok(status)
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(CancelOnLast {
            last: "http://h/404/b.txt",
            inner: PathEncoded::default(),
        });
        let ctx = ctx_for(dir.path(), 1, transport);
        let outcome = run_batch(&ctx, urls(&["http://h/200/a.txt", "http://h/404/b.txt"])).unwrap();
        assert!(ctx.cancel.is_cancelled());
        assert_eq!(outcome.succeeded, 1);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].kind, FailureKind::NotOk);
        assert!(outcome.report_path.is_some());
    }
}
