//! `bulkget fetch <input> [workers]` – fetch every listed URL and report failures.

use anyhow::{Context, Result};
use bulkget_core::batch::{run_batch, BatchContext, BatchOutcome, ItemEvent};
use bulkget_core::config::BulkgetConfig;
use bulkget_core::control::CancelToken;
use bulkget_core::fetcher::CurlTransport;
use bulkget_core::resource;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

const PROGRESS_INTERVAL_MS: u128 = 500;

/// Exit status after a second interrupt (128 + SIGINT).
const INTERRUPTED_EXIT: i32 = 130;

/// Running tally printed while the batch is in flight.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Tally {
    pub done: usize,
    pub failed: usize,
}

impl Tally {
    pub(crate) fn add(&mut self, ev: &ItemEvent) {
        self.done += 1;
        if !ev.ok {
            self.failed += 1;
        }
    }
}

/// Closing progress line, taken from the outcome so dropped events cannot skew it.
pub(crate) fn final_progress_line(outcome: &BatchOutcome) -> String {
    format!(
        "  {} / {} done, {} failed",
        outcome.total,
        outcome.total,
        outcome.failures.len()
    )
}

pub async fn run_fetch(cfg: BulkgetConfig, input: &Path, quiet: bool) -> Result<()> {
    cfg.validate()?;
    let resources = resource::load_resources(input)?;
    let total = resources.len();
    println!("input file: {}", input.display());
    println!("urls to fetch: {}", total);
    println!("workers: {}", cfg.worker_count);
    println!("output dir: {}", cfg.output_dir.display());

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            tracing::warn!("interrupt received; cancelling in-flight transfers");
            eprintln!("interrupted; stopping (press Ctrl-C again to exit now)");
            cancel.cancel();
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("second interrupt; exiting");
                std::process::exit(INTERRUPTED_EXIT);
            }
        });
    }

    let (progress_tx, mut progress_rx) = tokio::sync::mpsc::channel::<ItemEvent>(256);
    let progress_handle = tokio::spawn(async move {
        let mut tally = Tally::default();
        let mut last_print = Instant::now();
        while let Some(ev) = progress_rx.recv().await {
            tally.add(&ev);
            if quiet {
                continue;
            }
            if last_print.elapsed().as_millis() >= PROGRESS_INTERVAL_MS {
                println!("  {} / {} done, {} failed", tally.done, total, tally.failed);
                last_print = Instant::now();
            }
        }
        tally
    });

    let transport = Arc::new(CurlTransport::from_config(&cfg));
    let ctx = BatchContext::new(cfg, transport)
        .with_cancel(cancel)
        .with_progress(progress_tx);
    let result = tokio::task::spawn_blocking(move || run_batch(&ctx, resources))
        .await
        .context("batch task join")?;
    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            // Workers abandoned by an abort may still hold progress senders.
            progress_handle.abort();
            return Err(e.into());
        }
    };
    let tally = progress_handle.await.unwrap_or_default();
    tracing::debug!(?tally, "progress channel closed");

    if !quiet {
        println!("{}", final_progress_line(&outcome));
    }
    println!(
        "fetched {} of {} in {:.1}s",
        outcome.succeeded,
        outcome.total,
        outcome.elapsed.as_secs_f64()
    );
    println!("download error count: {}", outcome.failures.len());
    if let Some(path) = &outcome.report_path {
        println!("see error file for details: {}", path.display());
    }
    Ok(())
}
