//! CLI for the bulkget bulk fetcher.

mod commands;

use anyhow::Result;
use bulkget_core::config::{self, BulkgetConfig, LocalFaultPolicy, ReportFormat};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use commands::{run_fetch, run_show_config};

/// Top-level CLI for bulkget.
#[derive(Debug, Parser)]
#[command(name = "bulkget")]
#[command(about = "bulkget: fetch a list of URLs with a fixed pool of workers", long_about = None)]
pub struct Cli {
    /// Config file to use instead of ~/.config/bulkget/config.toml.
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Fetch every URL listed in INPUT into the output directory.
    Fetch {
        /// Text file with one URL per line.
        input: PathBuf,

        /// Number of concurrent workers (default from config, 50).
        #[arg(value_parser = parse_worker_count)]
        workers: Option<usize>,

        #[command(flatten)]
        opts: FetchOptions,
    },

    /// Show the config file path and the effective configuration.
    Config,
}

/// Flags that override config file values for one `fetch` run.
#[derive(Debug, Default, clap::Args)]
pub struct FetchOptions {
    /// Directory receiving fetched files and the failure report.
    #[arg(long, short = 'o', value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Remove and recreate the output directory before fetching.
    #[arg(long)]
    pub clean: bool,

    /// The HTTP status treated as success (exact match).
    #[arg(long, value_name = "CODE")]
    pub success_status: Option<u32>,

    /// Record destination create/write errors as failures instead of aborting the batch.
    #[arg(long)]
    pub record_local_faults: bool,

    /// Report URLs that would overwrite another URL's file instead of fetching them.
    #[arg(long)]
    pub detect_collisions: bool,

    /// Per-fetch deadline in seconds.
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Per-fetch connect deadline in seconds.
    #[arg(long, value_name = "SECS")]
    pub connect_timeout: Option<u64>,

    /// Failure report format.
    #[arg(long, value_enum, value_name = "FORMAT")]
    pub report_format: Option<ReportFormatArg>,

    /// Do not print progress while fetching.
    #[arg(long, short = 'q')]
    pub quiet: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ReportFormatArg {
    Text,
    Jsonl,
}

impl From<ReportFormatArg> for ReportFormat {
    fn from(arg: ReportFormatArg) -> Self {
        match arg {
            ReportFormatArg::Text => ReportFormat::Text,
            ReportFormatArg::Jsonl => ReportFormat::Jsonl,
        }
    }
}

fn parse_worker_count(s: &str) -> Result<usize, String> {
    let n: usize = s
        .parse()
        .map_err(|_| format!("number of workers must be numeric: {}", s))?;
    if n == 0 {
        return Err("number of workers must be at least 1".to_string());
    }
    Ok(n)
}

/// Layer command-line values over the loaded config.
pub fn apply_overrides(mut cfg: BulkgetConfig, workers: Option<usize>, opts: &FetchOptions) -> BulkgetConfig {
    if let Some(n) = workers {
        cfg.worker_count = n;
    }
    if let Some(dir) = &opts.output_dir {
        cfg.output_dir = dir.clone();
    }
    if opts.clean {
        cfg.clean_output_dir = true;
    }
    if let Some(code) = opts.success_status {
        cfg.success_status = code;
    }
    if opts.record_local_faults {
        cfg.local_fault_policy = LocalFaultPolicy::Record;
    }
    if opts.detect_collisions {
        cfg.detect_collisions = true;
    }
    if opts.timeout.is_some() {
        cfg.fetch_timeout_secs = opts.timeout;
    }
    if opts.connect_timeout.is_some() {
        cfg.connect_timeout_secs = opts.connect_timeout;
    }
    if let Some(format) = opts.report_format {
        cfg.report_format = format.into();
    }
    cfg
}

impl CliCommand {
    pub async fn run_from_args() -> Result<()> {
        let cli = Cli::parse();
        let cfg = match &cli.config {
            Some(path) => config::load_from_path(path)?,
            None => config::load_or_init()?,
        };
        tracing::debug!("loaded config: {:?}", cfg);

        match cli.command {
            CliCommand::Fetch {
                input,
                workers,
                opts,
            } => {
                if workers.is_none() {
                    tracing::info!("number of workers [takes default]: {}", cfg.worker_count);
                }
                let cfg = apply_overrides(cfg, workers, &opts);
                run_fetch(cfg, &input, opts.quiet).await?;
            }
            CliCommand::Config => run_show_config(cli.config.as_deref(), &cfg)?,
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests;
