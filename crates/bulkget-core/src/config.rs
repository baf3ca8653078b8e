use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default number of concurrent workers.
pub const DEFAULT_WORKER_COUNT: usize = 50;

/// Default destination directory for fetched files and the failure report.
pub const DEFAULT_OUTPUT_DIR: &str = "/tmp/image_down";

/// What a worker does when it cannot create or write its destination file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocalFaultPolicy {
    /// Stop the whole batch; no report is written.
    #[default]
    Abort,
    /// Record a LOCAL_IO failure for the item and keep going.
    Record,
}

/// On-disk format of the failure report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    /// `KIND resource status [detail]`, one record per line.
    #[default]
    Text,
    /// One JSON object per line.
    Jsonl,
}

/// Global configuration loaded from `~/.config/bulkget/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkgetConfig {
    /// Number of worker threads pulling from the work queue.
    pub worker_count: usize,
    /// Directory receiving one file per fetched resource plus the failure report.
    pub output_dir: PathBuf,
    /// Lower bound on work queue capacity. The effective capacity is never below the item count.
    #[serde(default)]
    pub queue_capacity: Option<usize>,
    /// The one HTTP status treated as success. Anything else is NOTOK.
    #[serde(default = "default_success_status")]
    pub success_status: u32,
    #[serde(default)]
    pub local_fault_policy: LocalFaultPolicy,
    /// Report distinct resources that map to the same destination file instead of fetching both.
    #[serde(default)]
    pub detect_collisions: bool,
    /// Remove and recreate `output_dir` before the run.
    #[serde(default)]
    pub clean_output_dir: bool,
    /// Total deadline per fetch in seconds (None = wait forever).
    #[serde(default)]
    pub fetch_timeout_secs: Option<u64>,
    /// Connect deadline per fetch in seconds (None = transport default).
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
    #[serde(default = "default_follow_redirects")]
    pub follow_redirects: bool,
    #[serde(default)]
    pub report_format: ReportFormat,
}

fn default_success_status() -> u32 {
    200
}

fn default_follow_redirects() -> bool {
    true
}

impl Default for BulkgetConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            queue_capacity: None,
            success_status: default_success_status(),
            local_fault_policy: LocalFaultPolicy::Abort,
            detect_collisions: false,
            clean_output_dir: false,
            fetch_timeout_secs: None,
            connect_timeout_secs: None,
            follow_redirects: default_follow_redirects(),
            report_format: ReportFormat::Text,
        }
    }
}

impl BulkgetConfig {
    /// Rejects values the batch cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            anyhow::bail!("worker_count must be at least 1");
        }
        if self.output_dir.as_os_str().is_empty() {
            anyhow::bail!("output_dir must not be empty");
        }
        Ok(())
    }

    /// Work queue capacity for `item_count` items.
    pub fn effective_queue_capacity(&self, item_count: usize) -> usize {
        self.queue_capacity.unwrap_or(0).max(item_count).max(1)
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("bulkget")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<BulkgetConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = BulkgetConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }
    load_from_path(&path)
}

/// Load configuration from an explicit file.
pub fn load_from_path(path: &Path) -> Result<BulkgetConfig> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let cfg: BulkgetConfig =
        toml::from_str(&data).with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}
