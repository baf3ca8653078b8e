//! Failure report persisted in the output directory after a batch.

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::config::ReportFormat;
use crate::failure::FailureRecord;

pub const TEXT_REPORT_NAME: &str = "download_fail.txt";
pub const JSONL_REPORT_NAME: &str = "download_fail.jsonl";

/// Fixed report location inside `output_dir` for `format`.
pub fn report_path(output_dir: &Path, format: ReportFormat) -> PathBuf {
    match format {
        ReportFormat::Text => output_dir.join(TEXT_REPORT_NAME),
        ReportFormat::Jsonl => output_dir.join(JSONL_REPORT_NAME),
    }
}

/// Delete reports left by an earlier run so a report only ever describes the latest batch.
pub fn remove_stale_reports(output_dir: &Path) -> Result<()> {
    for name in [TEXT_REPORT_NAME, JSONL_REPORT_NAME] {
        let path = output_dir.join(name);
        if path.is_file() {
            fs::remove_file(&path)
                .with_context(|| format!("failed to remove stale report {}", path.display()))?;
            tracing::debug!("removed stale report {}", path.display());
        }
    }
    Ok(())
}

/// Write `records`, one per line. Writes nothing and returns `None` when there are no records.
pub fn write_report(
    output_dir: &Path,
    format: ReportFormat,
    records: &[FailureRecord],
) -> Result<Option<PathBuf>> {
    if records.is_empty() {
        return Ok(None);
    }
    let path = report_path(output_dir, format);
    let file = File::create(&path)
        .with_context(|| format!("failed to create report {}", path.display()))?;
    let mut out = BufWriter::new(file);
    for record in records {
        match format {
            ReportFormat::Text => writeln!(out, "{}", record)?,
            ReportFormat::Jsonl => {
                serde_json::to_writer(&mut out, record).context("serialize failure record")?;
                out.write_all(b"\n")?;
            }
        }
    }
    out.flush()
        .with_context(|| format!("failed to write report {}", path.display()))?;
    Ok(Some(path))
}
