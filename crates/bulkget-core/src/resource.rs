//! Resource list loading: one URL per line.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Read resource identifiers from `reader`, one per line.
/// Lines are trimmed; blank lines are skipped; order and duplicates are kept.
pub fn parse_resources<R: BufRead>(reader: R) -> Result<Vec<String>> {
    let mut resources = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read line {}", lineno + 1))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        resources.push(trimmed.to_string());
    }
    Ok(resources)
}

/// Read resource identifiers from the file at `path`.
pub fn load_resources(path: &Path) -> Result<Vec<String>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open input file {}", path.display()))?;
    let resources = parse_resources(BufReader::new(file))
        .with_context(|| format!("failed to read input file {}", path.display()))?;
    tracing::debug!(count = resources.len(), "loaded resources from {}", path.display());
    Ok(resources)
}
