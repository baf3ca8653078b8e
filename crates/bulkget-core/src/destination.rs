//! Destination paths for fetched resources and output directory preparation.
//!
//! A resource is stored under its final path segment: everything after the
//! last `/`, query string included, with no sanitizing. Two resources with
//! the same final segment share one file.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Everything after the last `/` of `resource` (the whole string if there is none).
///
/// `https://yahoo.com/pics/marissa.jpg` → `marissa.jpg`
pub fn basename(resource: &str) -> &str {
    match resource.rfind('/') {
        Some(idx) => &resource[idx + 1..],
        None => resource,
    }
}

/// `output_dir` joined with the resource's basename.
pub fn destination_path(output_dir: &Path, resource: &str) -> PathBuf {
    output_dir.join(basename(resource))
}

/// Create `dir` (and parents). With `clean`, remove any existing tree at `dir` first.
pub fn prepare_output_dir(dir: &Path, clean: bool) -> Result<()> {
    if clean && dir.exists() {
        fs::remove_dir_all(dir)
            .with_context(|| format!("failed to remove output dir {}", dir.display()))?;
        tracing::info!("removed existing output dir {}", dir.display());
    }
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create output dir {}", dir.display()))?;
    Ok(())
}

/// Items whose destination was already claimed by a different, earlier resource.
///
/// Returns `(index, claimed_by)` pairs in input order. Repeats of the exact same
/// resource are not collisions.
pub fn find_collisions<'a>(resources: &'a [String]) -> Vec<(usize, &'a str)> {
    let mut owners: HashMap<&str, &str> = HashMap::new();
    let mut collisions = Vec::new();
    for (index, resource) in resources.iter().enumerate() {
        let name = basename(resource);
        match owners.get(name) {
            Some(owner) if *owner != resource.as_str() => collisions.push((index, *owner)),
            Some(_) => {}
            None => {
                owners.insert(name, resource.as_str());
            }
        }
    }
    collisions
}
