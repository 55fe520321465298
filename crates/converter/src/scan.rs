use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, info, warn};
use walkdir::WalkDir;

use crate::format::FormatRegistry;
use crate::job::CONVERTED_SUFFIX;

/// Result of scanning a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanResult {
    /// File should be converted (path, size in bytes)
    Candidate(PathBuf, u64),
    /// File should be skipped (path, reason)
    Skipped(PathBuf, String),
}

/// Walk `roots` for files whose extension a registered family claims
pub fn scan_inputs(roots: &[PathBuf], registry: &FormatRegistry) -> Result<Vec<ScanResult>> {
    let extensions = registry.extensions();
    let mut results = Vec::new();

    for root in roots {
        if !root.exists() {
            warn!("Input root does not exist: {}", root.display());
            continue;
        }
        info!("Scanning directory: {}", root.display());

        let mut files_checked = 0;
        for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("Error reading directory entry: {}", e);
                    continue;
                }
            };
            let path = entry.path();
            if !entry.file_type().is_file() {
                continue;
            }
            files_checked += 1;

            let Some(ext) = path.extension().and_then(|s| s.to_str()).map(|s| s.to_lowercase()) else {
                continue;
            };
            if !extensions.contains(&ext.as_str()) {
                continue;
            }

            if let Some(reason) = skip_reason(path) {
                debug!("Skipping {}: {}", path.display(), reason);
                results.push(ScanResult::Skipped(path.to_path_buf(), reason));
                continue;
            }

            let size = std::fs::metadata(path)
                .with_context(|| format!("Failed to stat file: {}", path.display()))?
                .len();
            if size == 0 {
                results.push(ScanResult::Skipped(path.to_path_buf(), "empty file".to_string()));
                continue;
            }

            debug!("Found candidate: {} ({} bytes)", path.display(), size);
            results.push(ScanResult::Candidate(path.to_path_buf(), size));
        }
        info!("Finished scanning {}: {} files checked", root.display(), files_checked);
    }

    Ok(results)
}

fn skip_reason(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_string_lossy();
    if stem.ends_with(CONVERTED_SUFFIX) {
        return Some("already a conversion output".to_string());
    }
    None
}
