//! Sweeping of files the verification sub-agent leaves behind.
//!
//! The verifier runs with black-box tools only and cannot delete its own
//! screenshots or tool scratch directories, so the orchestrator removes them
//! at done-gate teardown. Only paths that appeared after the snapshot are
//! removed; anything matching a pattern that already existed is left alone.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Snapshot of artifact-pattern matches taken before the done-gate runs.
#[derive(Debug, Clone)]
pub struct ArtifactSweep {
    root: PathBuf,
    patterns: Vec<String>,
    preexisting: BTreeSet<PathBuf>,
}

impl ArtifactSweep {
    pub fn snapshot(root: &Path, patterns: &[String]) -> Self {
        let preexisting = matches(root, patterns);
        debug!(count = preexisting.len(), "artifact snapshot taken");
        Self {
            root: root.to_path_buf(),
            patterns: patterns.to_vec(),
            preexisting,
        }
    }

    /// Remove new matches. Best-effort: failures are logged and skipped.
    ///
    /// Returns the paths that were removed.
    pub fn sweep(&self) -> Vec<PathBuf> {
        let mut removed = Vec::new();
        for path in matches(&self.root, &self.patterns) {
            if self.preexisting.contains(&path) {
                continue;
            }
            let result = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            match result {
                Ok(()) => removed.push(path),
                Err(err) => warn!(path = %path.display(), %err, "failed to remove artifact"),
            }
        }
        if !removed.is_empty() {
            debug!(count = removed.len(), "removed verification artifacts");
        }
        removed
    }
}

fn matches(root: &Path, patterns: &[String]) -> BTreeSet<PathBuf> {
    let mut found = BTreeSet::new();
    for pattern in patterns {
        let full = root.join(pattern);
        let Some(full) = full.to_str() else {
            continue;
        };
        let paths = match glob::glob(full) {
            Ok(paths) => paths,
            Err(err) => {
                warn!(%pattern, %err, "invalid artifact pattern");
                continue;
            }
        };
        found.extend(paths.flatten());
    }
    found
}
