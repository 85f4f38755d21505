//! Per-invocation logs under `<sessions-dir>/logs/<id>/`.
//!
//! Every sub-agent invocation gets a sequence number. Its raw event stream is
//! teed to `<nnn>-<label>.jsonl` while it runs, and a small JSON record of the
//! outcome is written to `<nnn>-<label>.meta.json` afterwards.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct InvocationMeta {
    pub seq: u32,
    pub label: String,
    /// Session `iterations` value when the invocation started.
    pub iteration: u32,
    /// Gate attempt number, for review/verification invocations.
    pub attempt: Option<u32>,
    pub started_at: String,
    pub ended_at: String,
    pub duration_ms: u64,
    /// `ok`, `interrupted` or `error`.
    pub outcome: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationPaths {
    pub stream_path: PathBuf,
    pub meta_path: PathBuf,
}

impl InvocationPaths {
    pub fn new(logs_dir: &Path, seq: u32, label: &str) -> Self {
        let stem = format!("{seq:03}-{label}");
        Self {
            stream_path: logs_dir.join(format!("{stem}.jsonl")),
            meta_path: logs_dir.join(format!("{stem}.meta.json")),
        }
    }
}

/// One past the highest sequence number already present in `logs_dir`.
///
/// Sequence numbers continue across `resume` invocations.
pub fn next_sequence(logs_dir: &Path) -> Result<u32> {
    if !logs_dir.exists() {
        return Ok(1);
    }
    let mut highest = 0;
    for entry in
        fs::read_dir(logs_dir).with_context(|| format!("read logs dir {}", logs_dir.display()))?
    {
        let entry = entry.context("read logs dir entry")?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if let Some(seq) = name
            .split_once('-')
            .and_then(|(prefix, _)| prefix.parse::<u32>().ok())
        {
            highest = highest.max(seq);
        }
    }
    Ok(highest + 1)
}

pub fn write_meta(path: &Path, meta: &InvocationMeta) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create logs dir {}", parent.display()))?;
    }
    let mut buf = serde_json::to_string_pretty(meta)?;
    buf.push('\n');
    fs::write(path, buf).with_context(|| format!("write {}", path.display()))
}
