//! The machine-owned metadata block at the top of a session document.
//!
//! The block is YAML-style frontmatter holding flat `key: value` pairs:
//!
//! ```text
//! ---
//! stage: running
//! iterations: 3
//! reviewAttempts: 1
//! ---
//! ```
//!
//! Only the orchestrator writes it. Keys this module does not know about are
//! preserved verbatim on update.

use tracing::debug;

use crate::core::types::Stage;

const KEY_STAGE: &str = "stage";
const KEY_ITERATIONS: &str = "iterations";
const KEY_REVIEW_ATTEMPTS: &str = "reviewAttempts";
const KEY_VERIFICATION_ATTEMPTS: &str = "verificationAttempts";

/// Parsed metadata block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Metadata {
    pub stage: Stage,
    pub iterations: u32,
    /// Absent until the review gate first runs.
    pub review_attempts: Option<u32>,
    /// Absent until the verification gate first runs.
    pub verification_attempts: Option<u32>,
}

/// Partial update for [`update_metadata`]. `None` fields keep their current value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetadataPatch {
    pub stage: Option<Stage>,
    pub iterations: Option<u32>,
    pub review_attempts: Option<u32>,
    pub verification_attempts: Option<u32>,
}

impl MetadataPatch {
    pub fn stage(stage: Stage) -> Self {
        Self {
            stage: Some(stage),
            ..Self::default()
        }
    }

    pub fn apply(&self, base: Metadata) -> Metadata {
        Metadata {
            stage: self.stage.unwrap_or(base.stage),
            iterations: self.iterations.unwrap_or(base.iterations),
            review_attempts: self.review_attempts.or(base.review_attempts),
            verification_attempts: self.verification_attempts.or(base.verification_attempts),
        }
    }

    /// Patch that rewrites every field to `meta`'s values.
    pub fn from_metadata(meta: &Metadata) -> Self {
        Self {
            stage: Some(meta.stage),
            iterations: Some(meta.iterations),
            review_attempts: meta.review_attempts,
            verification_attempts: meta.verification_attempts,
        }
    }
}

/// Parse the metadata block, or `None` if the document has none.
///
/// Unparseable values fall back to their defaults rather than failing: the
/// block is read on every iteration and a bad value must not wedge a session.
pub fn parse_metadata(content: &str) -> Option<Metadata> {
    let (block, _) = split_block(content)?;
    let mut meta = Metadata::default();
    for line in block.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Some((key, value)) = trimmed.split_once(':') else {
            continue;
        };
        let value = unquote(value.trim());
        match key.trim() {
            KEY_STAGE => match value.parse::<Stage>() {
                Ok(stage) => meta.stage = stage,
                Err(err) => debug!(%err, "ignoring unparseable stage"),
            },
            KEY_ITERATIONS => meta.iterations = value.parse().unwrap_or(0),
            KEY_REVIEW_ATTEMPTS => meta.review_attempts = value.parse().ok(),
            KEY_VERIFICATION_ATTEMPTS => meta.verification_attempts = value.parse().ok(),
            _ => {}
        }
    }
    Some(meta)
}

/// Merge `patch` into the document's metadata block.
///
/// When no block exists one is synthesized from [`Metadata::default`].
pub fn update_metadata(content: &str, patch: &MetadataPatch) -> String {
    update_metadata_with(content, patch, Metadata::default())
}

/// Like [`update_metadata`], but synthesizes a missing block from `defaults`.
pub fn update_metadata_with(content: &str, patch: &MetadataPatch, defaults: Metadata) -> String {
    match split_block(content) {
        Some((block, rest)) => {
            let current = parse_metadata(content).unwrap_or(defaults);
            let merged = patch.apply(current);
            render(&upsert_lines(block, &merged), rest)
        }
        None => {
            let merged = patch.apply(defaults);
            render(&upsert_lines("", &merged), content)
        }
    }
}

/// The document with its metadata block removed.
pub fn body(content: &str) -> &str {
    match split_block(content) {
        Some((_, rest)) => rest,
        None => content,
    }
}

fn unquote(value: &str) -> &str {
    if value.len() >= 2
        && ((value.starts_with('"') && value.ends_with('"'))
            || (value.starts_with('\'') && value.ends_with('\'')))
    {
        return &value[1..value.len() - 1];
    }
    value
}

fn known_pairs(meta: &Metadata) -> Vec<(&'static str, Option<String>)> {
    vec![
        (KEY_STAGE, Some(meta.stage.as_str().to_string())),
        (KEY_ITERATIONS, Some(meta.iterations.to_string())),
        (KEY_REVIEW_ATTEMPTS, meta.review_attempts.map(|n| n.to_string())),
        (
            KEY_VERIFICATION_ATTEMPTS,
            meta.verification_attempts.map(|n| n.to_string()),
        ),
    ]
}

/// Rewrite known keys in place, keep unknown lines, append known keys that were missing.
fn upsert_lines(block: &str, meta: &Metadata) -> String {
    let pairs = known_pairs(meta);
    let mut written = vec![false; pairs.len()];
    let mut lines = Vec::new();

    for line in block.lines() {
        let key = line.split_once(':').map(|(k, _)| k.trim());
        let Some(idx) = key.and_then(|k| pairs.iter().position(|(name, _)| *name == k)) else {
            lines.push(line.to_string());
            continue;
        };
        if written[idx] {
            continue;
        }
        written[idx] = true;
        if let Some(value) = &pairs[idx].1 {
            lines.push(format!("{}: {value}", pairs[idx].0));
        }
    }

    for (idx, (name, value)) in pairs.iter().enumerate() {
        if written[idx] {
            continue;
        }
        if let Some(value) = value {
            lines.push(format!("{name}: {value}"));
        }
    }

    lines.join("\n")
}

fn render(block: &str, rest: &str) -> String {
    let mut buf = String::new();
    buf.push_str("---\n");
    buf.push_str(block.trim_end());
    buf.push('\n');
    buf.push_str("---\n\n");
    buf.push_str(rest.trim_start_matches('\n'));
    if !buf.ends_with('\n') {
        buf.push('\n');
    }
    buf
}

/// Split a document into (block, rest). Returns None if it doesn't start with a block.
///
/// Delimiter lines may end in `\n` or `\r\n`.
fn split_block(contents: &str) -> Option<(&str, &str)> {
    let after = contents
        .strip_prefix("---\n")
        .or_else(|| contents.strip_prefix("---\r\n"))?;
    let mut offset = 0;
    for line in after.split_inclusive('\n') {
        if line.trim_end_matches(['\n', '\r']) == "---" {
            let block = after[..offset]
                .strip_suffix('\n')
                .map(|b| b.strip_suffix('\r').unwrap_or(b))
                .unwrap_or(&after[..offset]);
            return Some((block, &after[offset + line.len()..]));
        }
        offset += line.len();
    }
    None
}
