//! Header-delimited section access for the session body.
//!
//! A section starts at a markdown header and runs until the next header of
//! equal or higher level. Lines inside fenced code blocks are never headers.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::metadata::body;
use crate::core::types::GateKind;

pub const TASK: &str = "Task";
pub const COMPLETED: &str = "Completed";
pub const REMAINING: &str = "Remaining";
pub const VERIFICATION: &str = "Verification";
pub const OPERATOR_NOTES: &str = "Operator Notes";

static STATUS_MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^#{1,6}[ \t]*Status:[ \t]*(.+?)[ \t]*$").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
struct Header<'a> {
    level: usize,
    title: &'a str,
    /// Byte offset of the header line start.
    start: usize,
    /// Byte offset just past the header line (including its newline).
    body_start: usize,
}

fn headers(doc: &str) -> Vec<Header<'_>> {
    let mut found = Vec::new();
    let mut in_fence = false;
    let mut offset = 0;
    for line in doc.split_inclusive('\n') {
        let start = offset;
        offset += line.len();
        let trimmed = line.trim_end();
        if trimmed.trim_start().starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        let level = trimmed.chars().take_while(|c| *c == '#').count();
        if level == 0 || level > 6 {
            continue;
        }
        let rest = &trimmed[level..];
        if !rest.is_empty() && !rest.starts_with([' ', '\t']) {
            continue;
        }
        found.push(Header {
            level,
            title: rest.trim(),
            start,
            body_start: offset,
        });
    }
    found
}

/// Body of the first section whose header title equals `name` (case-insensitive).
///
/// Returns the text between the header line and the next header of equal or
/// higher level, trimmed.
pub fn section<'a>(content: &'a str, name: &str) -> Option<&'a str> {
    let doc = body(content);
    let all = headers(doc);
    let idx = all
        .iter()
        .position(|h| h.title.eq_ignore_ascii_case(name))?;
    let header = &all[idx];
    let end = all[idx + 1..]
        .iter()
        .find(|h| h.level <= header.level)
        .map(|h| h.start)
        .unwrap_or(doc.len());
    Some(doc[header.body_start..end].trim())
}

pub fn has_section(content: &str, name: &str) -> bool {
    section(content, name).is_some()
}

/// Human-writable `Status: DONE|BLOCKED|...` header, upper-cased.
///
/// This marker is informational; the machine-owned `stage` takes precedence.
pub fn status_marker(content: &str) -> Option<String> {
    STATUS_MARKER_RE
        .captures(body(content))
        .map(|caps| caps[1].trim().to_ascii_uppercase())
}

/// Rewrite the value of the first `Status:` header. `None` if there is none.
pub fn replace_status_marker(content: &str, value: &str) -> Option<String> {
    let caps = STATUS_MARKER_RE.captures(content)?;
    let current = caps.get(1)?;
    Some(format!(
        "{}{value}{}",
        &content[..current.start()],
        &content[current.end()..]
    ))
}

/// Task context handed to the gate sub-agents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSummary {
    pub task: String,
    pub completed: String,
}

pub fn task_summary(content: &str) -> TaskSummary {
    TaskSummary {
        task: section(content, TASK).unwrap_or_default().to_string(),
        completed: section(content, COMPLETED).unwrap_or_default().to_string(),
    }
}

/// How the verifier reaches the application under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationMode {
    Browser,
    Cli,
}

impl VerificationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            VerificationMode::Browser => "browser",
            VerificationMode::Cli => "cli",
        }
    }
}

/// Parsed `## Verification` section for a session whose mode is not `none`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationSpec {
    pub mode: VerificationMode,
    /// URL for `browser`, comma-separated command prefixes for `cli`.
    pub entry: String,
    pub start: Option<String>,
    pub stop: Option<String>,
    /// Readiness URL; browser mode falls back to `entry`.
    pub ready: Option<String>,
}

impl VerificationSpec {
    /// Allowed command prefixes in `cli` mode.
    pub fn command_prefixes(&self) -> Vec<String> {
        self.entry
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// URL to poll for readiness after starting the server, if any.
    pub fn readiness_url(&self) -> Option<&str> {
        if let Some(ready) = self.ready.as_deref() {
            return Some(ready);
        }
        match self.mode {
            VerificationMode::Browser => Some(self.entry.as_str()),
            VerificationMode::Cli => None,
        }
    }
}

/// Parse the Verification section.
///
/// `Ok(None)` means verification is skipped: the section is absent, has no
/// `mode`, or declares `mode: none`.
pub fn verification_spec(content: &str) -> Result<Option<VerificationSpec>, String> {
    let Some(text) = section(content, VERIFICATION) else {
        return Ok(None);
    };

    let mut mode = None;
    let mut entry = None;
    let mut start = None;
    let mut stop = None;
    let mut ready = None;
    for line in text.lines() {
        let Some((key, value)) = field(line) else {
            continue;
        };
        let slot = match key.as_str() {
            "mode" => &mut mode,
            "entry" => &mut entry,
            "start" => &mut start,
            "stop" => &mut stop,
            "ready" => &mut ready,
            _ => continue,
        };
        if slot.is_none() && !value.is_empty() {
            *slot = Some(value);
        }
    }

    let mode = match mode.as_deref().map(str::to_ascii_lowercase).as_deref() {
        None | Some("none") => return Ok(None),
        Some("browser") => VerificationMode::Browser,
        Some("cli") => VerificationMode::Cli,
        Some(other) => return Err(format!("unknown verification mode '{other}'")),
    };
    let entry = entry.ok_or_else(|| format!("verification mode '{}' requires an entry", mode.as_str()))?;

    let spec = VerificationSpec {
        mode,
        entry,
        start,
        stop,
        ready,
    };
    match spec.mode {
        VerificationMode::Browser if !is_http_url(&spec.entry) => {
            return Err(format!(
                "browser verification entry must be an http(s) URL (got '{}')",
                spec.entry
            ));
        }
        VerificationMode::Cli if spec.command_prefixes().is_empty() => {
            return Err("cli verification entry must list at least one command prefix".to_string());
        }
        _ => {}
    }
    if let Some(ready) = spec.ready.as_deref()
        && !is_http_url(ready)
    {
        return Err(format!("verification ready must be an http(s) URL (got '{ready}')"));
    }
    Ok(Some(spec))
}

/// Split a `key: value` line, tolerating list bullets, bold keys and backticks.
fn field(line: &str) -> Option<(String, String)> {
    let line = line
        .trim()
        .trim_start_matches(['-', '*', '+'])
        .trim_start();
    let (key, value) = line.split_once(':')?;
    let key = key.trim().trim_matches(['*', '_', '`']).trim().to_ascii_lowercase();
    if key.is_empty() || key.contains(' ') {
        return None;
    }
    let value = value.trim().trim_matches('`').trim().to_string();
    Some((key, value))
}

fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

/// Append a failed gate attempt's feedback to the end of the document.
///
/// The feedback is block-quoted so headers inside agent output never become
/// session sections.
pub fn append_feedback(content: &str, kind: GateKind, attempt: u32, feedback: &str) -> String {
    let heading = format!("{} (attempt {attempt})", kind.feedback_heading());
    append_block(content, &heading, &quote(feedback))
}

/// Append an operator note under the `Operator Notes` heading.
pub fn append_operator_note(content: &str, note: &str) -> String {
    append_block(content, OPERATOR_NOTES, note.trim())
}

fn append_block(content: &str, heading: &str, text: &str) -> String {
    let mut buf = content.trim_end().to_string();
    buf.push_str("\n\n## ");
    buf.push_str(heading);
    buf.push_str("\n\n");
    buf.push_str(text);
    buf.push('\n');
    buf
}

fn quote(text: &str) -> String {
    let text = text.trim();
    if text.is_empty() {
        return "> (no output)".to_string();
    }
    text.lines()
        .map(|line| {
            if line.is_empty() {
                ">".to_string()
            } else {
                format!("> {line}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}
