//! Tri-state status resolution for a session document.

use crate::core::metadata::parse_metadata;
use crate::core::sections::status_marker;
use crate::core::types::{Stage, Status};

/// Resolve `continue` / `done` / `blocked` from persisted session content.
///
/// The machine-owned `stage` wins: `done` and `blocked` stages are final
/// regardless of the body. Only for any other stage is the human-writable
/// `Status:` marker consulted, so an agent editing free text can claim
/// completion (triggering the done-gate) but can never mark a session done.
pub fn resolve_content(content: &str) -> Status {
    if let Some(meta) = parse_metadata(content) {
        match meta.stage {
            Stage::Done => return Status::Done,
            Stage::Blocked => return Status::Blocked,
            _ => {}
        }
    }
    match status_marker(content).as_deref() {
        Some("DONE") => Status::Done,
        Some("BLOCKED") => Status::Blocked,
        _ => Status::Continue,
    }
}

/// Resolve a possibly-missing session: a session that does not exist yet is a fresh task.
pub fn resolve(content: Option<&str>) -> Status {
    content.map(resolve_content).unwrap_or(Status::Continue)
}
