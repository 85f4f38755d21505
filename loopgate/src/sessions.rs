//! Rendering for `loopgate sessions` and `loopgate status`.

use anyhow::Result;

use crate::core::metadata::parse_metadata;
use crate::core::status::resolve_content;
use crate::core::types::Status;
use crate::io::session_store::{SessionStore, SessionSummary};

/// Verdict and progress of one session, as printed by `loopgate status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub id: String,
    pub status: Status,
    pub line: String,
}

pub fn session_status(store: &SessionStore, id: &str) -> Result<StatusReport> {
    let content = store.read(id)?;
    let status = resolve_content(&content);
    let line = match parse_metadata(&content) {
        Some(meta) => {
            let mut line = format!(
                "{id}: {status} (stage: {}, iterations: {}",
                meta.stage, meta.iterations
            );
            if let Some(n) = meta.review_attempts {
                line.push_str(&format!(", review attempts: {n}"));
            }
            if let Some(n) = meta.verification_attempts {
                line.push_str(&format!(", verification attempts: {n}"));
            }
            line.push(')');
            line
        }
        None => format!("{id}: {status} (no metadata)"),
    };
    Ok(StatusReport {
        id: id.to_string(),
        status,
        line,
    })
}

/// One line per session, oldest first.
pub fn render_list(sessions: &[SessionSummary]) -> String {
    if sessions.is_empty() {
        return "No sessions.\n".to_string();
    }
    let width = sessions.iter().map(|s| s.id.len()).max().unwrap_or(0);
    let mut out = String::new();
    for session in sessions {
        let stage = session.stage.map(|s| s.as_str()).unwrap_or("-");
        out.push_str(&format!(
            "{:<width$}  {:<11}  {:<8}  iter {:>3}  {}  {}\n",
            session.id,
            stage,
            session.status.as_str(),
            session.iterations,
            session.created.as_deref().unwrap_or("-"),
            session.working_directory.as_deref().unwrap_or("-"),
        ));
    }
    out
}

/// Remove every session. Returns how many were deleted.
pub fn clean(store: &SessionStore) -> Result<usize> {
    let removed = store.delete_all()?;
    println!("Removed {removed} session(s) from {}", store.dir().display());
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::metadata::MetadataPatch;
    use crate::test_support::TestSessions;

    #[test]
    fn status_line_reports_stage_and_counters() {
        let sessions = TestSessions::new();
        let id = sessions.planned("Ship it");
        sessions
            .store
            .update_metadata(
                &id,
                &MetadataPatch {
                    iterations: Some(4),
                    verification_attempts: Some(2),
                    ..MetadataPatch::default()
                },
            )
            .expect("update");

        let report = session_status(&sessions.store, &id).expect("status");
        assert_eq!(report.status, Status::Continue);
        assert_eq!(
            report.line,
            format!("{id}: continue (stage: planned, iterations: 4, verification attempts: 2)")
        );

        let fresh = sessions.create("Fresh");
        assert_eq!(
            session_status(&sessions.store, &fresh).expect("status").line,
            format!("{fresh}: continue (stage: initialized, iterations: 0)")
        );
    }

    #[test]
    fn list_renders_one_row_per_session() {
        let sessions = TestSessions::new();
        assert_eq!(render_list(&[]), "No sessions.\n");

        let first = sessions.create("one");
        let second = sessions.planned("two");
        let rendered = render_list(&sessions.store.list().expect("list"));
        let rows: Vec<&str> = rendered.lines().collect();
        assert_eq!(rows.len(), 2);
        assert!(rendered.contains(&first));
        assert!(rendered.contains(&second));
        assert!(rendered.contains("planned"));
        assert!(rendered.contains("initialized"));
    }

    #[test]
    fn clean_removes_everything() {
        let sessions = TestSessions::new();
        sessions.create("one");
        sessions.create("two");
        assert_eq!(clean(&sessions.store).expect("clean"), 2);
        assert!(sessions.store.list().expect("list").is_empty());
    }
}
