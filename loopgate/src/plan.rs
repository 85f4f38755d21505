//! `loopgate plan`: let the build agent turn a task into a checklist.

use std::path::Path;

use anyhow::{Result, bail};
use tracing::{instrument, warn};

use crate::core::metadata::{Metadata, MetadataPatch};
use crate::core::sections::{REMAINING, has_section, verification_spec};
use crate::core::tools::ToolProfile;
use crate::core::types::Stage;
use crate::io::agent::AgentRunner;
use crate::io::config::RunnerConfig;
use crate::io::session_store::SessionStore;
use crate::session_run::{Invocation, SessionRun};

/// Plan session `id` and move it to `stage: planned`.
///
/// Only `initialized` and `planned` sessions can be (re)planned. The agent
/// must leave a `Remaining` section behind.
#[instrument(skip_all, fields(id = %id))]
pub fn plan_session<A: AgentRunner>(
    store: &SessionStore,
    id: &str,
    agent: A,
    config: &RunnerConfig,
    workdir: &Path,
) -> Result<Metadata> {
    let mut run = SessionRun::open(store, id, agent, config, workdir)?;
    let stage = run.metadata().stage;
    if !matches!(stage, Stage::Initialized | Stage::Planned) {
        bail!("session '{id}' is already {stage}; use `loopgate resume {id}` instead");
    }

    println!("Planning session {id}...");
    let prompts = run.prompts().render_plan(workdir, &run.session_path())?;
    run.invoke(Invocation {
        label: "plan",
        system_prompt: Some(prompts.system),
        user_prompt: prompts.user,
        tools: ToolProfile::build(),
        attempt: None,
    })?;

    let content = run.read()?;
    if !has_section(&content, REMAINING) {
        bail!(
            "planning did not produce a '## {REMAINING}' section in {}",
            run.session_path().display()
        );
    }
    if let Err(err) = verification_spec(&content) {
        warn!(%err, "planned session has an invalid Verification section");
        println!("Warning: invalid Verification section ({err}); fix it before `loopgate run`.");
    }

    let meta = run.update(&MetadataPatch::stage(Stage::Planned))?;
    println!("Session {id} planned. Next: loopgate run {id}");
    Ok(meta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::metadata::parse_metadata;
    use crate::test_support::{ScriptedAgent, TestSessions};

    const CHECKLIST: &str = "\n## Status: IN_PROGRESS\n\n## Completed\n\n## Remaining\n\n- [ ] write the parser\n\n## Verification\n\nmode: cli\nentry: cargo\n";

    #[test]
    fn plan_moves_session_to_planned() {
        let sessions = TestSessions::new();
        let id = sessions.create("Build a parser");
        let agent = ScriptedAgent::new(sessions.store.path(&id))
            .respond_with_edit("Planned.", |content| {
                format!("{}\n{CHECKLIST}", content.trim_end()).replace("stage: initialized", "stage: done")
            });

        let meta = plan_session(
            &sessions.store,
            &id,
            &agent,
            &RunnerConfig::default(),
            sessions.workdir(),
        )
        .expect("plan");

        assert_eq!(meta.stage, Stage::Planned);
        let content = sessions.store.read(&id).expect("read");
        assert_eq!(parse_metadata(&content).map(|m| m.stage), Some(Stage::Planned));
        assert!(content.contains("- [ ] write the parser"));

        let request = &agent.requests()[0];
        assert_eq!(request.label, "plan");
        assert_eq!(request.tools, ToolProfile::build());
        assert!(request.system_prompt.is_some());
    }

    #[test]
    fn plan_without_remaining_section_fails() {
        let sessions = TestSessions::new();
        let id = sessions.create("Build a parser");
        let agent = ScriptedAgent::new(sessions.store.path(&id)).respond("I could not plan this.");
        let err = plan_session(
            &sessions.store,
            &id,
            &agent,
            &RunnerConfig::default(),
            sessions.workdir(),
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("Remaining"));
        let content = sessions.store.read(&id).expect("read");
        assert_eq!(
            parse_metadata(&content).map(|m| m.stage),
            Some(Stage::Initialized)
        );
    }

    #[test]
    fn running_session_is_not_replanned() {
        let sessions = TestSessions::new();
        let id = sessions.planned("Build a parser");
        sessions
            .store
            .update_metadata(&id, &MetadataPatch::stage(Stage::Running))
            .expect("run");
        let agent = ScriptedAgent::new(sessions.store.path(&id));
        let err = plan_session(
            &sessions.store,
            &id,
            &agent,
            &RunnerConfig::default(),
            sessions.workdir(),
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("already running"));
        assert!(agent.requests().is_empty());
    }
}
