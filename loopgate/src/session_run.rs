//! State shared by the orchestrator and the gate stages during one
//! `run`/`resume` invocation.
//!
//! [`SessionRun`] is the only writer of the session's metadata block while a
//! run is active. It remembers the metadata it last wrote and re-asserts it
//! after every sub-agent invocation.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Result;
use chrono::{SecondsFormat, Utc};
use tracing::{debug, instrument, warn};

use crate::core::immutability::restore_metadata;
use crate::core::metadata::{Metadata, MetadataPatch, parse_metadata};
use crate::core::tools::ToolProfile;
use crate::io::agent::{AgentRequest, AgentRunner, is_interrupted};
use crate::io::config::RunnerConfig;
use crate::io::iteration_log::{InvocationMeta, InvocationPaths, next_sequence, write_meta};
use crate::io::prompt::PromptEngine;
use crate::io::session_store::SessionStore;

/// One sub-agent call as seen by [`SessionRun::invoke`].
#[derive(Debug, Clone)]
pub struct Invocation {
    pub label: &'static str,
    pub system_prompt: Option<String>,
    pub user_prompt: String,
    pub tools: ToolProfile,
    pub attempt: Option<u32>,
}

pub struct SessionRun<'a, A: AgentRunner> {
    store: &'a SessionStore,
    id: String,
    agent: A,
    config: &'a RunnerConfig,
    workdir: PathBuf,
    prompts: PromptEngine,
    /// Metadata as last written by this run.
    expected: Metadata,
    next_seq: u32,
}

impl<'a, A: AgentRunner> SessionRun<'a, A> {
    pub fn open(
        store: &'a SessionStore,
        id: &str,
        agent: A,
        config: &'a RunnerConfig,
        workdir: &Path,
    ) -> Result<Self> {
        let content = store.read(id)?;
        let expected = parse_metadata(&content).unwrap_or_default();
        let next_seq = next_sequence(&store.logs_dir(id))?;
        Ok(Self {
            store,
            id: id.to_string(),
            agent,
            config,
            workdir: workdir.to_path_buf(),
            prompts: PromptEngine::new(),
            expected,
            next_seq,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &RunnerConfig {
        self.config
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn session_path(&self) -> PathBuf {
        self.store.path(&self.id)
    }

    pub fn prompts(&self) -> &PromptEngine {
        &self.prompts
    }

    pub fn metadata(&self) -> Metadata {
        self.expected
    }

    pub fn read(&self) -> Result<String> {
        self.store.read(&self.id)
    }

    /// Merge `patch` into the metadata block and persist it.
    pub fn update(&mut self, patch: &MetadataPatch) -> Result<Metadata> {
        let meta = self.store.update_metadata(&self.id, patch)?;
        debug!(stage = %meta.stage, iterations = meta.iterations, "metadata updated");
        self.expected = meta;
        Ok(meta)
    }

    /// Persist exactly `meta`, clearing counters it does not carry.
    pub fn set_metadata(&mut self, meta: Metadata) -> Result<()> {
        let content = self.read()?;
        let restored = restore_metadata(&content, &meta);
        self.store.write(&self.id, &restored.content)?;
        self.expected = meta;
        Ok(())
    }

    /// Rewrite the session body; the metadata block is kept as last written.
    pub fn edit_body(&mut self, edit: impl FnOnce(&str) -> String) -> Result<()> {
        let content = self.read()?;
        let restored = restore_metadata(&edit(&content), &self.expected);
        self.store.write(&self.id, &restored.content)
    }

    /// Run a sub-agent and return its collected text.
    ///
    /// The raw event stream and an outcome record land in the session's log
    /// directory. Afterwards the metadata block is restored to what this run
    /// last wrote, whatever the agent did to it, even when the agent failed.
    #[instrument(skip_all, fields(id = %self.id, label = invocation.label))]
    pub fn invoke(&mut self, invocation: Invocation) -> Result<String> {
        let seq = self.next_seq;
        self.next_seq += 1;
        let paths = InvocationPaths::new(&self.store.logs_dir(&self.id), seq, invocation.label);
        let request = AgentRequest {
            label: invocation.label.to_string(),
            system_prompt: invocation.system_prompt,
            user_prompt: invocation.user_prompt,
            tools: invocation.tools,
            workdir: self.workdir.clone(),
            stream_log: Some(paths.stream_path.clone()),
        };

        let started_at = timestamp();
        let clock = Instant::now();
        let result = self.agent.run(&request);
        let outcome = match &result {
            Ok(_) => "ok",
            Err(err) if is_interrupted(err) => "interrupted",
            Err(_) => "error",
        };
        let meta = InvocationMeta {
            seq,
            label: request.label,
            iteration: self.expected.iterations,
            attempt: invocation.attempt,
            started_at,
            ended_at: timestamp(),
            duration_ms: u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX),
            outcome: outcome.to_string(),
        };
        if let Err(err) = write_meta(&paths.meta_path, &meta) {
            warn!(err = %format!("{err:#}"), "failed to write invocation record");
        }

        self.enforce_metadata()?;
        result
    }

    fn enforce_metadata(&mut self) -> Result<()> {
        let content = self.read()?;
        let restored = restore_metadata(&content, &self.expected);
        if !restored.violations.is_empty() {
            warn!(
                violations = ?restored.violations,
                "sub-agent edited the session metadata; restored"
            );
        }
        if restored.content != content {
            self.store.write(&self.id, &restored.content)?;
        }
        Ok(())
    }
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Stage;
    use crate::test_support::{ScriptedAgent, TestSessions};

    #[test]
    fn agent_edits_to_metadata_are_reverted() {
        let sessions = TestSessions::new();
        let id = sessions.planned("Ship it");
        let config = RunnerConfig::default();
        let agent = ScriptedAgent::new(sessions.store.path(&id)).respond_with_edit("ok", |content| {
            content.replace("stage: planned", "stage: done") + "\n## Completed\n\n- step one\n"
        });

        let mut run =
            SessionRun::open(&sessions.store, &id, &agent, &config, sessions.workdir()).expect("open");
        run.invoke(Invocation {
            label: "build",
            system_prompt: None,
            user_prompt: "go".to_string(),
            tools: ToolProfile::build(),
            attempt: None,
        })
        .expect("invoke");

        let content = sessions.store.read(&id).expect("read");
        let meta = parse_metadata(&content).expect("metadata");
        assert_eq!(meta.stage, Stage::Planned);
        assert!(content.contains("- step one"));
    }

    #[test]
    fn invocation_record_is_written_per_call() {
        let sessions = TestSessions::new();
        let id = sessions.planned("Ship it");
        let config = RunnerConfig::default();
        let agent = ScriptedAgent::new(sessions.store.path(&id)).respond("one").respond("two");
        let mut run =
            SessionRun::open(&sessions.store, &id, &agent, &config, sessions.workdir()).expect("open");
        for label in ["build", "review"] {
            run.invoke(Invocation {
                label,
                system_prompt: None,
                user_prompt: String::new(),
                tools: ToolProfile::build(),
                attempt: None,
            })
            .expect("invoke");
        }
        let logs = sessions.store.logs_dir(&id);
        assert!(logs.join("001-build.meta.json").exists());
        assert!(logs.join("002-review.meta.json").exists());

        let requests = agent.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(
            requests[1].stream_log.as_deref(),
            Some(logs.join("002-review.jsonl").as_path())
        );
    }

    #[test]
    fn set_metadata_can_clear_a_counter() {
        let sessions = TestSessions::new();
        let id = sessions.planned("Ship it");
        let config = RunnerConfig::default();
        let agent = ScriptedAgent::new(sessions.store.path(&id));
        let mut run =
            SessionRun::open(&sessions.store, &id, &agent, &config, sessions.workdir()).expect("open");
        run.update(&MetadataPatch {
            review_attempts: Some(1),
            ..MetadataPatch::default()
        })
        .expect("update");
        let mut meta = run.metadata();
        meta.review_attempts = None;
        run.set_metadata(meta).expect("set");

        let content = sessions.store.read(&id).expect("read");
        assert!(!content.contains("reviewAttempts"));
        assert_eq!(parse_metadata(&content), Some(meta));
    }
}
