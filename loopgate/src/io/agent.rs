//! Sub-agent invocation.
//!
//! The [`AgentRunner`] trait decouples orchestration from the actual agent
//! backend (the `claude` CLI by default). Tests use scripted runners that
//! return canned responses without spawning processes.

use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::stream::{StreamLine, decode_line};
use crate::core::tools::ToolProfile;
use crate::io::config::AgentConfig;
use crate::io::interrupt;
use crate::io::process::run_command_streaming;

/// Failures the orchestrator must branch on.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AgentError {
    #[error("agent invocation interrupted")]
    Interrupted,
}

/// Parameters for one sub-agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// Short name used in logs (`build`, `review`, `verification`, `plan`).
    pub label: String,
    pub system_prompt: Option<String>,
    /// Piped to the agent's stdin.
    pub user_prompt: String,
    pub tools: ToolProfile,
    pub workdir: PathBuf,
    /// Where to tee the raw event stream.
    pub stream_log: Option<PathBuf>,
}

/// Abstraction over agent backends.
pub trait AgentRunner {
    /// Run the agent and return its collected response text.
    ///
    /// A non-zero exit is not an error; the text produced so far is returned.
    /// Returns [`AgentError::Interrupted`] when the operator aborted the run.
    fn run(&self, request: &AgentRequest) -> Result<String>;
}

impl<T: AgentRunner + ?Sized> AgentRunner for &T {
    fn run(&self, request: &AgentRequest) -> Result<String> {
        (**self).run(request)
    }
}

/// Runner that spawns the configured agent CLI and parses its stream-json output.
#[derive(Debug, Clone)]
pub struct ClaudeAgent {
    config: AgentConfig,
    /// Echo assistant text to stdout as it arrives.
    echo: bool,
}

impl ClaudeAgent {
    pub fn new(config: AgentConfig) -> Self {
        Self { config, echo: true }
    }

    pub fn quiet(mut self) -> Self {
        self.echo = false;
        self
    }

    fn command(&self, request: &AgentRequest) -> Command {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args);
        if let Some(system) = &request.system_prompt {
            cmd.arg("--system-prompt").arg(system);
        }
        if let Some(allowed) = request.tools.allowed_arg() {
            cmd.arg("--allowedTools").arg(allowed);
        }
        if let Some(disallowed) = request.tools.disallowed_arg() {
            cmd.arg("--disallowedTools").arg(disallowed);
        }
        cmd.current_dir(&request.workdir);
        cmd
    }
}

impl AgentRunner for ClaudeAgent {
    #[instrument(skip_all, fields(label = %request.label, workdir = %request.workdir.display()))]
    fn run(&self, request: &AgentRequest) -> Result<String> {
        info!(command = %self.config.command, "starting agent");
        let cmd = self.command(request);

        let mut fragments: Vec<String> = Vec::new();
        let mut malformed = 0usize;
        let exit = run_command_streaming(
            cmd,
            Some(request.user_prompt.as_bytes()),
            self.config.timeout(),
            request.stream_log.as_deref(),
            &interrupt::requested,
            |line| match decode_line(line) {
                StreamLine::Text(texts) => {
                    for text in texts {
                        if self.echo {
                            println!("{text}");
                        }
                        fragments.push(text);
                    }
                }
                StreamLine::Ignored => {}
                StreamLine::Malformed => malformed += 1,
            },
        )
        .with_context(|| format!("run {} agent", request.label))?;

        if malformed > 0 {
            debug!(malformed, "skipped malformed stream lines");
        }
        if exit.interrupted {
            return Err(AgentError::Interrupted.into());
        }
        if exit.timed_out {
            warn!(
                timeout_secs = self.config.timeout_secs,
                "agent timed out; using partial output"
            );
        } else if let Some(status) = exit.status
            && !status.success()
        {
            warn!(exit_code = ?status.code(), "agent exited with failure");
        }

        debug!(fragments = fragments.len(), "agent finished");
        Ok(fragments.join("\n"))
    }
}

/// Whether `err` is an operator interrupt.
pub fn is_interrupted(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<AgentError>(),
        Some(AgentError::Interrupted)
    )
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;

    fn fake_agent(dir: &std::path::Path, script: &str) -> AgentConfig {
        let path = dir.join("fake-agent.sh");
        fs::write(&path, format!("#!/bin/sh\n{script}\n")).expect("write script");
        AgentConfig {
            command: "sh".to_string(),
            args: vec![path.display().to_string()],
            timeout_secs: 10,
        }
    }

    fn request(dir: &std::path::Path) -> AgentRequest {
        AgentRequest {
            label: "build".to_string(),
            system_prompt: None,
            user_prompt: "do the thing\n".to_string(),
            tools: ToolProfile::reviewer(),
            workdir: dir.to_path_buf(),
            stream_log: Some(dir.join("logs/001-build.jsonl")),
        }
    }

    #[test]
    fn collects_text_and_skips_malformed_lines() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = fake_agent(
            temp.path(),
            r###"cat > /dev/null
echo '{"type":"system","subtype":"init"}'
echo 'not json'
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"first"}]}}'
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"## VERDICT: PASS"}]}}'
exit 2"###,
        );
        let agent = ClaudeAgent::new(config).quiet();
        let text = agent.run(&request(temp.path())).expect("run");
        assert_eq!(text, "first\n## VERDICT: PASS");

        let log = fs::read_to_string(temp.path().join("logs/001-build.jsonl")).expect("log");
        assert_eq!(log.lines().count(), 4);
    }

    #[test]
    fn tool_profile_and_system_prompt_become_flags() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = AgentConfig {
            command: "claude".to_string(),
            args: vec!["--print".to_string()],
            timeout_secs: 1,
        };
        let mut req = request(temp.path());
        req.system_prompt = Some("be strict".to_string());
        let cmd = ClaudeAgent::new(config).command(&req);
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "--print",
                "--system-prompt",
                "be strict",
                "--allowedTools",
                "Read,Glob,Grep,Bash",
                "--disallowedTools",
                "Write,Edit,WebFetch,WebSearch,Task",
            ]
        );
    }

    #[test]
    fn missing_binary_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = AgentConfig {
            command: "loopgate-no-such-agent".to_string(),
            args: Vec::new(),
            timeout_secs: 1,
        };
        let err = ClaudeAgent::new(config)
            .run(&request(temp.path()))
            .unwrap_err();
        assert!(!is_interrupted(&err));
    }
}
