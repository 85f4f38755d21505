//! Test-only fakes and fixtures: a scripted agent, a recording server
//! lifecycle, and throwaway session stores.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::core::metadata::MetadataPatch;
use crate::core::sections::replace_status_marker;
use crate::core::types::Stage;
use crate::io::agent::{AgentError, AgentRequest, AgentRunner};
use crate::io::server::{ServerHandle, ServerLifecycle};
use crate::io::session_store::SessionStore;

pub const BROWSER_VERIFICATION: &str =
    "mode: browser\nentry: http://127.0.0.1:3000\nstart: npm run dev\nstop: docker compose down\n";

const PLAN: &str = "## Status: IN_PROGRESS\n\n## Completed\n\n(none yet)\n\n## Remaining\n\n- [ ] build it\n- [ ] test it\n";

type Edit = Box<dyn FnOnce(&str) -> String>;

enum Step {
    Respond { text: String, edit: Option<Edit> },
    Interrupt { edit: Option<Edit> },
    Fail(String),
}

/// Agent that replays a queue of canned steps and records every request.
///
/// Steps may edit the session file the way a real build agent would. Running
/// out of steps is an error so tests notice unexpected invocations.
pub struct ScriptedAgent {
    session: PathBuf,
    steps: RefCell<VecDeque<Step>>,
    requests: RefCell<Vec<AgentRequest>>,
}

impl ScriptedAgent {
    pub fn new(session: PathBuf) -> Self {
        Self {
            session,
            steps: RefCell::new(VecDeque::new()),
            requests: RefCell::new(Vec::new()),
        }
    }

    pub fn respond(self, text: &str) -> Self {
        self.push(Step::Respond {
            text: text.to_string(),
            edit: None,
        })
    }

    pub fn respond_with_edit(
        self,
        text: &str,
        edit: impl FnOnce(&str) -> String + 'static,
    ) -> Self {
        self.push(Step::Respond {
            text: text.to_string(),
            edit: Some(Box::new(edit)),
        })
    }

    /// Build iteration that records progress and keeps going.
    pub fn progress(self, note: &str) -> Self {
        let line = format!("- {note}");
        self.respond_with_edit(note, move |content| {
            set_status(&append_line(content, &line), "IN_PROGRESS")
        })
    }

    /// Build iteration that claims the task is done.
    pub fn claim_done(self) -> Self {
        self.respond_with_edit("All done.", |content| set_status(content, "DONE"))
    }

    /// Build iteration that declares itself blocked.
    pub fn claim_blocked(self) -> Self {
        self.respond_with_edit("Need credentials.", |content| set_status(content, "BLOCKED"))
    }

    pub fn pass(self) -> Self {
        self.respond("Checked everything.\n## VERDICT: PASS")
    }

    pub fn fail(self, feedback: &str) -> Self {
        self.respond(&format!("{feedback}\n## VERDICT: FAIL"))
    }

    /// Invocation aborted by the operator.
    pub fn interrupt(self) -> Self {
        self.push(Step::Interrupt { edit: None })
    }

    /// Interrupted after the agent already touched the session.
    pub fn interrupt_with_edit(self, edit: impl FnOnce(&str) -> String + 'static) -> Self {
        self.push(Step::Interrupt {
            edit: Some(Box::new(edit)),
        })
    }

    /// Invocation that fails outright (e.g. the binary is missing).
    pub fn error(self, message: &str) -> Self {
        self.push(Step::Fail(message.to_string()))
    }

    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests.borrow().clone()
    }

    /// Labels of every invocation so far, in order.
    pub fn labels(&self) -> Vec<String> {
        self.requests
            .borrow()
            .iter()
            .map(|r| r.label.clone())
            .collect()
    }

    pub fn remaining(&self) -> usize {
        self.steps.borrow().len()
    }

    fn push(self, step: Step) -> Self {
        self.steps.borrow_mut().push_back(step);
        self
    }

    fn apply(&self, edit: Option<Edit>) -> Result<()> {
        let Some(edit) = edit else {
            return Ok(());
        };
        let content = fs::read_to_string(&self.session)
            .with_context(|| format!("read {}", self.session.display()))?;
        fs::write(&self.session, edit(&content))
            .with_context(|| format!("write {}", self.session.display()))
    }
}

impl AgentRunner for ScriptedAgent {
    fn run(&self, request: &AgentRequest) -> Result<String> {
        self.requests.borrow_mut().push(request.clone());
        let step = self
            .steps
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted agent has no step left for '{}'", request.label))?;
        match step {
            Step::Respond { text, edit } => {
                self.apply(edit)?;
                Ok(text)
            }
            Step::Interrupt { edit } => {
                self.apply(edit)?;
                Err(AgentError::Interrupted.into())
            }
            Step::Fail(message) => Err(anyhow!(message)),
        }
    }
}

/// Replace the `## Status:` line, or append one.
pub fn set_status(content: &str, status: &str) -> String {
    replace_status_marker(content, status)
        .unwrap_or_else(|| append_line(content, &format!("## Status: {status}")))
}

fn append_line(content: &str, line: &str) -> String {
    format!("{}\n{line}\n", content.trim_end())
}

/// What a [`RecordingServers`] was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Start(String),
    WaitForReady(String),
    Stop(u32),
    StopCommand(String),
}

/// Server lifecycle fake that records calls instead of spawning processes.
pub struct RecordingServers {
    ready: bool,
    start_fails: bool,
    events: RefCell<Vec<ServerEvent>>,
}

impl RecordingServers {
    pub fn ready() -> Self {
        Self {
            ready: true,
            start_fails: false,
            events: RefCell::new(Vec::new()),
        }
    }

    pub fn never_ready() -> Self {
        Self {
            ready: false,
            ..Self::ready()
        }
    }

    pub fn failing_start() -> Self {
        Self {
            start_fails: true,
            ..Self::ready()
        }
    }

    pub fn events(&self) -> Vec<ServerEvent> {
        self.events.borrow().clone()
    }

    pub fn count(&self, matches: impl Fn(&ServerEvent) -> bool) -> usize {
        self.events.borrow().iter().filter(|e| matches(e)).count()
    }
}

impl ServerLifecycle for RecordingServers {
    fn start(&self, command: &str, _cwd: &Path) -> Result<ServerHandle> {
        self.events
            .borrow_mut()
            .push(ServerEvent::Start(command.to_string()));
        if self.start_fails {
            return Err(anyhow!("spawn {command}: not found"));
        }
        Ok(ServerHandle::detached(4242, true))
    }

    fn wait_for_ready(&self, url: &str, _timeout: Duration) -> bool {
        self.events
            .borrow_mut()
            .push(ServerEvent::WaitForReady(url.to_string()));
        self.ready
    }

    fn stop(&self, handle: ServerHandle) {
        self.events.borrow_mut().push(ServerEvent::Stop(handle.pid()));
    }

    fn run_stop_command(&self, command: &str, _cwd: &Path) {
        self.events
            .borrow_mut()
            .push(ServerEvent::StopCommand(command.to_string()));
    }
}

/// A session store and working directory in a temp dir.
pub struct TestSessions {
    _temp: TempDir,
    pub store: SessionStore,
    workdir: PathBuf,
}

impl Default for TestSessions {
    fn default() -> Self {
        Self::new()
    }
}

impl TestSessions {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let workdir = temp.path().join("work");
        fs::create_dir_all(&workdir).expect("create workdir");
        Self {
            store: SessionStore::new(temp.path().join("sessions")),
            workdir,
            _temp: temp,
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Fresh session at `stage: initialized`.
    pub fn create(&self, task: &str) -> String {
        self.store
            .create(task, None, &self.workdir)
            .expect("create session")
    }

    /// Session with a plan and no Verification section, at `stage: planned`.
    pub fn planned(&self, task: &str) -> String {
        self.planned_doc(task, None)
    }

    pub fn planned_with_verification(&self, task: &str, verification: &str) -> String {
        self.planned_doc(task, Some(verification))
    }

    fn planned_doc(&self, task: &str, verification: Option<&str>) -> String {
        let id = self.create(task);
        let mut content = self.store.read(&id).expect("read");
        content = format!("{}\n\n{PLAN}", content.trim_end());
        if let Some(verification) = verification {
            content = format!("{}\n\n## Verification\n\n{verification}", content.trim_end());
            content.push('\n');
        }
        self.store.write(&id, &content).expect("write");
        self.store
            .update_metadata(&id, &MetadataPatch::stage(Stage::Planned))
            .expect("plan");
        id
    }
}
