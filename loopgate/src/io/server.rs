//! Lifecycle of the application under test during the done-gate.
//!
//! The server is spawned detached in its own process group with output
//! discarded, polled over HTTP for readiness, and torn down by signalling the
//! whole group so workers it forked die with it. Every failure here is
//! logged and swallowed: a broken server must never corrupt orchestration
//! state, and the verifier discovers an unreachable app on its own.

use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::LazyLock;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use tracing::{debug, info, instrument, warn};
use wait_timeout::ChildExt;

use crate::io::config::ServerConfig;
use crate::io::interrupt;
use crate::io::process::run_command_with_timeout;

static SHELL_OPERATORS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"&&|\|\||[|;>]").unwrap());

const STOP_GRACE: Duration = Duration::from_secs(5);
const STOP_OUTPUT_LIMIT: usize = 64 * 1024;

/// Ownership handle for a started server.
#[derive(Debug)]
pub struct ServerHandle {
    pid: u32,
    /// The pid is also the process group id, so the group can be signalled.
    group_leader: bool,
    child: Option<Child>,
}

impl ServerHandle {
    /// Handle for a process not owned by this one (no reaping).
    pub fn detached(pid: u32, group_leader: bool) -> Self {
        Self {
            pid,
            group_leader,
            child: None,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn group_leader(&self) -> bool {
        self.group_leader
    }
}

/// Server lifecycle operations used by the done-gate.
pub trait ServerLifecycle {
    fn start(&self, command: &str, cwd: &Path) -> Result<ServerHandle>;

    /// Poll `url` until it answers below 500 or `timeout` elapses.
    fn wait_for_ready(&self, url: &str, timeout: Duration) -> bool;

    /// Terminate the server's process group. Never fails.
    fn stop(&self, handle: ServerHandle);

    /// Run a synchronous cleanup command. Never fails.
    fn run_stop_command(&self, command: &str, cwd: &Path);
}

impl<T: ServerLifecycle + ?Sized> ServerLifecycle for &T {
    fn start(&self, command: &str, cwd: &Path) -> Result<ServerHandle> {
        (**self).start(command, cwd)
    }

    fn wait_for_ready(&self, url: &str, timeout: Duration) -> bool {
        (**self).wait_for_ready(url, timeout)
    }

    fn stop(&self, handle: ServerHandle) {
        (**self).stop(handle);
    }

    fn run_stop_command(&self, command: &str, cwd: &Path) {
        (**self).run_stop_command(command, cwd);
    }
}

/// Real OS processes and HTTP polling.
#[derive(Debug, Clone, Default)]
pub struct ProcessServers {
    config: ServerConfig,
}

impl ProcessServers {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }
}

impl ServerLifecycle for ProcessServers {
    #[instrument(skip(self, cwd))]
    fn start(&self, command: &str, cwd: &Path) -> Result<ServerHandle> {
        let mut cmd = build_command(command)?;
        cmd.current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let group_leader = detach(&mut cmd);
        let child = cmd
            .spawn()
            .with_context(|| format!("start server `{command}`"))?;
        let pid = child.id();
        info!(pid, group_leader, "server started");
        Ok(ServerHandle {
            pid,
            group_leader,
            child: Some(child),
        })
    }

    #[instrument(skip(self))]
    fn wait_for_ready(&self, url: &str, timeout: Duration) -> bool {
        let client = match reqwest::blocking::Client::builder()
            .timeout(self.config.request_timeout())
            .redirect(reqwest::redirect::Policy::none())
            .build()
        {
            Ok(client) => client,
            Err(err) => {
                warn!(%err, "failed to build http client");
                return false;
            }
        };

        let deadline = Instant::now() + timeout;
        loop {
            match client.get(url).send() {
                Ok(resp) if resp.status().as_u16() < 500 => {
                    debug!(status = resp.status().as_u16(), "server ready");
                    return true;
                }
                Ok(resp) => debug!(status = resp.status().as_u16(), "server not ready"),
                Err(err) => debug!(%err, "server not reachable"),
            }
            if interrupt::requested() || Instant::now() >= deadline {
                warn!(
                    timeout_secs = timeout.as_secs(),
                    "server did not become ready"
                );
                return false;
            }
            thread::sleep(self.config.poll_interval());
        }
    }

    #[instrument(skip_all, fields(pid = handle.pid, group_leader = handle.group_leader))]
    fn stop(&self, mut handle: ServerHandle) {
        terminate(&handle, false);
        let Some(child) = handle.child.as_mut() else {
            return;
        };
        match child.wait_timeout(STOP_GRACE) {
            Ok(Some(status)) => debug!(exit_code = ?status.code(), "server exited"),
            Ok(None) => {
                warn!("server ignored SIGTERM, killing");
                terminate(&handle, true);
                if let Some(child) = handle.child.as_mut() {
                    let _ = child.kill();
                    if let Err(err) = child.wait() {
                        debug!(%err, "failed to reap server");
                    }
                }
            }
            Err(err) => debug!(%err, "failed to wait for server"),
        }
    }

    #[instrument(skip(self, cwd))]
    fn run_stop_command(&self, command: &str, cwd: &Path) {
        let result = build_command(command).and_then(|mut cmd| {
            cmd.current_dir(cwd);
            run_command_with_timeout(
                cmd,
                None,
                self.config.stop_command_timeout(),
                STOP_OUTPUT_LIMIT,
            )
        });
        match result {
            Ok(output) if output.timed_out => warn!("stop command timed out"),
            Ok(output) if !output.status.success() => warn!(
                exit_code = ?output.status.code(),
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "stop command failed"
            ),
            Ok(_) => debug!("stop command finished"),
            Err(err) => warn!(err = %format!("{err:#}"), "stop command could not run"),
        }
    }
}

/// Whether a command line needs a shell to interpret it.
pub fn needs_shell(command: &str) -> bool {
    SHELL_OPERATORS_RE.is_match(command)
}

/// Shell dispatch for commands with operators, direct exec otherwise.
pub fn build_command(command: &str) -> Result<Command> {
    let command = command.trim();
    if needs_shell(command) {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        return Ok(cmd);
    }
    let mut parts = command.split_whitespace();
    let program = parts.next().ok_or_else(|| anyhow!("empty command"))?;
    let mut cmd = Command::new(program);
    cmd.args(parts);
    Ok(cmd)
}

#[cfg(unix)]
fn detach(cmd: &mut Command) -> bool {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
    true
}

#[cfg(not(unix))]
fn detach(_cmd: &mut Command) -> bool {
    false
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn terminate(handle: &ServerHandle, force: bool) {
    let signal = if force { libc::SIGKILL } else { libc::SIGTERM };
    let Ok(pid) = libc::pid_t::try_from(handle.pid) else {
        return;
    };
    let target = if handle.group_leader { -pid } else { pid };
    // SAFETY: kill(2) has no memory-safety preconditions.
    if unsafe { libc::kill(target, signal) } != 0 {
        let err = std::io::Error::last_os_error();
        debug!(%err, "signal not delivered (already exited?)");
    }
}

#[cfg(not(unix))]
fn terminate(handle: &ServerHandle, _force: bool) {
    debug!(pid = handle.pid, "process groups unsupported; signalling skipped");
}
