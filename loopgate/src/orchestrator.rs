//! The iteration loop and done-gate behind `loopgate run` and `loopgate resume`.
//!
//! Each build iteration invokes the build agent with the full session, counts
//! the iteration and resolves the session status. A `done` claim enters the
//! done-gate: optional app server, review, then verification. Only a gate that
//! passes end to end moves the session to `stage: done`.

use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow, bail};
use tracing::{info, instrument, warn};

use crate::core::immutability::restore_metadata;
use crate::core::metadata::{Metadata, MetadataPatch, parse_metadata};
use crate::core::sections::{
    VerificationSpec, append_operator_note, replace_status_marker, status_marker,
    verification_spec,
};
use crate::core::status::resolve_content;
use crate::core::tools::ToolProfile;
use crate::core::types::{GateKind, Stage, Status};
use crate::exit_codes;
use crate::gate::{GateOutcome, run_gate};
use crate::io::agent::{AgentRunner, is_interrupted};
use crate::io::artifacts::ArtifactSweep;
use crate::io::config::RunnerConfig;
use crate::io::interrupt;
use crate::io::server::ServerLifecycle;
use crate::io::session_store::{SessionStore, working_directory};
use crate::session_run::{Invocation, SessionRun};

const COOLDOWN_TICK: Duration = Duration::from_millis(200);

/// Reason why [`run_session`] stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStop {
    Done,
    Blocked,
    MaxIterations,
    ReviewExhausted,
    VerificationExhausted,
    Interrupted,
}

impl RunStop {
    pub fn exit_code(self) -> i32 {
        match self {
            RunStop::Done => exit_codes::OK,
            RunStop::Blocked => exit_codes::BLOCKED,
            RunStop::MaxIterations => exit_codes::MAX_ITERATIONS,
            RunStop::VerificationExhausted => exit_codes::VERIFICATION_EXHAUSTED,
            RunStop::ReviewExhausted => exit_codes::REVIEW_EXHAUSTED,
            RunStop::Interrupted => exit_codes::INTERRUPTED,
        }
    }
}

/// Summary of a run invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    pub stop: RunStop,
    /// Build iterations executed by this invocation.
    pub iterations_run: u32,
    /// Session metadata when the run stopped.
    pub metadata: Metadata,
}

/// Reported after every build iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterationReport {
    /// Session-wide iteration count, including earlier runs.
    pub iteration: u32,
    pub status: Status,
}

/// How one pass through the done-gate ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateResult {
    Accepted,
    LoopBack,
    Exhausted(GateKind),
    Interrupted,
}

/// Drive a planned session until it is done, blocked, out of budget,
/// out of iterations, or interrupted.
///
/// Errors are reserved for fatal conditions: a missing or unplanned session,
/// an invalid Verification section, or an agent that cannot be spawned.
#[instrument(skip_all, fields(id = %id))]
pub fn run_session<A, S, F>(
    store: &SessionStore,
    id: &str,
    agent: A,
    servers: &S,
    config: &RunnerConfig,
    workdir: &Path,
    mut on_iteration: F,
) -> Result<RunOutcome>
where
    A: AgentRunner,
    S: ServerLifecycle,
    F: FnMut(&IterationReport),
{
    let mut run = SessionRun::open(store, id, agent, config, workdir)?;
    let content = run.read()?;
    verification_spec(&content).map_err(|err| anyhow!("invalid Verification section: {err}"))?;

    let finish = |run: &SessionRun<'_, A>, stop: RunStop, iterations_run: u32| RunOutcome {
        stop,
        iterations_run,
        metadata: run.metadata(),
    };

    match run.metadata().stage {
        Stage::Initialized => bail!(
            "session '{id}' has not been planned yet (run `loopgate plan {id}` first)"
        ),
        Stage::Done => {
            println!("Session {id} is already done.");
            return Ok(finish(&run, RunStop::Done, 0));
        }
        Stage::Blocked => {
            println!("Session {id} is blocked. Use `loopgate resume {id}` to continue.");
            return Ok(finish(&run, RunStop::Blocked, 0));
        }
        Stage::Planned | Stage::Running | Stage::Reviewing | Stage::Verifying => {}
    }
    run.update(&MetadataPatch::stage(Stage::Running))?;

    let max = config.max_iterations;
    for n in 1..=max {
        if interrupt::requested() {
            return interrupted(&mut run, n - 1);
        }

        let meta = run.metadata();
        println!(
            "\n=== Iteration {} ({n}/{max} this run) ===",
            meta.iterations + 1
        );
        let content = run.read()?;
        let prompt = run.prompts().render_build(
            workdir,
            &run.session_path(),
            &content,
            meta.iterations + 1,
            content.contains("Feedback (attempt"),
        )?;
        let built = run.invoke(Invocation {
            label: "build",
            system_prompt: None,
            user_prompt: prompt,
            tools: ToolProfile::build(),
            attempt: None,
        });
        match built {
            Ok(_) => {}
            Err(err) if is_interrupted(&err) => return interrupted(&mut run, n - 1),
            Err(err) => return Err(err),
        }

        let meta = run.update(&MetadataPatch {
            iterations: Some(meta.iterations + 1),
            ..MetadataPatch::default()
        })?;
        let status = resolve_content(&run.read()?);
        info!(iteration = meta.iterations, %status, "build iteration finished");
        on_iteration(&IterationReport {
            iteration: meta.iterations,
            status,
        });

        match status {
            Status::Continue => {}
            Status::Blocked => {
                run.update(&MetadataPatch::stage(Stage::Blocked))?;
                println!("Task blocked: human input needed. See {}", run.session_path().display());
                return Ok(finish(&run, RunStop::Blocked, n));
            }
            Status::Done => {
                println!("Build agent reports the task is done. Entering the done-gate.");
                let result = match done_gate(&mut run, servers) {
                    Ok(result) => result,
                    Err(err) if is_interrupted(&err) => GateResult::Interrupted,
                    Err(err) => return Err(err),
                };
                match result {
                    GateResult::Accepted => {
                        run.update(&MetadataPatch::stage(Stage::Done))?;
                        println!("Task completed after {} iteration(s).", run.metadata().iterations);
                        return Ok(finish(&run, RunStop::Done, n));
                    }
                    GateResult::Exhausted(kind) => {
                        println!(
                            "The {} budget is spent; the session is blocked. \
                             Resume with `loopgate resume {id} --reset-attempts` after reviewing the feedback.",
                            kind.label()
                        );
                        let reason = match kind {
                            GateKind::Review => RunStop::ReviewExhausted,
                            GateKind::Verification => RunStop::VerificationExhausted,
                        };
                        return Ok(finish(&run, reason, n));
                    }
                    GateResult::Interrupted => return interrupted(&mut run, n),
                    GateResult::LoopBack => {}
                }
            }
        }

        if n < max && !cooldown(config.cooldown()) {
            return interrupted(&mut run, n);
        }
    }

    println!("Max iterations ({max}) reached. See {}", run.session_path().display());
    Ok(finish(&run, RunStop::MaxIterations, max))
}

/// Review and verification, with the app server up for their duration.
///
/// Teardown (stop the server, run the stop command, sweep artifacts) runs
/// exactly once on every exit path, errors included.
fn done_gate<A: AgentRunner, S: ServerLifecycle>(
    run: &mut SessionRun<'_, A>,
    servers: &S,
) -> Result<GateResult> {
    let config = run.config().clone();
    let workdir = run.workdir().to_path_buf();
    let spec: Option<VerificationSpec> = verification_spec(&run.read()?)
        .map_err(|err| anyhow!("invalid Verification section: {err}"))?;
    let sweep = ArtifactSweep::snapshot(&workdir, &config.artifacts.patterns);
    let mut server = None;

    let attempt = (|| -> Result<GateResult> {
        if let Some(start) = spec.as_ref().and_then(|s| s.start.as_deref()) {
            match servers.start(start, &workdir) {
                Ok(handle) => {
                    server = Some(handle);
                    if let Some(url) = spec.as_ref().and_then(|s| s.readiness_url())
                        && !servers.wait_for_ready(url, config.server.ready_timeout())
                    {
                        println!("Warning: server not ready at {url}; verifying anyway.");
                    }
                }
                Err(err) => {
                    warn!(err = %format!("{err:#}"), "server failed to start");
                    println!("Warning: server failed to start ({err:#}); verifying anyway.");
                }
            }
        }

        let gates = [
            (GateKind::Review, &config.review),
            (GateKind::Verification, &config.verification),
        ];
        for (kind, gate) in gates {
            if !gate.enabled {
                continue;
            }
            if interrupt::requested() {
                return Ok(GateResult::Interrupted);
            }
            match run_gate(run, kind, gate.max_attempts)? {
                GateOutcome::Passed => {}
                GateOutcome::Failed => return Ok(GateResult::LoopBack),
                GateOutcome::Exhausted => return Ok(GateResult::Exhausted(kind)),
            }
        }
        Ok(GateResult::Accepted)
    })();

    if let Some(handle) = server.take() {
        servers.stop(handle);
    }
    if let Some(stop) = spec.as_ref().and_then(|s| s.stop.as_deref()) {
        servers.run_stop_command(stop, &workdir);
    }
    let removed = sweep.sweep();
    if !removed.is_empty() {
        info!(count = removed.len(), "removed verification artifacts");
    }

    attempt
}

/// Checkpoint an interrupted run as `running` so `resume` picks it up.
fn interrupted<A: AgentRunner>(
    run: &mut SessionRun<'_, A>,
    iterations_run: u32,
) -> Result<RunOutcome> {
    run.update(&MetadataPatch::stage(Stage::Running))?;
    println!("\nInterrupted. Resume with `loopgate resume {}`.", run.id());
    Ok(RunOutcome {
        stop: RunStop::Interrupted,
        iterations_run,
        metadata: run.metadata(),
    })
}

/// Sleep between iterations. Returns false if interrupted meanwhile.
fn cooldown(duration: Duration) -> bool {
    if duration.is_zero() {
        return true;
    }
    println!("Cooling down for {}s...", duration.as_secs());
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        if interrupt::requested() {
            return false;
        }
        thread::sleep(COOLDOWN_TICK.min(deadline.saturating_duration_since(Instant::now())));
    }
    !interrupt::requested()
}

/// Operator choices for `loopgate resume`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResumeOptions {
    /// Clear both gate attempt counters.
    pub reset_attempts: bool,
    /// Note appended under `## Operator Notes` for the next build iteration.
    pub message: Option<String>,
}

/// Get a session ready to run again after an interrupt, exhaustion or block.
///
/// Warns when `cwd` differs from the directory the session was created in.
pub fn prepare_resume(
    store: &SessionStore,
    id: &str,
    options: &ResumeOptions,
    cwd: &Path,
) -> Result<Metadata> {
    let content = store.read(id)?;
    if let Some(recorded) = working_directory(&content)
        && Path::new(recorded) != cwd
    {
        warn!(recorded, cwd = %cwd.display(), "working directory mismatch");
        println!(
            "Warning: session {id} was created in {recorded}, but the current directory is {}.",
            cwd.display()
        );
    }

    let mut meta = parse_metadata(&content).unwrap_or_default();
    if meta.stage == Stage::Initialized {
        bail!("session '{id}' has not been planned yet (run `loopgate plan {id}` first)");
    }
    let mut body = content.clone();
    if meta.stage == Stage::Blocked {
        meta.stage = Stage::Running;
        if status_marker(&body).as_deref() == Some("BLOCKED")
            && let Some(updated) = replace_status_marker(&body, "IN_PROGRESS")
        {
            body = updated;
        }
    }
    if matches!(meta.stage, Stage::Reviewing | Stage::Verifying) {
        meta.stage = Stage::Running;
    }
    if options.reset_attempts {
        meta.review_attempts = None;
        meta.verification_attempts = None;
    }
    if let Some(message) = options.message.as_deref().filter(|m| !m.trim().is_empty()) {
        body = append_operator_note(&body, message);
    }

    let restored = restore_metadata(&body, &meta);
    if restored.content != content {
        store.write(id, &restored.content)?;
    }
    Ok(meta)
}
