//! Review and verification stages of the done-gate.
//!
//! Both stages share one shape: check the attempt budget, count the attempt
//! before invoking the sub-agent, parse a verdict from its output, and either
//! restore `stage=running` (pass, or fail with feedback appended to the
//! session) or mark the session blocked once the budget is spent.

use anyhow::{Result, anyhow};
use tracing::{info, instrument};

use crate::core::metadata::{Metadata, MetadataPatch};
use crate::core::sections::{append_feedback, task_summary, verification_spec};
use crate::core::tools::ToolProfile;
use crate::core::types::{GateKind, Stage, Verdict};
use crate::core::verdict::parse_verdict;
use crate::io::agent::AgentRunner;
use crate::session_run::{Invocation, SessionRun};

/// Result of one gate entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    Passed,
    /// Feedback was appended; the build loop should continue.
    Failed,
    /// The budget was already spent; the session is now blocked.
    Exhausted,
}

/// Run one attempt of `kind` against a budget of `max_attempts`.
#[instrument(skip(run), fields(id = %run.id()))]
pub fn run_gate<A: AgentRunner>(
    run: &mut SessionRun<'_, A>,
    kind: GateKind,
    max_attempts: u32,
) -> Result<GateOutcome> {
    let content = run.read()?;

    // Only verification has a plan to read; `None` for review.
    let spec = match kind {
        GateKind::Review => None,
        GateKind::Verification => {
            let spec = verification_spec(&content)
                .map_err(|err| anyhow!("invalid Verification section: {err}"))?;
            let Some(spec) = spec else {
                println!("Verification skipped (mode: none)");
                return Ok(GateOutcome::Passed);
            };
            Some(spec)
        }
    };

    let before = run.metadata();
    let used = attempts(&before, kind).unwrap_or(0);
    if used >= max_attempts {
        info!(used, max_attempts, "gate budget exhausted");
        println!(
            "{} budget exhausted ({used}/{max_attempts} attempts)",
            capitalized(kind)
        );
        run.update(&MetadataPatch::stage(Stage::Blocked))?;
        return Ok(GateOutcome::Exhausted);
    }

    let summary = task_summary(&content);
    let (system, user, tools) = match &spec {
        None => {
            let prompts = run.prompts().render_review(run.workdir(), &summary)?;
            (prompts.system, prompts.user, ToolProfile::reviewer())
        }
        Some(spec) => {
            let prompts = run.prompts().render_verification(spec, &summary)?;
            (prompts.system, prompts.user, ToolProfile::verifier(spec))
        }
    };

    let attempt = used + 1;
    let mut patch = MetadataPatch::stage(kind.stage());
    set_attempts(&mut patch, kind, attempt);
    run.update(&patch)?;
    println!("\n=== {} (attempt {attempt}/{max_attempts}) ===", capitalized(kind));

    let output = run.invoke(Invocation {
        label: kind.label(),
        system_prompt: Some(system),
        user_prompt: user,
        tools,
        attempt: Some(attempt),
    })?;

    let verdict = parse_verdict(&output);
    info!(?verdict, attempt, "gate verdict");
    if verdict.passed() {
        println!("{} passed", capitalized(kind));
        match kind {
            GateKind::Review => {
                // A passing review gives its attempt back.
                let restored = Metadata {
                    stage: Stage::Running,
                    review_attempts: before.review_attempts,
                    ..run.metadata()
                };
                run.set_metadata(restored)?;
            }
            GateKind::Verification => {
                run.update(&MetadataPatch::stage(Stage::Running))?;
            }
        }
        return Ok(GateOutcome::Passed);
    }

    match verdict {
        Verdict::Unparsed => println!("{} failed (no verdict found)", capitalized(kind)),
        _ => println!("{} failed", capitalized(kind)),
    }
    run.edit_body(|content| append_feedback(content, kind, attempt, &output))?;
    run.update(&MetadataPatch::stage(Stage::Running))?;
    Ok(GateOutcome::Failed)
}

fn attempts(meta: &Metadata, kind: GateKind) -> Option<u32> {
    match kind {
        GateKind::Review => meta.review_attempts,
        GateKind::Verification => meta.verification_attempts,
    }
}

fn set_attempts(patch: &mut MetadataPatch, kind: GateKind, value: u32) {
    match kind {
        GateKind::Review => patch.review_attempts = Some(value),
        GateKind::Verification => patch.verification_attempts = Some(value),
    }
}

fn capitalized(kind: GateKind) -> &'static str {
    match kind {
        GateKind::Review => "Review",
        GateKind::Verification => "Verification",
    }
}
