//! Lifecycle tests that drive a session from `new` through `plan` and `run`.
//!
//! Agents and servers are scripted fakes, so these scenarios exercise the
//! real session store, metadata enforcement, gates and teardown ordering
//! without spawning anything.

use loopgate::core::metadata::{Metadata, parse_metadata};
use loopgate::core::types::Stage;
use loopgate::io::config::RunnerConfig;
use loopgate::orchestrator::{ResumeOptions, RunStop, prepare_resume, run_session};
use loopgate::plan::plan_session;
use loopgate::test_support::{
    BROWSER_VERIFICATION, RecordingServers, ScriptedAgent, ServerEvent, TestSessions,
};

fn metadata(sessions: &TestSessions, id: &str) -> Metadata {
    parse_metadata(&sessions.store.read(id).expect("read")).expect("metadata")
}

/// Fresh session → plan → three build iterations → done claim → review and
/// verification both pass on their first attempt.
///
/// Execution sequence:
/// 1. `plan`: agent writes the checklist and a browser Verification section.
/// 2. Iterations 1-2: progress, status stays IN_PROGRESS.
/// 3. Iteration 3: DONE claim → server start → review PASS → verification PASS.
/// 4. Teardown: server stopped, stop command run, session marked done.
#[test]
fn planned_session_reaches_done_through_both_gates() {
    let sessions = TestSessions::new();
    let id = sessions.create("Add a settings page");
    assert_eq!(metadata(&sessions, &id).stage, Stage::Initialized);

    let config = RunnerConfig::default();
    let plan = format!(
        "## Status: IN_PROGRESS\n\n## Completed\n\n## Remaining\n\n- [ ] route\n- [ ] form\n\n## Verification\n\n{BROWSER_VERIFICATION}"
    );
    let planner = ScriptedAgent::new(sessions.store.path(&id)).respond_with_edit(
        "Plan written.",
        move |content| format!("{}\n\n{plan}", content.trim_end()),
    );
    plan_session(&sessions.store, &id, &planner, &config, sessions.workdir()).expect("plan");
    assert_eq!(metadata(&sessions, &id).stage, Stage::Planned);

    let agent = ScriptedAgent::new(sessions.store.path(&id))
        .progress("route added")
        .progress("form added")
        .claim_done()
        .pass()
        .pass();
    let servers = RecordingServers::ready();
    let mut iterations = Vec::new();

    let outcome = run_session(
        &sessions.store,
        &id,
        &agent,
        &servers,
        &config,
        sessions.workdir(),
        |report| iterations.push(report.iteration),
    )
    .expect("run");

    assert_eq!(outcome.stop, RunStop::Done);
    assert_eq!(outcome.stop.exit_code(), 0);
    assert_eq!(iterations, vec![1, 2, 3]);
    assert_eq!(
        agent.labels(),
        vec!["build", "build", "build", "review", "verification"]
    );

    let meta = metadata(&sessions, &id);
    assert_eq!(meta.stage, Stage::Done);
    assert_eq!(meta.iterations, 3);
    assert_eq!(meta.review_attempts, None);
    assert_eq!(meta.verification_attempts, Some(1));

    assert_eq!(
        servers.events(),
        vec![
            ServerEvent::Start("npm run dev".to_string()),
            ServerEvent::WaitForReady("http://127.0.0.1:3000".to_string()),
            ServerEvent::Stop(4242),
            ServerEvent::StopCommand("docker compose down".to_string()),
        ]
    );

    let logs = sessions.store.logs_dir(&id);
    assert!(logs.join("001-plan.meta.json").exists());
    assert!(logs.join("006-verification.meta.json").exists());
}

/// Verification fails twice with a budget of 2; the third done claim finds
/// the budget spent and blocks the session. `resume --reset-attempts` then
/// lets a fixed build through.
#[test]
fn exhausted_verification_blocks_until_reset() {
    let sessions = TestSessions::new();
    let id = sessions.planned_with_verification("Fix login", BROWSER_VERIFICATION);
    let mut config = RunnerConfig::default();
    config.review.enabled = false;
    config.verification.max_attempts = 2;

    let agent = ScriptedAgent::new(sessions.store.path(&id))
        .claim_done()
        .fail("Login form posts to 404.")
        .claim_done()
        .fail("Still 404.")
        .claim_done();
    let servers = RecordingServers::ready();

    let outcome = run_session(
        &sessions.store,
        &id,
        &agent,
        &servers,
        &config,
        sessions.workdir(),
        |_| {},
    )
    .expect("run");
    assert_eq!(outcome.stop, RunStop::VerificationExhausted);
    assert_eq!(outcome.stop.exit_code(), 3);
    assert_eq!(outcome.iterations_run, 3);
    let meta = metadata(&sessions, &id);
    assert_eq!(meta.stage, Stage::Blocked);
    assert_eq!(meta.verification_attempts, Some(2));
    assert_eq!(servers.count(|e| matches!(e, ServerEvent::Start(_))), 3);
    assert_eq!(servers.count(|e| matches!(e, ServerEvent::Stop(_))), 3);

    let content = sessions.store.read(&id).expect("read");
    assert!(content.contains("## Verification Feedback (attempt 1)"));
    assert!(content.contains("## Verification Feedback (attempt 2)"));

    let options = ResumeOptions {
        reset_attempts: true,
        message: Some("The login route moved to /api/session.".to_string()),
    };
    let resumed =
        prepare_resume(&sessions.store, &id, &options, sessions.workdir()).expect("resume");
    assert_eq!(resumed.stage, Stage::Running);
    assert_eq!(resumed.verification_attempts, None);

    let agent = ScriptedAgent::new(sessions.store.path(&id))
        .claim_done()
        .pass();
    let outcome = run_session(
        &sessions.store,
        &id,
        &agent,
        &servers,
        &config,
        sessions.workdir(),
        |_| {},
    )
    .expect("run after resume");
    assert_eq!(outcome.stop, RunStop::Done);
    assert!(agent.requests()[0].user_prompt.contains("/api/session"));
    let meta = metadata(&sessions, &id);
    assert_eq!(meta.stage, Stage::Done);
    assert_eq!(meta.iterations, 4);
    assert_eq!(meta.verification_attempts, Some(1));
}

/// A server that never answers does not skip verification, and teardown
/// still happens exactly once.
#[test]
fn unready_server_is_verified_and_torn_down_once() {
    let sessions = TestSessions::new();
    let id = sessions.planned_with_verification("Add a chart", BROWSER_VERIFICATION);
    let mut config = RunnerConfig::default();
    config.review.enabled = false;

    let agent = ScriptedAgent::new(sessions.store.path(&id))
        .claim_done()
        .respond("Connection refused at http://127.0.0.1:3000\n## VERDICT: FAIL")
        .progress("fixed the port")
        .claim_done()
        .pass();
    let servers = RecordingServers::never_ready();

    let outcome = run_session(
        &sessions.store,
        &id,
        &agent,
        &servers,
        &config,
        sessions.workdir(),
        |_| {},
    )
    .expect("run");

    assert_eq!(outcome.stop, RunStop::Done);
    assert_eq!(
        agent.labels(),
        vec!["build", "verification", "build", "build", "verification"]
    );
    assert_eq!(servers.count(|e| matches!(e, ServerEvent::Start(_))), 2);
    assert_eq!(servers.count(|e| matches!(e, ServerEvent::Stop(_))), 2);
    assert_eq!(
        servers.count(|e| matches!(e, ServerEvent::StopCommand(_))),
        2
    );
    // The build prompt after a failure points the agent at the feedback.
    assert!(agent.requests()[2].user_prompt.contains("Feedback"));
}
