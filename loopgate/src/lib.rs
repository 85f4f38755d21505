//! Iteration and done-gate orchestrator for autonomous coding agents.
//!
//! A session is a markdown file holding the task, the agent's checklist and a
//! small machine-owned metadata block. The orchestrator repeatedly hands the
//! session to a build agent until it claims `done`, then refuses to accept the
//! claim until an independent review and a black-box verification both pass.
//!
//! - **[`core`]**: Pure, deterministic logic (metadata, sections, status and
//!   verdict parsing). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (session files, sub-agent and
//!   server processes, prompts, logs). Hidden behind traits where tests need
//!   fakes.
//!
//! Orchestration modules ([`orchestrator`], [`gate`], [`plan`], [`sessions`])
//! coordinate core logic with I/O to implement CLI commands.

pub mod core;
pub mod exit_codes;
pub mod gate;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod plan;
pub mod session_run;
pub mod sessions;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
