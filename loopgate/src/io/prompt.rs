//! Prompt rendering for the build agent, the planner and the gate sub-agents.

use std::path::Path;

use anyhow::Result;
use minijinja::{Environment, context};

use crate::core::sections::{TaskSummary, VerificationMode, VerificationSpec};

const BUILD_TEMPLATE: &str = include_str!("prompts/build.md");
const PLANNER_TEMPLATE: &str = include_str!("prompts/planner.md");
const REVIEWER_TEMPLATE: &str = include_str!("prompts/reviewer.md");
const VERIFIER_BROWSER_TEMPLATE: &str = include_str!("prompts/verifier_browser.md");
const VERIFIER_CLI_TEMPLATE: &str = include_str!("prompts/verifier_cli.md");
const GATE_USER_TEMPLATE: &str = include_str!("prompts/gate_user.md");

const PLAN_INSTRUCTION: &str =
    "Read the session file, research the project and append the planning sections to it.";

/// System and user prompt for one sub-agent invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptPair {
    pub system: String,
    pub user: String,
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        for (name, source) in [
            ("build", BUILD_TEMPLATE),
            ("planner", PLANNER_TEMPLATE),
            ("reviewer", REVIEWER_TEMPLATE),
            ("verifier_browser", VERIFIER_BROWSER_TEMPLATE),
            ("verifier_cli", VERIFIER_CLI_TEMPLATE),
            ("gate_user", GATE_USER_TEMPLATE),
        ] {
            env.add_template(name, source)
                .expect("bundled prompt templates should be valid");
        }
        Self { env }
    }

    /// Build-agent prompt embedding the full session document.
    pub fn render_build(
        &self,
        workdir: &Path,
        session_path: &Path,
        session: &str,
        iteration: u32,
        has_feedback: bool,
    ) -> Result<String> {
        let template = self.env.get_template("build")?;
        Ok(template.render(context! {
            workdir => workdir.display().to_string(),
            session_path => session_path.display().to_string(),
            session => session.trim(),
            iteration => iteration,
            feedback => has_feedback,
        })?)
    }

    pub fn render_plan(&self, workdir: &Path, session_path: &Path) -> Result<PromptPair> {
        let template = self.env.get_template("planner")?;
        let system = template.render(context! {
            workdir => workdir.display().to_string(),
            session_path => session_path.display().to_string(),
        })?;
        Ok(PromptPair {
            system,
            user: format!("{PLAN_INSTRUCTION}\n\nSession file: {}", session_path.display()),
        })
    }

    pub fn render_review(&self, workdir: &Path, summary: &TaskSummary) -> Result<PromptPair> {
        let system = self.env.get_template("reviewer")?.render(context! {
            workdir => workdir.display().to_string(),
        })?;
        let user = self.render_gate_user(
            summary,
            "Review the code thoroughly.",
            "Now review the implementation. Run type-checking, linting, and tests. \
             Verify completeness against the task description. Check for obvious bugs.",
        )?;
        Ok(PromptPair { system, user })
    }

    pub fn render_verification(
        &self,
        spec: &VerificationSpec,
        summary: &TaskSummary,
    ) -> Result<PromptPair> {
        let name = match spec.mode {
            VerificationMode::Browser => "verifier_browser",
            VerificationMode::Cli => "verifier_cli",
        };
        let system = self.env.get_template(name)?.render(context! {
            entry => spec.entry.as_str(),
        })?;
        let user = self.render_gate_user(
            summary,
            "Verify EVERYTHING.",
            "Now test this thoroughly through the allowed interface. \
             Be skeptical and verify every claim.",
        )?;
        Ok(PromptPair { system, user })
    }

    fn render_gate_user(
        &self,
        summary: &TaskSummary,
        instruction: &str,
        closing: &str,
    ) -> Result<String> {
        let template = self.env.get_template("gate_user")?;
        Ok(template.render(context! {
            instruction => instruction,
            task => summary.task.as_str(),
            completed => summary.completed.as_str(),
            closing => closing,
        })?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(completed: &str) -> TaskSummary {
        TaskSummary {
            task: "Add a /health endpoint".to_string(),
            completed: completed.to_string(),
        }
    }

    #[test]
    fn build_prompt_embeds_session_and_iteration() {
        let engine = PromptEngine::new();
        let prompt = engine
            .render_build(
                Path::new("/work"),
                Path::new("/tmp/loopgate/session-abc.md"),
                "# Session: abc\n\n## Task\n\nShip it\n",
                4,
                false,
            )
            .expect("render");
        assert!(prompt.starts_with("Working directory: /work\n"));
        assert!(prompt.contains("<session>\n# Session: abc"));
        assert!(prompt.contains("This is\niteration 4."));
        assert!(!prompt.contains("previous attempt"));
        assert!(prompt.contains("## Status: DONE"));
    }

    #[test]
    fn build_prompt_mentions_feedback_when_present() {
        let prompt = PromptEngine::new()
            .render_build(Path::new("/w"), Path::new("/s.md"), "body", 2, true)
            .expect("render");
        assert!(prompt.contains("previous attempt to finish was rejected"));
    }

    #[test]
    fn review_prompt_requires_verdict_and_carries_task() {
        let pair = PromptEngine::new()
            .render_review(Path::new("/work"), &summary("- added route"))
            .expect("render");
        assert!(pair.system.starts_with("Working directory: /work"));
        assert!(pair.system.contains("## VERDICT: PASS"));
        assert!(pair.user.contains("## Task Description\n\nAdd a /health endpoint"));
        assert!(pair.user.contains("- added route"));
        assert!(pair.user.ends_with("Check for obvious bugs."));
    }

    #[test]
    fn empty_completed_gets_placeholder() {
        let pair = PromptEngine::new()
            .render_review(Path::new("/work"), &summary(""))
            .expect("render");
        assert!(pair.user.contains("(Nothing marked as completed yet)"));
    }

    #[test]
    fn verifier_system_prompt_depends_on_mode() {
        let engine = PromptEngine::new();
        let browser = VerificationSpec {
            mode: VerificationMode::Browser,
            entry: "http://localhost:3000".to_string(),
            start: None,
            stop: None,
            ready: None,
        };
        let pair = engine
            .render_verification(&browser, &summary("x"))
            .expect("render");
        assert!(pair.system.starts_with("Entry point URL: http://localhost:3000"));
        assert!(pair.user.contains("Verify EVERYTHING."));

        let cli = VerificationSpec {
            mode: VerificationMode::Cli,
            entry: "mytool, npm".to_string(),
            ..browser
        };
        let pair = engine.render_verification(&cli, &summary("x")).expect("render");
        assert!(pair.system.starts_with("Allowed commands: mytool, npm"));
    }
}
