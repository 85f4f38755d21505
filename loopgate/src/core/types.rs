//! Shared deterministic types for loopgate core logic.
//!
//! These types define stable contracts between core components. They should not
//! depend on external state or I/O and must remain deterministic across runs.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Machine-owned position of a session in the orchestration state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    #[default]
    Initialized,
    Planned,
    Running,
    Reviewing,
    Verifying,
    Blocked,
    Done,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Initialized => "initialized",
            Stage::Planned => "planned",
            Stage::Running => "running",
            Stage::Reviewing => "reviewing",
            Stage::Verifying => "verifying",
            Stage::Blocked => "blocked",
            Stage::Done => "done",
        }
    }

    /// `done` and `blocked` end a run; everything else can still make progress.
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Done | Stage::Blocked)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "initialized" => Ok(Stage::Initialized),
            "planned" => Ok(Stage::Planned),
            "running" => Ok(Stage::Running),
            "reviewing" => Ok(Stage::Reviewing),
            "verifying" => Ok(Stage::Verifying),
            "blocked" => Ok(Stage::Blocked),
            "done" => Ok(Stage::Done),
            other => Err(format!("unknown stage '{other}'")),
        }
    }
}

/// Tri-state verdict derived from a session by the status resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Continue,
    Done,
    Blocked,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Continue => "continue",
            Status::Done => "done",
            Status::Blocked => "blocked",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pass/fail judgment scraped from a reviewer or verifier response.
///
/// `Unparsed` means no verdict marker was found. It is never a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail,
    Unparsed,
}

impl Verdict {
    pub fn passed(self) -> bool {
        self == Verdict::Pass
    }
}

/// Which done-gate stage is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateKind {
    Review,
    Verification,
}

impl GateKind {
    /// Stage persisted while the gate's sub-agent is in flight.
    pub fn stage(self) -> Stage {
        match self {
            GateKind::Review => Stage::Reviewing,
            GateKind::Verification => Stage::Verifying,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            GateKind::Review => "review",
            GateKind::Verification => "verification",
        }
    }

    /// Heading used when a failed attempt's feedback is appended to the body.
    pub fn feedback_heading(self) -> &'static str {
        match self {
            GateKind::Review => "Review Feedback",
            GateKind::Verification => "Verification Feedback",
        }
    }
}
