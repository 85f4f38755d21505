//! Tool-permission profiles for sub-agent invocations.
//!
//! The same agent runner serves the build agent, the reviewer and the
//! verifier; what differs is which tools each one may call.

use crate::core::sections::{VerificationMode, VerificationSpec};

const BROWSER_TOOLS: &str = "mcp__plugin_playwright_playwright__*";

/// Allow/deny lists of tool identifiers. Empty lists impose no restriction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ToolProfile {
    pub allowed: Vec<String>,
    pub disallowed: Vec<String>,
}

impl ToolProfile {
    /// Build agent: full read/write access.
    pub fn build() -> Self {
        Self::default()
    }

    /// Reviewer: inspect and run commands, never edit.
    pub fn reviewer() -> Self {
        Self {
            allowed: list(&["Read", "Glob", "Grep", "Bash"]),
            disallowed: list(&["Write", "Edit", "WebFetch", "WebSearch", "Task"]),
        }
    }

    /// Verifier: black-box access only, chosen by verification mode.
    pub fn verifier(spec: &VerificationSpec) -> Self {
        match spec.mode {
            VerificationMode::Browser => Self {
                allowed: list(&[BROWSER_TOOLS]),
                disallowed: list(&[
                    "Read", "Write", "Edit", "Glob", "Grep", "Bash", "WebFetch", "WebSearch",
                    "Task",
                ]),
            },
            VerificationMode::Cli => Self {
                allowed: spec
                    .command_prefixes()
                    .iter()
                    .map(|prefix| format!("Bash({prefix}:*)"))
                    .collect(),
                disallowed: list(&[
                    "Read", "Write", "Edit", "Glob", "Grep", "WebFetch", "WebSearch", "Task",
                ]),
            },
        }
    }

    pub fn allowed_arg(&self) -> Option<String> {
        (!self.allowed.is_empty()).then(|| self.allowed.join(","))
    }

    pub fn disallowed_arg(&self) -> Option<String> {
        (!self.disallowed.is_empty()).then(|| self.disallowed.join(","))
    }
}

fn list(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(mode: VerificationMode, entry: &str) -> VerificationSpec {
        VerificationSpec {
            mode,
            entry: entry.to_string(),
            start: None,
            stop: None,
            ready: None,
        }
    }

    #[test]
    fn build_profile_is_unrestricted() {
        let profile = ToolProfile::build();
        assert_eq!(profile.allowed_arg(), None);
        assert_eq!(profile.disallowed_arg(), None);
    }

    #[test]
    fn reviewer_cannot_edit() {
        let profile = ToolProfile::reviewer();
        assert!(profile.disallowed.iter().any(|t| t == "Edit"));
        assert!(profile.disallowed.iter().any(|t| t == "Write"));
        assert_eq!(profile.allowed_arg().as_deref(), Some("Read,Glob,Grep,Bash"));
    }

    #[test]
    fn cli_verifier_is_restricted_to_prefixes() {
        let profile = ToolProfile::verifier(&spec(VerificationMode::Cli, "mytool, npm"));
        assert_eq!(
            profile.allowed_arg().as_deref(),
            Some("Bash(mytool:*),Bash(npm:*)")
        );
        assert!(profile.disallowed.iter().any(|t| t == "Read"));
    }

    #[test]
    fn browser_verifier_has_no_shell_or_source_access() {
        let profile = ToolProfile::verifier(&spec(VerificationMode::Browser, "http://x"));
        assert_eq!(profile.allowed, vec![BROWSER_TOOLS.to_string()]);
        for denied in ["Bash", "Read", "Grep"] {
            assert!(profile.disallowed.iter().any(|t| t == denied));
        }
    }
}
