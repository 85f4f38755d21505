//! Metadata immutability across sub-agent invocations.
//!
//! Sub-agents may edit the session body freely, but the metadata block belongs
//! to the orchestrator. After every invocation the orchestrator re-applies the
//! metadata it last wrote.

use crate::core::metadata::{Metadata, MetadataPatch, parse_metadata, update_metadata_with};

/// Outcome of re-asserting the orchestrator's metadata on agent-edited content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Restored {
    pub content: String,
    /// Stable messages describing what the agent changed (empty if untouched).
    pub violations: Vec<String>,
}

/// Compare the metadata in `after` with `expected` and restore `expected`.
pub fn restore_metadata(after: &str, expected: &Metadata) -> Restored {
    let violations = check_metadata_immutability(expected, parse_metadata(after).as_ref());
    let content = update_metadata_with(after, &MetadataPatch::from_metadata(expected), *expected);
    let content = clear_removed_counters(content, expected);
    Restored {
        content,
        violations,
    }
}

/// List differences between the metadata the orchestrator wrote and what is on disk.
pub fn check_metadata_immutability(expected: &Metadata, actual: Option<&Metadata>) -> Vec<String> {
    let Some(actual) = actual else {
        return vec!["metadata block removed".to_string()];
    };
    let mut errors = Vec::new();
    if actual.stage != expected.stage {
        errors.push(format!(
            "stage changed from '{}' to '{}'",
            expected.stage, actual.stage
        ));
    }
    if actual.iterations != expected.iterations {
        errors.push(format!(
            "iterations changed from {} to {}",
            expected.iterations, actual.iterations
        ));
    }
    if actual.review_attempts != expected.review_attempts {
        errors.push(format!(
            "reviewAttempts changed from {} to {}",
            counter_label(expected.review_attempts),
            counter_label(actual.review_attempts)
        ));
    }
    if actual.verification_attempts != expected.verification_attempts {
        errors.push(format!(
            "verificationAttempts changed from {} to {}",
            counter_label(expected.verification_attempts),
            counter_label(actual.verification_attempts)
        ));
    }
    errors
}

/// A patch can only set counters; drop any the agent added that we never wrote.
fn clear_removed_counters(content: String, expected: &Metadata) -> String {
    let Some(actual) = parse_metadata(&content) else {
        return content;
    };
    if actual == *expected {
        return content;
    }
    let mut kept = Vec::new();
    let mut in_block = false;
    for (idx, line) in content.split_inclusive('\n').enumerate() {
        if line.trim_end() == "---" {
            if idx == 0 {
                in_block = true;
            } else if in_block {
                in_block = false;
            }
            kept.push(line);
            continue;
        }
        if in_block {
            let key = line.split_once(':').map(|(k, _)| k.trim());
            let stray = match key {
                Some("reviewAttempts") => expected.review_attempts.is_none(),
                Some("verificationAttempts") => expected.verification_attempts.is_none(),
                _ => false,
            };
            if stray {
                continue;
            }
        }
        kept.push(line);
    }
    kept.concat()
}

fn counter_label(value: Option<u32>) -> String {
    value.map_or_else(|| "absent".to_string(), |n| n.to_string())
}
