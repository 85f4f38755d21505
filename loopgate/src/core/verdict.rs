//! Verdict extraction from reviewer/verifier output.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::Verdict;

static VERDICT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)##\s*VERDICT:\s*(PASS|FAIL)").unwrap());

/// Scan `output` for `## VERDICT: PASS|FAIL` markers.
///
/// The last marker wins since agents may revise their judgment mid-response.
/// No marker at all yields [`Verdict::Unparsed`], which callers treat as a fail.
pub fn parse_verdict(output: &str) -> Verdict {
    let Some(caps) = VERDICT_RE.captures_iter(output).last() else {
        return Verdict::Unparsed;
    };
    if caps[1].eq_ignore_ascii_case("PASS") {
        Verdict::Pass
    } else {
        Verdict::Fail
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_marker_wins() {
        let out = "## VERDICT: FAIL\nactually the test was flaky, rerun ok\n## VERDICT: PASS\n";
        assert_eq!(parse_verdict(out), Verdict::Pass);
        let out = "## VERDICT: PASS\nwait, lint fails\n## VERDICT: FAIL";
        assert_eq!(parse_verdict(out), Verdict::Fail);
    }

    #[test]
    fn marker_is_case_insensitive() {
        assert_eq!(parse_verdict("## verdict: pass"), Verdict::Pass);
    }

    #[test]
    fn missing_marker_is_unparsed_and_not_passed() {
        let verdict = parse_verdict("Looks great to me!");
        assert_eq!(verdict, Verdict::Unparsed);
        assert!(!verdict.passed());
    }
}
