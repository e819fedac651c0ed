//! Pass/fail verdict from an agent's description of a test run.

use std::sync::OnceLock;

use regex::Regex;

const SUCCESS_PATTERNS: &[&str] = &[
    r"all \d+ tests? passed",
    r"tests? passed successfully",
    r"test suite passed",
    r"\d+ passed,? 0 failed",
    r"0 failed,? \d+ passed",
    r"passed:? \d+.*failed:? 0",
    r"no (?:test )?failures",
    r"0 failures",
    r"all tests pass",
];

const FAILURE_PATTERNS: &[&str] = &[
    r"tests? failing",
    r"test failure",
    r"assertion error",
    r"traceback",
];

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(p).expect("Invalid test verdict pattern"))
        .collect()
}

fn success_regexes() -> &'static [Regex] {
    static REGEXES: OnceLock<Vec<Regex>> = OnceLock::new();
    REGEXES.get_or_init(|| compile(SUCCESS_PATTERNS))
}

fn failure_regexes() -> &'static [Regex] {
    static REGEXES: OnceLock<Vec<Regex>> = OnceLock::new();
    REGEXES.get_or_init(|| compile(FAILURE_PATTERNS))
}

fn failed_count_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"(\d+) failed").expect("Invalid failed-count regex"))
}

/// Guess whether the tests passed from the agent's report.
///
/// Explicit pass statements win. Otherwise any unnegated failure statement
/// means failure, and failing that the report must mention "passed".
pub fn detect_test_success(output: &str) -> bool {
    let output = output.to_lowercase();

    if success_regexes().iter().any(|re| re.is_match(&output)) {
        return true;
    }

    if has_unnegated_failed(&output) {
        return false;
    }

    if let Some(count) = failed_count_regex()
        .captures(&output)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u64>().ok())
    {
        if count > 0 {
            return false;
        }
    }

    if failure_regexes().iter().any(|re| re.is_match(&output)) {
        return false;
    }

    output.contains("passed")
}

/// "failed" that is not directly preceded by "no ", "0 " or "<digit> ".
fn has_unnegated_failed(output: &str) -> bool {
    output.match_indices("failed").any(|(at, _)| {
        let before = &output.as_bytes()[..at];
        let negated_by_no = before.ends_with(b"no ");
        let after_count = before.len() >= 2
            && before[before.len() - 1] == b' '
            && before[before.len() - 2].is_ascii_digit();
        !negated_by_no && !after_count
    })
}
