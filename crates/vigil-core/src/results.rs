//! Test output parsing.
//!
//! The default parser counts status words in the runner's console output
//! and picks failure lines out by substring. It never fails: noisy or
//! malformed lines simply contribute nothing.

use crate::types::{FailureRecord, TestCounts};

pub const FAILURE_KIND: &str = "failure";

const PASSED: &str = "PASSED";
const FAILED: &str = "FAILED";
const ERROR: &str = "ERROR";
const PATH_SEPARATOR: &str = "::";

/// Turns raw test output into counts and failure records.
pub trait ResultParser: Send + Sync {
    fn counts(&self, raw: &str) -> TestCounts;
    fn failures(&self, raw: &str) -> Vec<FailureRecord>;
}

/// Line/substring based parser for pytest console output.
#[derive(Debug, Default, Clone, Copy)]
pub struct SubstringParser;

fn status_word(word: &str) -> &str {
    word.trim_end_matches(|c: char| c.is_ascii_punctuation())
}

impl ResultParser for SubstringParser {
    fn counts(&self, raw: &str) -> TestCounts {
        let mut counts = TestCounts::default();
        for word in raw.split_whitespace().map(status_word) {
            match word {
                PASSED => counts.passed += 1,
                FAILED => counts.failed += 1,
                ERROR => counts.errors += 1,
                _ => {}
            }
        }
        counts
    }

    fn failures(&self, raw: &str) -> Vec<FailureRecord> {
        raw.lines()
            .map(str::trim)
            .filter(|line| line.contains(FAILED) && line.contains(PATH_SEPARATOR))
            .filter_map(failure_from_line)
            .collect()
    }
}

fn failure_from_line(line: &str) -> Option<FailureRecord> {
    let mut tokens = line.split_whitespace();
    let mut test_name = tokens.next()?;
    // "FAILED tests/x.py::t - msg" (short summary) vs "tests/x.py::t FAILED" (verbose)
    if matches!(status_word(test_name), FAILED | ERROR | PASSED) {
        test_name = tokens.next().unwrap_or(test_name);
    }
    let file = test_name
        .split_once(PATH_SEPARATOR)
        .map(|(file, _)| file)
        .unwrap_or_default();
    Some(FailureRecord {
        test_name: test_name.to_string(),
        file: file.to_string(),
        line: 0,
        message: line.to_string(),
        stacktrace: String::new(),
        kind: FAILURE_KIND.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
tests/generated/test_calc.py::test_add_smoke PASSED
tests/generated/test_calc.py::test_neg_smoke PASSED
FAILED tests/generated/test_calc.py::test_div_smoke - ZeroDivisionError: division by zero
!!!!!!!!!!!!!!!!!!!!!!!!!! stopping after 1 failures !!!!!!!!!!!!!!!!!!!!!!!!!!
1 failed, 2 passed in 0.12s
";

    #[test]
    fn counts_status_tokens() {
        let counts = SubstringParser.counts(SAMPLE);
        assert_eq!(counts, TestCounts { passed: 2, failed: 1, errors: 0 });
    }

    #[test]
    fn lowercase_summary_words_are_not_counted() {
        let counts = SubstringParser.counts("3 passed, 1 failed, 2 errors in 1.0s");
        assert_eq!(counts, TestCounts::default());
    }

    #[test]
    fn trailing_punctuation_is_ignored() {
        let counts = SubstringParser.counts("ERROR: collection failed\nstatus: PASSED.");
        assert_eq!(counts.errors, 1);
        assert_eq!(counts.passed, 1);
    }

    #[test]
    fn extracts_failure_record_from_short_summary() {
        let failures = SubstringParser.failures(SAMPLE);
        assert_eq!(failures.len(), 1);
        let f = &failures[0];
        assert_eq!(f.test_name, "tests/generated/test_calc.py::test_div_smoke");
        assert_eq!(f.file, "tests/generated/test_calc.py");
        assert_eq!(f.kind, "failure");
        assert!(f.message.starts_with("FAILED tests/generated/test_calc.py::test_div_smoke"));
        assert!(f.message.ends_with("division by zero"));
    }

    #[test]
    fn verbose_failure_line_uses_first_token() {
        let failures = SubstringParser.failures("  tests/test_a.py::test_x FAILED   [ 50%]\n");
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].test_name, "tests/test_a.py::test_x");
        assert_eq!(failures[0].message, "tests/test_a.py::test_x FAILED   [ 50%]");
    }

    #[test]
    fn lines_without_separator_are_skipped() {
        assert!(SubstringParser.failures("FAILED to connect\n::\n").is_empty());
    }

    #[test]
    fn empty_and_garbage_output_never_panics() {
        assert_eq!(SubstringParser.counts(""), TestCounts::default());
        assert!(SubstringParser.failures("\u{0}\u{fffd} FAILED").is_empty());
        let odd = SubstringParser.failures("FAILED ::");
        assert_eq!(odd.len(), 1);
        assert_eq!(odd[0].file, "");
    }

    #[test]
    fn duplicate_failure_lines_yield_duplicate_records() {
        let raw = "FAILED t.py::a - boom\nFAILED t.py::a - boom\n";
        assert_eq!(SubstringParser.failures(raw).len(), 2);
    }
}
