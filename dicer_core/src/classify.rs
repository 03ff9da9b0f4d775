use crate::executor::{ExecutionStatus, RunResult};
use log::warn;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

/// Bucket a single run falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Outcome {
    Success,
    Failure,
    Timeout,
    /// The target failed and printed one of the expected signatures.
    ExpectedNeg,
    /// The target failed, but not the way the oracles predicted.
    UnexpectedNeg,
    /// The oracles predicted a failure and the target accepted the item.
    UnexpectedPass,
    Skip,
}

impl Outcome {
    pub const ALL: [Outcome; 7] = [
        Outcome::Success,
        Outcome::Failure,
        Outcome::Timeout,
        Outcome::ExpectedNeg,
        Outcome::UnexpectedNeg,
        Outcome::UnexpectedPass,
        Outcome::Skip,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Timeout => "timeout",
            Outcome::ExpectedNeg => "expected-neg",
            Outcome::UnexpectedNeg => "unexpected-neg",
            Outcome::UnexpectedPass => "unexpected-pass",
            Outcome::Skip => "skip",
        }
    }

    /// Whether this outcome points at a disagreement between oracles and target.
    pub fn is_finding(self) -> bool {
        matches!(
            self,
            Outcome::Failure | Outcome::UnexpectedNeg | Outcome::UnexpectedPass
        )
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub outcome: Outcome,
    /// The fail pattern found in stderr, for `ExpectedNeg`.
    pub matched: Option<String>,
}

/// Sorts runs into [`Outcome`]s by searching stderr for the item's fail patterns.
///
/// Patterns are regexes; one that does not compile is searched for literally.
#[derive(Debug, Default)]
pub struct Classifier {
    compiled: HashMap<String, Regex>,
}

impl Classifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn classify(&mut self, result: &RunResult, fail_patts: &BTreeSet<String>) -> Classification {
        let expect_fail = !fail_patts.is_empty();
        let outcome = match &result.status {
            ExecutionStatus::Other(_) => Outcome::Skip,
            ExecutionStatus::Timeout => Outcome::Timeout,
            ExecutionStatus::Success if expect_fail => Outcome::UnexpectedPass,
            ExecutionStatus::Success => Outcome::Success,
            ExecutionStatus::Failure(_) if !expect_fail => Outcome::Failure,
            ExecutionStatus::Failure(_) => {
                let stderr = result.output.stderr_lossy();
                let matched = fail_patts
                    .iter()
                    .find(|patt| self.regex_for(patt).is_some_and(|re| re.is_match(&stderr)))
                    .cloned();
                return match matched {
                    Some(patt) => Classification {
                        outcome: Outcome::ExpectedNeg,
                        matched: Some(patt),
                    },
                    None => Classification {
                        outcome: Outcome::UnexpectedNeg,
                        matched: None,
                    },
                };
            }
        };
        Classification {
            outcome,
            matched: None,
        }
    }

    fn regex_for(&mut self, pattern: &str) -> Option<&Regex> {
        if !self.compiled.contains_key(pattern) {
            let regex = match Regex::new(pattern) {
                Ok(re) => re,
                Err(e) => {
                    warn!("Fail pattern {pattern:?} is not a valid regex ({e}), matching literally");
                    Regex::new(&regex::escape(pattern)).ok()?
                }
            };
            self.compiled.insert(pattern.to_string(), regex);
        }
        self.compiled.get(pattern)
    }
}

/// Per-outcome counters for a campaign.
#[derive(Debug, Default, Clone)]
pub struct Tally {
    counts: BTreeMap<Outcome, u64>,
    total: u64,
}

impl Tally {
    pub fn record(&mut self, outcome: Outcome) {
        *self.counts.entry(outcome).or_default() += 1;
        self.total += 1;
    }

    pub fn count(&self, outcome: Outcome) -> u64 {
        self.counts.get(&outcome).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn findings(&self) -> u64 {
        Outcome::ALL
            .iter()
            .filter(|o| o.is_finding())
            .map(|o| self.count(*o))
            .sum()
    }
}

impl fmt::Display for Tally {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = Outcome::ALL
            .iter()
            .map(|o| format!("{o}: {}", self.count(*o)))
            .collect();
        write!(f, "runs: {}, {}", self.total, parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ProcessOutput;
    use std::time::Duration;

    fn run(status: ExecutionStatus, stderr: &str) -> RunResult {
        RunResult {
            status,
            output: ProcessOutput {
                stderr: stderr.as_bytes().to_vec(),
                ..ProcessOutput::default()
            },
            elapsed: Duration::ZERO,
        }
    }

    fn patts(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn failed(stderr: &str) -> RunResult {
        run(ExecutionStatus::Failure("Exited with code 1".into()), stderr)
    }

    #[test]
    fn runs_without_expectations_follow_the_exit_status() {
        let mut classifier = Classifier::new();
        let none = BTreeSet::new();
        assert_eq!(
            classifier.classify(&run(ExecutionStatus::Success, ""), &none).outcome,
            Outcome::Success
        );
        assert_eq!(classifier.classify(&failed("oops"), &none).outcome, Outcome::Failure);
        assert_eq!(
            classifier.classify(&run(ExecutionStatus::Timeout, ""), &none).outcome,
            Outcome::Timeout
        );
        assert_eq!(
            classifier
                .classify(&run(ExecutionStatus::Other("spawn failed".into()), ""), &none)
                .outcome,
            Outcome::Skip
        );
    }

    #[test]
    fn expected_failures_match_stderr_by_regex() {
        let mut classifier = Classifier::new();
        let expected = patts(&["invalid size", r"label .* too long"]);

        let hit = classifier.classify(&failed("mkfs: label 'abc' too long\n"), &expected);
        assert_eq!(hit.outcome, Outcome::ExpectedNeg);
        assert_eq!(hit.matched.as_deref(), Some(r"label .* too long"));

        let miss = classifier.classify(&failed("segmentation fault\n"), &expected);
        assert_eq!(miss.outcome, Outcome::UnexpectedNeg);
        assert_eq!(miss.matched, None);

        let pass = classifier.classify(&run(ExecutionStatus::Success, ""), &expected);
        assert_eq!(pass.outcome, Outcome::UnexpectedPass);
    }

    #[test]
    fn timeout_wins_over_expectations() {
        let mut classifier = Classifier::new();
        let outcome = classifier
            .classify(&run(ExecutionStatus::Timeout, "invalid size"), &patts(&["invalid size"]))
            .outcome;
        assert_eq!(outcome, Outcome::Timeout);
    }

    #[test]
    fn invalid_regex_is_matched_literally() {
        let mut classifier = Classifier::new();
        let expected = patts(&["bad value (x"]);
        assert_eq!(
            classifier.classify(&failed("error: bad value (x=3)"), &expected).outcome,
            Outcome::ExpectedNeg
        );
        assert_eq!(
            classifier.classify(&failed("error: bad value x"), &expected).outcome,
            Outcome::UnexpectedNeg
        );
    }

    #[test]
    fn tally_counts_outcomes_and_findings() {
        let mut tally = Tally::default();
        for outcome in [
            Outcome::Success,
            Outcome::Success,
            Outcome::ExpectedNeg,
            Outcome::UnexpectedPass,
            Outcome::Failure,
        ] {
            tally.record(outcome);
        }
        assert_eq!(tally.total(), 5);
        assert_eq!(tally.count(Outcome::Success), 2);
        assert_eq!(tally.count(Outcome::Skip), 0);
        assert_eq!(tally.findings(), 2);
        let summary = tally.to_string();
        assert!(summary.starts_with("runs: 5, success: 2"), "{summary}");
        assert!(summary.contains("unexpected-pass: 1"), "{summary}");
    }
}
