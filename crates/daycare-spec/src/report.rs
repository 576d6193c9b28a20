//! Normalized pass/fail test outcomes.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Outcome of one named test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Passed,
    Failed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Passed => "passed",
            Outcome::Failed => "failed",
        }
    }
}

/// One test result within a report card.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportCardResult {
    pub name: String,
    pub outcome: Outcome,
    /// Multi-line message meant for a monospace display.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub details: String,
    /// Source location of a failure, usually `file:line`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub context: String,
}

/// The graded outcome of one action run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportCard {
    pub passed: bool,
    #[serde(default)]
    pub note: String,
    #[serde(default)]
    pub results: Vec<ReportCardResult>,
}

impl Default for ReportCard {
    fn default() -> Self {
        Self::new()
    }
}

impl ReportCard {
    /// A fresh report card passes until something fails it.
    pub fn new() -> Self {
        Self {
            passed: true,
            note: String::new(),
            results: Vec::new(),
        }
    }

    /// Mark the card failed and append `note`.
    pub fn fail(&mut self, note: impl AsRef<str>) {
        self.passed = false;
        if !self.note.is_empty() {
            self.note.push_str(", ");
        }
        self.note.push_str(note.as_ref());
    }

    /// Log `note`, then [`fail`](Self::fail) with it.
    pub fn log_and_fail(&mut self, note: impl AsRef<str>) {
        warn!(note = note.as_ref(), "report card failed");
        self.fail(note);
    }

    pub fn add_passed_result(&mut self, name: impl Into<String>, details: impl Into<String>) {
        self.results.push(ReportCardResult {
            name: name.into(),
            outcome: Outcome::Passed,
            details: details.into(),
            context: String::new(),
        });
    }

    /// Append a failed result. This also fails the card.
    pub fn add_failed_result(
        &mut self,
        name: impl Into<String>,
        details: impl Into<String>,
        context: impl Into<String>,
    ) {
        self.passed = false;
        self.results.push(ReportCardResult {
            name: name.into(),
            outcome: Outcome::Failed,
            details: details.into(),
            context: context.into(),
        });
    }

    /// Score on a scale of 0.0 to 1.0.
    ///
    /// A passing card earns full credit. Otherwise the score is the fraction of
    /// passed results, or zero when there are no results.
    pub fn score(&self) -> f64 {
        if self.passed {
            return 1.0;
        }
        if self.results.is_empty() {
            return 0.0;
        }
        let passed = self
            .results
            .iter()
            .filter(|r| r.outcome == Outcome::Passed)
            .count();
        passed as f64 / self.results.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_credit() {
        let mut card = ReportCard::new();
        for i in 0..5 {
            card.add_passed_result(format!("ok {i}"), "");
        }
        card.add_failed_result("bad 1", "boom", "tests/a.cpp:10");
        card.add_failed_result("bad 2", "boom", "");
        assert!(!card.passed);
        assert_eq!(card.score(), 5.0 / 7.0);
    }

    #[test]
    fn test_passed_card_scores_full_regardless_of_results() {
        let mut card = ReportCard::new();
        assert_eq!(card.score(), 1.0);
        card.results.push(ReportCardResult {
            name: "odd".into(),
            outcome: Outcome::Failed,
            details: String::new(),
            context: String::new(),
        });
        assert!(card.passed);
        assert_eq!(card.score(), 1.0);
    }

    #[test]
    fn test_failed_card_without_results_scores_zero() {
        let mut card = ReportCard::new();
        card.fail("no results");
        assert_eq!(card.score(), 0.0);
    }

    #[test]
    fn test_fail_appends_notes() {
        let mut card = ReportCard::new();
        card.fail("first");
        card.log_and_fail("second");
        assert_eq!(card.note, "first, second");
        assert!(!card.passed);
    }

    #[test]
    fn test_result_json() {
        let mut card = ReportCard::new();
        card.add_passed_result("t", "");
        let json = serde_json::to_value(&card).unwrap();
        assert_eq!(json["results"][0]["outcome"], "passed");
        assert!(json["results"][0].get("details").is_none());
    }
}
