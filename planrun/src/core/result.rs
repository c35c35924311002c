//! Uniform test result model: outcomes, interpretation, aggregation and
//! the process exit code.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::entity::{Interpret, Test};
use crate::errors::SpecificationError;
use crate::exit_codes;

/// Test execution outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pass,
    Fail,
    Info,
    Warn,
    Error,
}

/// All outcomes in display order.
pub const OUTCOMES: [Outcome; 5] = [
    Outcome::Pass,
    Outcome::Fail,
    Outcome::Info,
    Outcome::Warn,
    Outcome::Error,
];

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Pass => "pass",
            Outcome::Fail => "fail",
            Outcome::Info => "info",
            Outcome::Warn => "warn",
            Outcome::Error => "error",
        }
    }

    /// Parse an outcome; any other value is a specification error.
    pub fn from_str(value: &str) -> Result<Outcome, SpecificationError> {
        OUTCOMES
            .into_iter()
            .find(|outcome| outcome.as_str() == value)
            .ok_or_else(|| SpecificationError::new(format!("Invalid result '{value}'.")))
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw outcome data collected by an execute phase, before interpretation.
#[derive(Debug, Clone, Default)]
pub struct ResultData {
    pub log: Vec<PathBuf>,
    pub note: Option<String>,
    pub duration: Option<String>,
}

/// A single interpreted test result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub name: String,
    pub result: Outcome,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub log: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ids: BTreeMap<String, String>,
}

impl TestResult {
    /// Construct a result for a bare name, no interpretation applied.
    pub fn from_name(name: &str, outcome: Outcome, data: ResultData) -> TestResult {
        TestResult {
            name: name.to_string(),
            result: outcome,
            log: data.log,
            note: data.note,
            duration: data.duration,
            ids: BTreeMap::new(),
        }
    }

    /// Construct a result for a test, applying its interpretation policy.
    ///
    /// The test's `result` attribute decides how the raw outcome is
    /// rewritten: `respect` and `custom` keep it, `xfail` swaps pass and
    /// fail, and a fixed outcome replaces it outright. Whenever the outcome
    /// is rewritten a note records the pre-rewrite value. Identification
    /// keys declared on the test are captured for later matching.
    pub fn from_test(test: &Test, outcome: Outcome, data: ResultData) -> TestResult {
        let mut note = data.note;
        let result = match test.result {
            Interpret::Respect | Interpret::Custom => outcome,
            Interpret::Xfail => {
                append_note(&mut note, &format!("original result: {outcome}"));
                match outcome {
                    Outcome::Pass => Outcome::Fail,
                    Outcome::Fail => Outcome::Pass,
                    other => other,
                }
            }
            Interpret::Fixed(fixed) => {
                append_note(&mut note, &format!("original result: {outcome}"));
                fixed
            }
        };

        let mut ids = BTreeMap::new();
        if let Some(id) = &test.core.id {
            ids.insert("id".to_string(), id.clone());
        }
        for (key, value) in &test.extra_ids {
            ids.insert(key.clone(), value.clone());
        }

        TestResult {
            name: test.core.name.clone(),
            result,
            log: data.log,
            note,
            duration: data.duration,
            ids,
        }
    }

    /// One line of human readable output: outcome, name and optional note.
    pub fn show(&self) -> String {
        // Keep the outcome column four characters wide.
        let outcome = if self.result == Outcome::Error {
            "errr"
        } else {
            self.result.as_str()
        };
        match &self.note {
            Some(note) => format!("{outcome} {} ({note})", self.name),
            None => format!("{outcome} {}", self.name),
        }
    }
}

fn append_note(note: &mut Option<String>, addition: &str) {
    match note {
        Some(existing) => {
            existing.push_str(", ");
            existing.push_str(addition);
        }
        None => *note = Some(addition.to_string()),
    }
}

/// Count results per outcome kind; all five kinds are always present.
pub fn total(results: &[TestResult]) -> BTreeMap<Outcome, usize> {
    let mut stats: BTreeMap<Outcome, usize> =
        OUTCOMES.into_iter().map(|outcome| (outcome, 0)).collect();
    for result in results {
        *stats.entry(result.result).or_insert(0) += 1;
    }
    stats
}

/// Render a human summary sentence for the given results.
pub fn summary(results: &[TestResult]) -> String {
    let stats = total(results);
    let mut comments = Vec::new();
    let count = |outcome: Outcome| stats[&outcome];

    if count(Outcome::Pass) > 0 {
        comments.push(format!("{} passed", listed(count(Outcome::Pass), "test")));
    }
    if count(Outcome::Fail) > 0 {
        comments.push(format!("{} failed", listed(count(Outcome::Fail), "test")));
    }
    if count(Outcome::Info) > 0 {
        comments.push(listed(count(Outcome::Info), "info"));
    }
    if count(Outcome::Warn) > 0 {
        comments.push(listed(count(Outcome::Warn), "warn"));
    }
    if count(Outcome::Error) > 0 {
        comments.push(listed(count(Outcome::Error), "error"));
    }

    if comments.is_empty() {
        return "no results found".to_string();
    }
    join_listed(&comments)
}

fn listed(count: usize, noun: &str) -> String {
    if count == 1 {
        format!("1 {noun}")
    } else {
        format!("{count} {noun}s")
    }
}

fn join_listed(items: &[String]) -> String {
    match items {
        [] => String::new(),
        [only] => only.clone(),
        [head @ .., last] => format!("{} and {last}", head.join(", ")),
    }
}

/// Compute the process exit code from overall result totals.
///
/// No results at all exit 3, any error 2, any fail or warn 1, any pass 0.
/// The trailing branch covers the degenerate info-only case and maps it to
/// the generic error code.
pub fn exit_code(results: &[TestResult]) -> i32 {
    let stats = total(results);
    let count = |outcome: Outcome| stats[&outcome];

    if results.is_empty() {
        return exit_codes::NO_RESULTS;
    }
    if count(Outcome::Error) > 0 {
        return exit_codes::ERROR;
    }
    if count(Outcome::Fail) + count(Outcome::Warn) > 0 {
        return exit_codes::FAIL;
    }
    if count(Outcome::Pass) > 0 {
        return exit_codes::OK;
    }
    exit_codes::ERROR
}
