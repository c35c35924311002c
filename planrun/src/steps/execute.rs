//! Execute step: run discovered tests and interpret their outcomes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::core::duration::parse_duration;
use crate::core::entity::Test;
use crate::core::result::{Outcome, ResultData, TestResult};
use crate::errors::SpecificationError;
use crate::guest::{Guest, GuestCommand, GuestOutput};
use crate::steps::{how_matches, GuestContext, PhaseCommon, StepCommon, StepName, StepStatus};

/// Test data directory name inside the step workdir.
const TEST_DATA: &str = "data";

/// The main test output filename.
const TEST_OUTPUT_FILENAME: &str = "output.txt";

/// Default test framework when none is declared.
const DEFAULT_FRAMEWORK: &str = "shell";

/// Persisted per-test result entry (`results.json`, keyed by test name).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ResultRecord {
    result: Outcome,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    log: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    duration: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    ids: BTreeMap<String, String>,
}

/// The internal test executor (`shell` method).
struct ExecutePhase {
    common: PhaseCommon,
    /// Stop execution after the first failing test.
    exit_first: bool,
}

fn make_phase(raw: &Map<String, Value>, plan: &str) -> Result<ExecutePhase> {
    let common = PhaseCommon::from_raw(raw)?;
    if !how_matches(&common.how, "shell") {
        return Err(SpecificationError::new(format!(
            "Unsupported execute method '{}' in the '{plan}' plan.",
            common.how
        ))
        .into());
    }
    let exit_first = match raw.get("exit-first") {
        None | Some(Value::Null) => false,
        Some(Value::Bool(flag)) => *flag,
        Some(other) => {
            return Err(SpecificationError::new(format!(
                "The 'exit-first' in '{plan}' should be a boolean, got '{other}'."
            ))
            .into());
        }
    };
    Ok(ExecutePhase { common, exit_first })
}

/// Execute step: drives tests on guests and collects results.
pub struct ExecuteStep {
    pub common: StepCommon,
    phase: Option<ExecutePhase>,
    results: Vec<TestResult>,
}

impl ExecuteStep {
    pub fn new(
        plan: &str,
        plan_workdir: &Path,
        data: Option<&Value>,
        enabled: bool,
    ) -> Result<ExecuteStep> {
        Ok(ExecuteStep {
            common: StepCommon::new(StepName::Execute, plan, plan_workdir, data, "shell", enabled)?,
            phase: None,
            results: Vec::new(),
        })
    }

    fn results_path(&self) -> PathBuf {
        self.common.workdir.join("results.json")
    }

    pub fn wake(&mut self, force: bool) -> Result<()> {
        self.common.wake(force)?;

        // There must be just a single execute configuration.
        if self.common.raw_data.len() > 1 {
            return Err(SpecificationError::new(format!(
                "Multiple execute steps defined in '{}'.",
                self.common.plan
            ))
            .into());
        }
        self.phase = Some(make_phase(&self.common.raw_data[0], &self.common.plan)?);

        // Restore results from the previous invocation.
        if self.common.is_done() {
            if let Some(records) =
                crate::io::state::read_json_opt::<BTreeMap<String, ResultRecord>>(
                    &self.results_path(),
                )?
            {
                self.results = records
                    .into_iter()
                    .map(|(name, record)| TestResult {
                        name,
                        result: record.result,
                        log: record.log,
                        note: record.note,
                        duration: record.duration,
                        ids: record.ids,
                    })
                    .collect();
            }
        }
        self.common.commit_wake()
    }

    pub fn standalone_phases(&self) -> usize {
        0
    }

    pub fn go(
        &mut self,
        guests: &[Box<dyn Guest>],
        tests: &[Test],
        context: &GuestContext<'_>,
    ) -> Result<()> {
        if !self.common.enabled {
            return Ok(());
        }
        if self.common.is_done() {
            context.log.line(&format!(
                "    execute: done ({} executed)",
                listed(self.results.len(), "test")
            ))?;
            return Ok(());
        }
        context.log.line("    execute")?;

        if guests.is_empty() {
            bail!("No guests available for execution.");
        }
        let Some(phase) = self.phase.as_ref() else {
            bail!("Execute step has not been woken up.");
        };

        'guests: for guest in guests {
            if !phase.common.enabled_on_guest(guest.name()) {
                continue;
            }
            for test in tests {
                let result = self.execute_test(guest.as_ref(), test, context)?;
                context.log.line(&format!("        {}", result.show()))?;
                let stop = phase.exit_first
                    && matches!(result.result, Outcome::Fail | Outcome::Error);
                self.results.push(result);
                if stop {
                    context
                        .log
                        .line("        stopping after the first failure")?;
                    break 'guests;
                }
            }
        }

        self.save_results()?;
        context.log.line(&format!(
            "        {} executed",
            listed(self.results.len(), "test")
        ))?;
        self.common.set_status(StepStatus::Done);
        self.common.save()
    }

    /// Run a single test and interpret its outcome.
    fn execute_test(
        &self,
        guest: &dyn Guest,
        test: &Test,
        context: &GuestContext<'_>,
    ) -> Result<TestResult> {
        let data_dir = self.test_data_dir(&test.core.name);
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("create test data dir {}", data_dir.display()))?;

        let timeout = parse_duration(&test.duration).map_err(|error| {
            SpecificationError::new(format!(
                "Invalid duration in test '{}': {error}",
                test.core.name
            ))
        })?;

        let cwd = context
            .worktree
            .join(test.path.trim_start_matches('/'));
        let mut environment = context.environment.clone();
        environment.extend(test.environment.clone());

        let mut command = GuestCommand::new(test.test.clone());
        command.cwd = Some(cwd);
        command.environment = environment;
        command.timeout = timeout;
        command.output_limit_bytes = context.output_limit_bytes;

        debug!(test = %test.core.name, guest = %guest.name(), "executing test");
        let started = Instant::now();
        let output = guest.run(&command)?;
        let elapsed = started.elapsed().as_secs();

        let output_path = data_dir.join(TEST_OUTPUT_FILENAME);
        std::fs::write(
            &output_path,
            format!("{}{}", output.stdout, output.stderr),
        )
        .with_context(|| format!("write {}", output_path.display()))?;

        let framework = test.framework.as_deref().unwrap_or(DEFAULT_FRAMEWORK);
        let (outcome, note) = if output.timed_out {
            self.timeout_hint(&output_path, &test.duration)?;
            (Outcome::Error, Some("timeout".to_string()))
        } else if framework == "beakerlib" {
            check_beakerlib(&data_dir)
        } else {
            check_shell(&output)
        };

        let mut logs = vec![relative_log(&output_path, &self.common.workdir)];
        let journal = data_dir.join("journal.txt");
        if journal.is_file() {
            logs.push(relative_log(&journal, &self.common.workdir));
        }

        let data = ResultData {
            log: logs,
            note,
            duration: Some(format_duration(elapsed)),
        };
        Ok(TestResult::from_test(test, outcome, data))
    }

    fn test_data_dir(&self, test_name: &str) -> PathBuf {
        self.common
            .workdir
            .join(TEST_DATA)
            .join(test_name.trim_start_matches('/'))
    }

    /// Append a duration increase hint to the test output.
    fn timeout_hint(&self, output_path: &Path, duration: &str) -> Result<()> {
        let hint = format!(
            "\nMaximum test time '{duration}' exceeded.\n\
             Adjust the test 'duration' attribute if necessary.\n"
        );
        let mut contents = std::fs::read_to_string(output_path).unwrap_or_default();
        contents.push_str(&hint);
        std::fs::write(output_path, contents)
            .with_context(|| format!("write {}", output_path.display()))?;
        Ok(())
    }

    fn save_results(&self) -> Result<()> {
        let records: BTreeMap<String, ResultRecord> = self
            .results
            .iter()
            .map(|result| {
                (
                    result.name.clone(),
                    ResultRecord {
                        result: result.result,
                        log: result.log.clone(),
                        note: result.note.clone(),
                        duration: result.duration.clone(),
                        ids: result.ids.clone(),
                    },
                )
            })
            .collect();
        crate::io::state::write_json(&self.results_path(), &records)
    }

    /// Results from executed tests.
    pub fn results(&self) -> &[TestResult] {
        &self.results
    }

    /// Packages which need to be installed on the guest so that the given
    /// tests can be executed. Used by provisioning tooling.
    pub fn requires(tests: &[Test]) -> Vec<String> {
        let mut packages: Vec<String> = tests
            .iter()
            .flat_map(|test| test.require.iter())
            .filter_map(|requirement| match requirement {
                crate::core::entity::Requirement::Name(name) => Some(name.clone()),
                crate::core::entity::Requirement::Id(_) => None,
            })
            .collect();
        packages.sort();
        packages.dedup();
        packages
    }
}

/// Interpret the outcome of a plain shell test from its exit code.
fn check_shell(output: &GuestOutput) -> (Outcome, Option<String>) {
    match output.exit_code {
        Some(0) => (Outcome::Pass, None),
        Some(1) => (Outcome::Fail, None),
        code => (Outcome::Error, Some(format!("exit code {code:?}"))),
    }
}

/// Interpret the outcome of a beakerlib test from its `TestResults` file.
fn check_beakerlib(data_dir: &Path) -> (Outcome, Option<String>) {
    let results_path = data_dir.join("TestResults");
    let contents = match std::fs::read_to_string(&results_path) {
        Ok(contents) => contents,
        Err(_) => {
            return (
                Outcome::Error,
                Some("beakerlib: TestResults missing".to_string()),
            );
        }
    };

    let result_regex = Regex::new("TESTRESULT_RESULT_STRING=(.*)").expect("static regex");
    // States are: started, incomplete and complete.
    let state_regex = Regex::new("TESTRESULT_STATE=\"?(\\w+)\"?").expect("static regex");

    let result = result_regex
        .captures(&contents)
        .map(|captures| captures[1].trim().to_string());
    let state = state_regex
        .captures(&contents)
        .map(|captures| captures[1].to_string());

    let (Some(result), Some(state)) = (result, state) else {
        return (
            Outcome::Error,
            Some("beakerlib: Result/State missing".to_string()),
        );
    };

    if state != "complete" {
        return (Outcome::Error, Some(format!("beakerlib: State '{state}'")));
    }
    match Outcome::from_str(&result.to_lowercase()) {
        Ok(outcome) => (outcome, None),
        Err(_) => (
            Outcome::Error,
            Some(format!("beakerlib: invalid result '{result}'")),
        ),
    }
}

fn relative_log(path: &Path, workdir: &Path) -> PathBuf {
    path.strip_prefix(workdir).unwrap_or(path).to_path_buf()
}

/// Convert an elapsed time in seconds to `hh:mm:ss`.
fn format_duration(seconds: u64) -> String {
    format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60
    )
}

fn listed(count: usize, noun: &str) -> String {
    match count {
        1 => format!("1 {noun}"),
        other => format!("{other} {noun}s"),
    }
}
