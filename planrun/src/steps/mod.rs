//! Pipeline step machinery shared by all six stages.
//!
//! A step owns an ordered sequence of plugin instances ("phases") built
//! from its raw per-stage configuration. Its lifecycle is a small state
//! machine: `todo` after wake, `done` once `go` completed and persisted.
//! Status lives in `step.json` inside the step workdir and is readable
//! without any in-memory objects, so external tooling can query progress
//! from the workdir alone.

pub mod discover;
pub mod execute;
pub mod finish;
pub mod prepare;
pub mod provision;
pub mod report;

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::core::entity::DEFAULT_ORDER;
use crate::errors::SpecificationError;
use crate::io::state::{read_json_opt, write_json};

/// The six pipeline stages in fixed execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepName {
    Discover,
    Provision,
    Prepare,
    Execute,
    Report,
    Finish,
}

pub const STEPS: [StepName; 6] = [
    StepName::Discover,
    StepName::Provision,
    StepName::Prepare,
    StepName::Execute,
    StepName::Report,
    StepName::Finish,
];

impl StepName {
    pub fn as_str(self) -> &'static str {
        match self {
            StepName::Discover => "discover",
            StepName::Provision => "provision",
            StepName::Prepare => "prepare",
            StepName::Execute => "execute",
            StepName::Report => "report",
            StepName::Finish => "finish",
        }
    }

    pub fn from_str(value: &str) -> Option<StepName> {
        STEPS.into_iter().find(|step| step.as_str() == value)
    }

    /// Position within the fixed stage ordering.
    pub fn index(self) -> usize {
        STEPS.iter().position(|step| *step == self).expect("known step")
    }
}

impl std::fmt::Display for StepName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step execution status.
///
/// `todo` means config, data and command line are processed (we know what
/// to do); `done` means the final result of the step is stored in the
/// workdir.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Todo,
    Done,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            StepStatus::Todo => "todo",
            StepStatus::Done => "done",
        })
    }
}

/// Resolve a step-range selection into the set of enabled steps.
///
/// `since`/`until` are inclusive bounds, `after`/`before` exclusive ones;
/// the result is a contiguous index range over the fixed ordering minus
/// anything in `skip`.
#[derive(Debug, Clone, Default)]
pub struct StepRange {
    pub since: Option<StepName>,
    pub until: Option<StepName>,
    pub after: Option<StepName>,
    pub before: Option<StepName>,
    pub skip: Vec<StepName>,
}

impl StepRange {
    pub fn is_empty(&self) -> bool {
        self.since.is_none()
            && self.until.is_none()
            && self.after.is_none()
            && self.before.is_none()
            && self.skip.is_empty()
    }

    pub fn resolve(&self) -> BTreeSet<StepName> {
        let first = match (self.since, self.after) {
            (Some(since), _) => since.index(),
            (None, Some(after)) => after.index() + 1,
            (None, None) => 0,
        };
        let last = match (self.until, self.before) {
            (Some(until), _) => until.index() as isize,
            (None, Some(before)) => before.index() as isize - 1,
            (None, None) => STEPS.len() as isize - 1,
        };
        let mut enabled = BTreeSet::new();
        for index in first..STEPS.len() {
            if index as isize > last {
                break;
            }
            let step = STEPS[index];
            if !self.skip.contains(&step) {
                enabled.insert(step);
            }
        }
        enabled
    }
}

/// Persisted step state (`step.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StepState {
    status: StepStatus,
    data: Vec<Map<String, Value>>,
}

/// Attributes shared by all phase configurations.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseCommon {
    pub name: String,
    pub how: String,
    pub order: i64,
    pub summary: Option<String>,
    /// Restrict the phase to a particular guest.
    pub where_: Option<String>,
}

impl PhaseCommon {
    pub fn from_raw(raw: &Map<String, Value>) -> Result<PhaseCommon, SpecificationError> {
        let field = |key: &str| -> Result<Option<String>, SpecificationError> {
            match raw.get(key) {
                None | Some(Value::Null) => Ok(None),
                Some(Value::String(text)) => Ok(Some(text.clone())),
                Some(other) => Err(SpecificationError::new(format!(
                    "Phase '{key}' should be a string, got '{other}'."
                ))),
            }
        };
        let order = match raw.get("order") {
            None | Some(Value::Null) => DEFAULT_ORDER,
            Some(Value::Number(number)) => number.as_i64().ok_or_else(|| {
                SpecificationError::new("Phase 'order' should be an integer.".to_string())
            })?,
            Some(other) => {
                return Err(SpecificationError::new(format!(
                    "Phase 'order' should be an integer, got '{other}'."
                )));
            }
        };
        Ok(PhaseCommon {
            name: field("name")?.unwrap_or_default(),
            how: field("how")?.unwrap_or_default(),
            order,
            summary: field("summary")?,
            where_: field("where")?,
        })
    }

    /// Phases are enabled across all guests unless `where` limits them.
    pub fn enabled_on_guest(&self, guest_name: &str) -> bool {
        match &self.where_ {
            Some(where_) => where_ == guest_name,
            None => true,
        }
    }
}

/// Whether a configured `how` selects the given method (prefix match).
pub fn how_matches(configured: &str, method: &str) -> bool {
    method.starts_with(configured)
}

/// Normalize raw per-stage configuration into a list of phase mappings.
///
/// Accepts nothing (one empty config), a single mapping, or a list of
/// mappings. Every entry receives a default unique `name` and the step's
/// default `how` when missing.
pub fn normalize_raw_configs(
    data: Option<&Value>,
    default_how: &str,
) -> Result<Vec<Map<String, Value>>, SpecificationError> {
    let mut raw_configs: Vec<Map<String, Value>> = match data {
        None | Some(Value::Null) => vec![Map::new()],
        Some(Value::Object(mapping)) => vec![mapping.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::Object(mapping) => Ok(mapping.clone()),
                other => Err(SpecificationError::new(format!(
                    "Invalid step configuration entry '{other}'."
                ))),
            })
            .collect::<Result<_, _>>()?,
        Some(other) => {
            return Err(SpecificationError::new(format!(
                "Invalid step configuration '{other}'."
            )));
        }
    };

    for (index, raw) in raw_configs.iter_mut().enumerate() {
        if raw.get("name").and_then(Value::as_str).is_none() {
            raw.insert(
                "name".to_string(),
                Value::String(format!("default-{index}")),
            );
        }
        if raw.get("how").and_then(Value::as_str).is_none() {
            raw.insert("how".to_string(), Value::String(default_how.to_string()));
        }
    }
    Ok(raw_configs)
}

/// State shared by all six concrete steps.
#[derive(Debug, Clone)]
pub struct StepCommon {
    pub step: StepName,
    pub plan: String,
    pub workdir: PathBuf,
    pub enabled: bool,
    pub raw_data: Vec<Map<String, Value>>,
    status: Option<StepStatus>,
}

impl StepCommon {
    pub fn new(
        step: StepName,
        plan: &str,
        plan_workdir: &Path,
        data: Option<&Value>,
        default_how: &str,
        enabled: bool,
    ) -> Result<StepCommon, SpecificationError> {
        let raw_data = normalize_raw_configs(data, default_how).map_err(|error| {
            SpecificationError::new(format!("Invalid '{step}' config in '{plan}': {error}"))
        })?;
        Ok(StepCommon {
            step,
            plan: plan.to_string(),
            workdir: plan_workdir.join(step.as_str()),
            enabled,
            raw_data,
            status: None,
        })
    }

    fn state_path(&self) -> PathBuf {
        self.workdir.join("step.json")
    }

    /// Current in-memory status.
    pub fn status(&self) -> Option<StepStatus> {
        self.status
    }

    pub fn set_status(&mut self, status: StepStatus) {
        if self.status != Some(status) {
            debug!(step = %self.step, plan = %self.plan, %status, "step status");
            self.status = Some(status);
        }
    }

    pub fn is_done(&self) -> bool {
        self.status == Some(StepStatus::Done)
    }

    /// Load status and step data from the workdir, if present.
    pub fn load(&mut self) -> Result<()> {
        match read_json_opt::<StepState>(&self.state_path())? {
            Some(state) => {
                debug!(step = %self.step, plan = %self.plan, "restored step state");
                self.raw_data = state.data;
                self.status = Some(state.status);
            }
            None => debug!(step = %self.step, plan = %self.plan, "no persisted step state"),
        }
        Ok(())
    }

    /// Save status and step data to the workdir.
    pub fn save(&self) -> Result<()> {
        let state = StepState {
            status: self.status.unwrap_or(StepStatus::Todo),
            data: self.raw_data.clone(),
        };
        write_json(&self.state_path(), &state)
    }

    /// Restore previously saved state.
    ///
    /// A step found in `todo` was interrupted mid-way; its workdir is
    /// cleaned up to give it a fresh start. A step already `done` keeps
    /// its data untouched so a repeated wake never duplicates work.
    pub fn wake(&mut self, force: bool) -> Result<()> {
        if force {
            self.cleanup()?;
        }
        self.load()?;
        if self.status == Some(StepStatus::Todo) {
            debug!(step = %self.step, "step has not finished, retrying from scratch");
            self.cleanup()?;
        }
        fs::create_dir_all(&self.workdir)
            .with_context(|| format!("create step workdir {}", self.workdir.display()))?;
        Ok(())
    }

    /// Record that the step knows what to do and persist it, unless it is
    /// already done.
    pub fn commit_wake(&mut self) -> Result<()> {
        if self.is_done() {
            debug!(step = %self.step, "wake complete (already done before)");
            return Ok(());
        }
        self.set_status(StepStatus::Todo);
        self.save()
    }

    fn cleanup(&mut self) -> Result<()> {
        if self.workdir.exists() {
            fs::remove_dir_all(&self.workdir)
                .with_context(|| format!("remove step workdir {}", self.workdir.display()))?;
        }
        self.status = None;
        Ok(())
    }

    /// Pure read of persisted status, independent of in-memory objects.
    pub fn read_status(plan_workdir: &Path, step: StepName) -> Result<Option<StepStatus>> {
        let path = plan_workdir.join(step.as_str()).join("step.json");
        Ok(read_json_opt::<StepState>(&path)?.map(|state| state.status))
    }
}

/// Context handed to guest-facing steps (prepare, execute, finish).
pub struct GuestContext<'a> {
    pub worktree: &'a Path,
    pub data_dir: &'a Path,
    pub environment: &'a std::collections::BTreeMap<String, String>,
    pub log: &'a crate::io::run_log::RunLog,
    pub output_limit_bytes: usize,
}

/// Parse a `script` key: a single command or a list of commands.
pub fn parse_scripts(
    raw: &Map<String, Value>,
    step: StepName,
    plan: &str,
) -> Result<Vec<String>, SpecificationError> {
    match raw.get("script") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(script)) => Ok(vec![script.clone()]),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| {
                    SpecificationError::new(format!(
                        "The '{step}' script in '{plan}' should be a string, got '{item}'."
                    ))
                })
            })
            .collect(),
        Some(other) => Err(SpecificationError::new(format!(
            "The '{step}' script in '{plan}' should be a string or a list, got '{other}'."
        ))),
    }
}

/// Check standalone-mode requests across all steps of a plan.
///
/// Exactly one phase per step may require standalone execution. More than
/// one within the same step, or requests from more than one step, is a
/// fatal configuration error. A single request forces that step alone to
/// run this invocation.
pub fn detect_standalone(counts: &[(StepName, usize)]) -> Result<Option<StepName>> {
    let mut standalone = Vec::new();
    for (step, count) in counts {
        match count {
            0 => {}
            1 => standalone.push(*step),
            _ => bail!(
                "Step '{step}' has multiple plugin configs which require running on \
                 their own. Combination of such configs is not possible."
            ),
        }
    }
    match standalone.as_slice() {
        [] => Ok(None),
        [single] => Ok(Some(*single)),
        many => {
            let listed = many
                .iter()
                .map(|step| format!("'{step}'"))
                .collect::<Vec<_>>()
                .join(" and ");
            bail!(
                "These steps require running on their own, their combination \
                 with the given options is not compatible: {listed}."
            );
        }
    }
}
