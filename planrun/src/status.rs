//! Status of run work directories.
//!
//! Built purely on persisted state: the run descriptor plus each step's
//! `step.json`, so progress can be inspected without loading any metadata
//! tree or in-memory pipeline objects.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::warn;

use crate::io::state::read_json_opt;
use crate::run::RunState;
use crate::steps::{StepCommon, StepName, StepStatus, STEPS};

/// Width of the first status column.
const FIRST_COL_LEN: usize = 11;

/// Display the status of runs under the workdir root (or a single run).
pub fn show(workdir_root: &Path, id: Option<&Path>, verbosity: u8) -> Result<()> {
    print_header(verbosity);
    for workdir in runs_to_show(workdir_root, id)? {
        match read_json_opt::<RunState>(&workdir.join("run.json")) {
            Ok(Some(state)) => print_run(&workdir, &state, verbosity)?,
            Ok(None) => {}
            Err(error) => warn!(workdir = %workdir.display(), %error, "failed to load run"),
        }
    }
    Ok(())
}

fn runs_to_show(workdir_root: &Path, id: Option<&Path>) -> Result<Vec<PathBuf>> {
    if let Some(id) = id {
        return Ok(vec![id.to_path_buf()]);
    }
    if !workdir_root.exists() {
        return Ok(Vec::new());
    }
    let mut runs = Vec::new();
    for entry in std::fs::read_dir(workdir_root)
        .with_context(|| format!("read workdir root {}", workdir_root.display()))?
    {
        let entry = entry.context("read workdir root entry")?;
        if entry.path().join("run.json").is_file() {
            runs.push(entry.path());
        }
    }
    runs.sort();
    Ok(runs)
}

fn print_header(verbosity: u8) {
    if verbosity >= 2 {
        let mut header = String::new();
        for step in STEPS {
            header.push_str(&step.as_str()[0..4]);
            header.push(' ');
        }
        header.push_str(" id");
        println!("{header}");
    } else {
        println!("{}id", pad("status"));
    }
}

fn print_run(workdir: &Path, state: &RunState, verbosity: u8) -> Result<()> {
    match verbosity {
        0 => {
            let status = overall_run_status(workdir, state)?;
            println!("{}{}", pad(&status), workdir.display());
        }
        1 => {
            for plan in &state.plans {
                let status = plan_status(&plan_workdir(workdir, plan), &state.steps)?;
                println!("{}{}  {plan}", pad(&status), workdir.display());
            }
        }
        _ => {
            for plan in &state.plans {
                let mut columns = String::new();
                for step in STEPS {
                    let status = StepCommon::read_status(&plan_workdir(workdir, plan), step)?;
                    let column = match status {
                        Some(StepStatus::Done) => "done",
                        Some(StepStatus::Todo) => "todo",
                        None => "----",
                    };
                    columns.push_str(column);
                    columns.push(' ');
                }
                println!("{columns} {}  {plan}", workdir.display());
            }
        }
    }
    Ok(())
}

fn plan_workdir(workdir: &Path, plan: &str) -> PathBuf {
    workdir.join(plan.trim_start_matches('/'))
}

/// Examine a plan's progress: the name of the last finished step, `done`
/// when everything enabled completed, `todo` when nothing ran yet.
fn plan_status(plan_workdir: &Path, enabled: &BTreeSet<StepName>) -> Result<String> {
    let steps: Vec<StepName> = STEPS
        .into_iter()
        .filter(|step| enabled.contains(step))
        .collect();
    let mut last_done = None;
    for (index, step) in steps.iter().enumerate() {
        if StepCommon::read_status(plan_workdir, *step)? == Some(StepStatus::Done) {
            last_done = Some(index);
        }
    }
    Ok(match last_done {
        Some(index) if index + 1 == steps.len() => "done".to_string(),
        Some(index) => steps[index].to_string(),
        None => "todo".to_string(),
    })
}

/// The earliest progress point across all plans of the run.
fn overall_run_status(workdir: &Path, state: &RunState) -> Result<String> {
    let mut earliest: Option<usize> = None;
    for plan in &state.plans {
        let status = plan_status(&plan_workdir(workdir, plan), &state.steps)?;
        if status == "done" {
            continue;
        }
        if status == "todo" {
            return Ok("todo".to_string());
        }
        let index = StepName::from_str(&status)
            .map(StepName::index)
            .unwrap_or_default();
        earliest = Some(earliest.map_or(index, |current| current.min(index)));
    }
    Ok(match earliest {
        None => "done".to_string(),
        Some(index) => STEPS[index].to_string(),
    })
}

fn pad(text: &str) -> String {
    let mut padded = text.to_string();
    while padded.len() < FIRST_COL_LEN {
        padded.push(' ');
    }
    padded
}
