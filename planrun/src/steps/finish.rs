//! Finish step: cleanup tasks and guest teardown.
//!
//! Runs even when earlier stages failed so that provisioned guests are
//! never kept around. Counterpart of the prepare step, plus pulling the
//! plan data directory off each guest and stopping and removing guests.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::errors::SpecificationError;
use crate::guest::{Guest, GuestCommand};
use crate::steps::{
    how_matches, parse_scripts, GuestContext, PhaseCommon, StepCommon, StepName, StepStatus,
};

/// Budget for one cleanup script.
const SCRIPT_TIMEOUT: Duration = Duration::from_secs(1800);

/// A configured finish method instance (`shell`).
struct FinishPhase {
    common: PhaseCommon,
    scripts: Vec<String>,
}

impl FinishPhase {
    /// An empty default config contributes no work.
    fn is_bare(&self) -> bool {
        self.scripts.is_empty()
    }
}

fn make_phase(raw: &Map<String, Value>, plan: &str) -> Result<FinishPhase> {
    let common = PhaseCommon::from_raw(raw)?;
    if how_matches(&common.how, "shell") {
        let scripts = parse_scripts(raw, StepName::Finish, plan)?;
        return Ok(FinishPhase { common, scripts });
    }
    Err(SpecificationError::new(format!(
        "Unsupported finish method '{}' in the '{plan}' plan.",
        common.how
    ))
    .into())
}

/// Finish step: cleanup scripts, artifact pull, guest teardown.
pub struct FinishStep {
    pub common: StepCommon,
    phases: Vec<FinishPhase>,
}

impl FinishStep {
    pub fn new(
        plan: &str,
        plan_workdir: &Path,
        data: Option<&Value>,
        enabled: bool,
    ) -> Result<FinishStep> {
        Ok(FinishStep {
            common: StepCommon::new(StepName::Finish, plan, plan_workdir, data, "shell", enabled)?,
            phases: Vec::new(),
        })
    }

    pub fn wake(&mut self, force: bool) -> Result<()> {
        self.common.wake(force)?;
        let mut phases = self
            .common
            .raw_data
            .iter()
            .map(|raw| make_phase(raw, &self.common.plan))
            .collect::<Result<Vec<_>>>()?;
        // Bare default configs carry no cleanup work.
        phases.retain(|phase| !phase.is_bare());
        phases.sort_by_key(|phase| phase.common.order);
        self.phases = phases;
        self.common.commit_wake()
    }

    pub fn standalone_phases(&self) -> usize {
        0
    }

    pub fn go(&mut self, guests: &[Box<dyn Guest>], context: &GuestContext<'_>) -> Result<()> {
        if !self.common.enabled {
            return Ok(());
        }
        if self.common.is_done() {
            context.log.line("    finish: done")?;
            return Ok(());
        }
        context.log.line("    finish")?;

        for guest in guests {
            for phase in &self.phases {
                if !phase.common.enabled_on_guest(guest.name()) {
                    continue;
                }
                for (index, script) in phase.scripts.iter().enumerate() {
                    debug!(phase = %phase.common.name, guest = %guest.name(), %script, "finish");
                    let mut command = GuestCommand::new(script.clone());
                    command.cwd = Some(context.worktree.to_path_buf());
                    command.environment = context.environment.clone();
                    command.timeout = SCRIPT_TIMEOUT;
                    command.output_limit_bytes = context.output_limit_bytes;
                    let output = guest.run(&command)?;

                    let log_path = self
                        .common
                        .workdir
                        .join(format!("{}-{index}.log", phase.common.name));
                    std::fs::write(&log_path, format!("{}{}", output.stdout, output.stderr))
                        .with_context(|| format!("write {}", log_path.display()))?;

                    if output.exit_code != Some(0) {
                        warn!(
                            guest = %guest.name(),
                            %script,
                            exit_code = ?output.exit_code,
                            "cleanup script failed"
                        );
                    }
                }
            }
            // Pull artifacts created in the plan data directory if there
            // was at least one cleanup task.
            if !self.phases.is_empty() {
                guest.pull(context.data_dir)?;
            }
        }

        // Stop and remove provisioned guests.
        for guest in guests {
            guest.stop()?;
            guest.remove()?;
        }

        let tasks = self.phases.iter().map(|phase| phase.scripts.len()).sum::<usize>();
        context.log.line(&format!(
            "        {} completed",
            match tasks {
                1 => "1 task".to_string(),
                count => format!("{count} tasks"),
            }
        ))?;
        self.common.set_status(StepStatus::Done);
        self.common.save()
    }
}
