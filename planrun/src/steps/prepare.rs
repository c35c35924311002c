//! Prepare step: get the guests ready for test execution.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde_json::{Map, Value};
use tracing::debug;

use crate::errors::SpecificationError;
use crate::guest::{Guest, GuestCommand};
use crate::steps::{
    how_matches, parse_scripts, GuestContext, PhaseCommon, StepCommon, StepName, StepStatus,
};

/// Budget for one preparation script.
const SCRIPT_TIMEOUT: Duration = Duration::from_secs(1800);

/// A configured prepare method instance (`shell`).
struct PreparePhase {
    common: PhaseCommon,
    scripts: Vec<String>,
}

fn make_phase(raw: &Map<String, Value>, plan: &str) -> Result<PreparePhase> {
    let common = PhaseCommon::from_raw(raw)?;
    if how_matches(&common.how, "shell") {
        let scripts = parse_scripts(raw, StepName::Prepare, plan)?;
        return Ok(PreparePhase { common, scripts });
    }
    Err(SpecificationError::new(format!(
        "Unsupported prepare method '{}' in the '{plan}' plan.",
        common.how
    ))
    .into())
}

/// Prepare step: runs configured scripts on every guest.
pub struct PrepareStep {
    pub common: StepCommon,
    phases: Vec<PreparePhase>,
}

impl PrepareStep {
    pub fn new(
        plan: &str,
        plan_workdir: &Path,
        data: Option<&Value>,
        enabled: bool,
    ) -> Result<PrepareStep> {
        Ok(PrepareStep {
            common: StepCommon::new(StepName::Prepare, plan, plan_workdir, data, "shell", enabled)?,
            phases: Vec::new(),
        })
    }

    pub fn wake(&mut self, force: bool) -> Result<()> {
        self.common.wake(force)?;
        self.phases = self
            .common
            .raw_data
            .iter()
            .map(|raw| make_phase(raw, &self.common.plan))
            .collect::<Result<Vec<_>>>()?;
        self.phases.sort_by_key(|phase| phase.common.order);
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
            context.log.line("    prepare: done")?;
            return Ok(());
        }
        context.log.line("    prepare")?;
        for guest in guests {
            for phase in &self.phases {
                if !phase.common.enabled_on_guest(guest.name()) {
                    continue;
                }
                for (index, script) in phase.scripts.iter().enumerate() {
                    debug!(phase = %phase.common.name, guest = %guest.name(), %script, "prepare");
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
                        bail!(
                            "Preparation script '{script}' failed on guest '{}' \
                             (exit code {:?}).",
                            guest.name(),
                            output.exit_code
                        );
                    }
                }
            }
        }
        self.common.set_status(StepStatus::Done);
        self.common.save()
    }
}
