//! Provision step: prepare guests for testing.

use std::path::Path;

use anyhow::Result;
use serde_json::{Map, Value};
use tracing::debug;

use crate::errors::SpecificationError;
use crate::guest::{Guest, GuestRecord, LocalGuest};
use crate::io::run_log::RunLog;
use crate::io::state::{read_json_opt, write_json};
use crate::steps::{how_matches, PhaseCommon, StepCommon, StepName, StepStatus};

/// A configured provision method instance.
struct ProvisionPhase {
    common: PhaseCommon,
}

impl ProvisionPhase {
    fn provision(&self) -> Box<dyn Guest> {
        Box::new(LocalGuest::new(self.common.name.clone()))
    }
}

fn make_phase(raw: &Map<String, Value>, plan: &str) -> Result<ProvisionPhase> {
    let common = PhaseCommon::from_raw(raw)?;
    if how_matches(&common.how, "local") {
        return Ok(ProvisionPhase { common });
    }
    Err(SpecificationError::new(format!(
        "Unsupported provision method '{}' in the '{plan}' plan.",
        common.how
    ))
    .into())
}

/// Provision step: instantiates one guest per configured phase.
pub struct ProvisionStep {
    pub common: StepCommon,
    phases: Vec<ProvisionPhase>,
    guests: Vec<Box<dyn Guest>>,
}

impl ProvisionStep {
    pub fn new(
        plan: &str,
        plan_workdir: &Path,
        data: Option<&Value>,
        enabled: bool,
    ) -> Result<ProvisionStep> {
        Ok(ProvisionStep {
            common: StepCommon::new(
                StepName::Provision,
                plan,
                plan_workdir,
                data,
                "local",
                enabled,
            )?,
            phases: Vec::new(),
            guests: Vec::new(),
        })
    }

    fn guests_path(&self) -> std::path::PathBuf {
        self.common.workdir.join("guests.json")
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

        // Restore active guests from the saved records.
        if self.common.is_done() {
            if let Some(records) = read_json_opt::<Vec<GuestRecord>>(&self.guests_path())? {
                debug!(count = records.len(), "restoring guests");
                self.guests = records
                    .into_iter()
                    .map(|record| Box::new(LocalGuest::new(record.name)) as Box<dyn Guest>)
                    .collect();
            }
        }
        self.common.commit_wake()
    }

    pub fn standalone_phases(&self) -> usize {
        // No shipped provision method requires standalone execution.
        0
    }

    pub fn go(&mut self, log: &RunLog) -> Result<()> {
        if !self.common.enabled {
            return Ok(());
        }
        if self.common.is_done() {
            log.line(&format!(
                "    provision: done ({} guests ready)",
                self.guests.len()
            ))?;
            return Ok(());
        }
        log.line("    provision")?;
        let mut records = Vec::new();
        for phase in &self.phases {
            debug!(phase = %phase.common.name, how = %phase.common.how, "provisioning guest");
            let guest = phase.provision();
            log.line(&format!("        guest '{}' ready", guest.name()))?;
            records.push(GuestRecord {
                name: guest.name().to_string(),
                how: phase.common.how.clone(),
            });
            self.guests.push(guest);
        }
        write_json(&self.guests_path(), &records)?;
        self.common.set_status(StepStatus::Done);
        self.common.save()
    }

    /// Guests available for the following steps.
    pub fn guests(&self) -> &[Box<dyn Guest>] {
        &self.guests
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn provisions_local_guests_and_persists_records() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = RunLog::new(temp.path());
        let mut step = ProvisionStep::new(
            "/plans/smoke",
            temp.path(),
            Some(&json!({"how": "local"})),
            true,
        )
        .expect("step");
        step.wake(false).expect("wake");
        step.go(&log).expect("go");

        assert_eq!(step.guests().len(), 1);
        assert_eq!(step.guests()[0].name(), "default-0");

        let records: Vec<GuestRecord> =
            crate::io::state::read_json(&temp.path().join("provision/guests.json"))
                .expect("records");
        assert_eq!(records[0].how, "local");
    }

    #[test]
    fn wake_restores_guests_after_done() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = RunLog::new(temp.path());
        let mut step =
            ProvisionStep::new("/plans/smoke", temp.path(), None, true).expect("step");
        step.wake(false).expect("wake");
        step.go(&log).expect("go");

        let mut resumed =
            ProvisionStep::new("/plans/smoke", temp.path(), None, true).expect("step");
        resumed.wake(false).expect("wake");
        assert!(resumed.common.is_done());
        assert_eq!(resumed.guests().len(), 1);

        // Going again must not provision a second guest.
        resumed.go(&log).expect("go");
        assert_eq!(resumed.guests().len(), 1);
    }

    #[test]
    fn unknown_method_is_a_specification_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut step = ProvisionStep::new(
            "/plans/smoke",
            temp.path(),
            Some(&json!({"how": "cloud"})),
            true,
        )
        .expect("step");
        let err = step.wake(false).unwrap_err();
        assert!(crate::errors::is_specification_error(&err));
    }
}
