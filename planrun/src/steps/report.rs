//! Report step: present collected test results.

use std::path::Path;

use anyhow::{Context, Result};
use minijinja::{context, Environment};
use serde_json::{Map, Value};

use crate::core::result::{summary, TestResult};
use crate::errors::SpecificationError;
use crate::io::run_log::RunLog;
use crate::steps::{how_matches, PhaseCommon, StepCommon, StepName, StepStatus};

const REPORT_TEMPLATE: &str = include_str!("../../templates/report.html.j2");

enum ReportMethod {
    /// Print results to the terminal and the run log.
    Display,
    /// Render a static HTML page into the step workdir.
    Html,
}

struct ReportPhase {
    common: PhaseCommon,
    method: ReportMethod,
}

fn make_phase(raw: &Map<String, Value>, plan: &str) -> Result<ReportPhase> {
    let common = PhaseCommon::from_raw(raw)?;
    let method = if how_matches(&common.how, "display") {
        ReportMethod::Display
    } else if how_matches(&common.how, "html") {
        ReportMethod::Html
    } else {
        return Err(SpecificationError::new(format!(
            "Unsupported report method '{}' in the '{plan}' plan.",
            common.how
        ))
        .into());
    };
    Ok(ReportPhase { common, method })
}

/// Report step: runs each configured report phase over the results.
pub struct ReportStep {
    pub common: StepCommon,
    phases: Vec<ReportPhase>,
}

impl ReportStep {
    pub fn new(
        plan: &str,
        plan_workdir: &Path,
        data: Option<&Value>,
        enabled: bool,
    ) -> Result<ReportStep> {
        Ok(ReportStep {
            common: StepCommon::new(StepName::Report, plan, plan_workdir, data, "display", enabled)?,
            phases: Vec::new(),
        })
    }

    pub fn wake(&mut self, _force: bool) -> Result<()> {
        // Reporting is repeatable; force a fresh start so `run --last
        // report` always renders current results.
        self.common.wake(true)?;
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

    pub fn go(&mut self, results: &[TestResult], log: &RunLog) -> Result<()> {
        if !self.common.enabled {
            return Ok(());
        }
        log.line("    report")?;
        for phase in &self.phases {
            match phase.method {
                ReportMethod::Display => {
                    for result in results {
                        log.line(&format!("        {}", result.show()))?;
                    }
                    log.line(&format!("        summary: {}", summary(results)))?;
                }
                ReportMethod::Html => {
                    let path = self.common.workdir.join("report.html");
                    let page = render_html(&self.common.plan, results)?;
                    std::fs::write(&path, page)
                        .with_context(|| format!("write {}", path.display()))?;
                    log.line(&format!("        report written to {}", path.display()))?;
                }
            }
        }
        self.common.set_status(StepStatus::Done);
        self.common.save()
    }
}

fn render_html(plan: &str, results: &[TestResult]) -> Result<String> {
    let mut environment = Environment::new();
    environment
        .add_template("report", REPORT_TEMPLATE)
        .context("parse report template")?;
    let template = environment.get_template("report").context("load template")?;
    let rows: Vec<_> = results
        .iter()
        .map(|result| {
            context! {
                result => result.result.as_str(),
                name => result.name.clone(),
                note => result.note.clone().unwrap_or_default(),
                duration => result.duration.clone().unwrap_or_default(),
            }
        })
        .collect();
    template
        .render(context! {
            plan => plan,
            results => rows,
            summary => summary(results),
        })
        .context("render report template")
}
