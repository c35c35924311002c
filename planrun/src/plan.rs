//! Plan orchestrator: drives one plan through the six pipeline stages.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::warn;

use crate::core::entity::Plan;
use crate::errors::is_specification_error;
use crate::io::env::environment_files_to_dict;
use crate::io::run_log::RunLog;
use crate::io::worktree;
use crate::steps::discover::{DiscoverContext, DiscoverStep};
use crate::steps::execute::ExecuteStep;
use crate::steps::finish::FinishStep;
use crate::steps::prepare::PrepareStep;
use crate::steps::provision::ProvisionStep;
use crate::steps::report::ReportStep;
use crate::steps::{detect_standalone, GuestContext, StepName, STEPS};
use crate::tree::Tree;

/// Read-only snapshot of run-scoped context shared with every plan.
///
/// Plans never hold a back-reference to the run itself; everything they
/// need from it is captured here once.
#[derive(Debug)]
pub struct RunShared {
    pub tree_root: PathBuf,
    pub workdir: PathBuf,
    /// Run-level environment (workdir, environment files, command line).
    pub environment: BTreeMap<String, String>,
    pub enabled_steps: BTreeSet<StepName>,
    pub dry: bool,
    pub force: bool,
    pub output_limit_bytes: usize,
}

/// One plan attached to a run, with its six step instances.
pub struct PlanRunner {
    pub plan: Plan,
    pub workdir: PathBuf,
    pub worktree: PathBuf,
    pub data_dir: PathBuf,
    /// Fully composed environment for this plan.
    pub environment: BTreeMap<String, String>,
    shared: Arc<RunShared>,
    pub discover: DiscoverStep,
    pub provision: ProvisionStep,
    pub prepare: PrepareStep,
    pub execute: ExecuteStep,
    pub report: ReportStep,
    pub finish: FinishStep,
}

impl PlanRunner {
    /// Attach a plan to a run: initialize the private worktree and data
    /// directory, compose the environment and build the steps.
    pub fn new(mut plan: Plan, shared: Arc<RunShared>) -> Result<PlanRunner> {
        let workdir = shared
            .workdir
            .join(plan.core.name.trim_start_matches('/'));
        let worktree = workdir.join("tree");
        let data_dir = workdir.join("data");

        // Sync the metadata root to the worktree, used as the working
        // directory for guest-side operations.
        worktree::sync(&shared.tree_root, &worktree)
            .with_context(|| format!("initialize worktree for '{}'", plan.core.name))?;
        fs::create_dir_all(&data_dir)
            .with_context(|| format!("create data directory {}", data_dir.display()))?;

        // Environment composition, lowest to highest precedence:
        // environment files, inline environment key, run-level environment,
        // plus the injected plan data directory.
        let mut environment =
            environment_files_to_dict(&plan.environment_files, &shared.tree_root)?;
        environment.extend(plan.environment.clone());
        environment.extend(shared.environment.clone());
        environment.insert(
            "TMT_PLAN_DATA".to_string(),
            data_dir.display().to_string(),
        );

        // Expand variable references in the raw step data.
        plan.expand_environment(&environment);

        let name = plan.core.name.clone();
        let enabled = |step: StepName| shared.enabled_steps.contains(&step);
        let discover = DiscoverStep::new(
            &name,
            &workdir,
            plan.step_raw("discover"),
            enabled(StepName::Discover),
        )?;
        let provision = ProvisionStep::new(
            &name,
            &workdir,
            plan.step_raw("provision"),
            enabled(StepName::Provision),
        )?;
        let prepare = PrepareStep::new(
            &name,
            &workdir,
            plan.step_raw("prepare"),
            enabled(StepName::Prepare),
        )?;
        let execute = ExecuteStep::new(
            &name,
            &workdir,
            plan.step_raw("execute"),
            enabled(StepName::Execute),
        )?;
        let report = ReportStep::new(
            &name,
            &workdir,
            plan.step_raw("report"),
            enabled(StepName::Report),
        )?;
        let finish = FinishStep::new(
            &name,
            &workdir,
            plan.step_raw("finish"),
            enabled(StepName::Finish),
        )?;

        Ok(PlanRunner {
            plan,
            workdir,
            worktree,
            data_dir,
            environment,
            shared,
            discover,
            provision,
            prepare,
            execute,
            report,
            finish,
        })
    }

    /// Execute the plan.
    ///
    /// All steps wake first (disabled ones included) so that standalone
    /// detection can inspect every stage's effective configuration before
    /// anything runs. The stages then run in fixed order; `finish` runs in
    /// a guaranteed-cleanup region even when an earlier stage fails or the
    /// plan aborts early.
    pub fn go(&mut self, tree: &Tree, log: &RunLog) -> Result<()> {
        log.line("")?;
        log.line(&self.plan.core.name)?;
        if let Some(summary) = &self.plan.core.summary {
            log.line(&format!("    summary: {summary}"))?;
        }

        self.wake_all()?;
        self.apply_standalone()?;

        if self.shared.dry {
            log.line("    dry mode, skipping step execution")?;
            return Ok(());
        }

        let dry = self.shared.dry;
        let main_result = (|| -> Result<()> {
            for step in STEPS {
                match step {
                    StepName::Discover => {
                        self.discover.go(&DiscoverContext {
                            tree,
                            plan: &self.plan.core.name,
                            log,
                        })?;
                        if self.discover.common.enabled
                            && self.discover.tests().is_empty()
                            && !dry
                        {
                            log.line("        warning: No tests found, finishing plan.")?;
                            return Ok(());
                        }
                    }
                    StepName::Provision => self.provision.go(log)?,
                    StepName::Prepare => {
                        let context = GuestContext {
                            worktree: &self.worktree,
                            data_dir: &self.data_dir,
                            environment: &self.environment,
                            log,
                            output_limit_bytes: self.shared.output_limit_bytes,
                        };
                        self.prepare.go(self.provision.guests(), &context)?;
                    }
                    StepName::Execute => {
                        let context = GuestContext {
                            worktree: &self.worktree,
                            data_dir: &self.data_dir,
                            environment: &self.environment,
                            log,
                            output_limit_bytes: self.shared.output_limit_bytes,
                        };
                        self.execute.go(
                            self.provision.guests(),
                            self.discover.tests(),
                            &context,
                        )?;
                    }
                    StepName::Report => self.report.go(self.execute.results(), log)?,
                    // Handled below, in the cleanup region.
                    StepName::Finish => {}
                }
            }
            Ok(())
        })();

        // The finish step always runs when enabled, regardless of early
        // abort or a failure in the main sequence.
        let finish_result = {
            let context = GuestContext {
                worktree: &self.worktree,
                data_dir: &self.data_dir,
                environment: &self.environment,
                log,
                output_limit_bytes: self.shared.output_limit_bytes,
            };
            self.finish.go(self.provision.guests(), &context)
        };

        main_result?;
        finish_result
    }

    /// Wake all steps, enabled and disabled alike.
    ///
    /// A specification error from a disabled step's configuration must not
    /// block other steps, so it is downgraded to a warning.
    fn wake_all(&mut self) -> Result<()> {
        let force = self.shared.force;
        let wakes: [(&str, bool, Result<()>); 6] = [
            (
                "discover",
                self.discover.common.enabled,
                self.discover.wake(force),
            ),
            (
                "provision",
                self.provision.common.enabled,
                self.provision.wake(force),
            ),
            (
                "prepare",
                self.prepare.common.enabled,
                self.prepare.wake(force),
            ),
            (
                "execute",
                self.execute.common.enabled,
                self.execute.wake(force),
            ),
            ("report", self.report.common.enabled, self.report.wake(force)),
            ("finish", self.finish.common.enabled, self.finish.wake(force)),
        ];
        for (step, enabled, result) in wakes {
            if let Err(error) = result {
                if !enabled && is_specification_error(&error) {
                    warn!(step, plan = %self.plan.core.name, %error, "disabled step is misconfigured");
                    continue;
                }
                return Err(error);
            }
        }
        Ok(())
    }

    /// Check standalone requests and narrow the enabled steps if needed.
    fn apply_standalone(&mut self) -> Result<()> {
        let counts = [
            (StepName::Discover, self.enabled_standalone(StepName::Discover)),
            (
                StepName::Provision,
                self.enabled_standalone(StepName::Provision),
            ),
            (StepName::Prepare, self.enabled_standalone(StepName::Prepare)),
            (StepName::Execute, self.enabled_standalone(StepName::Execute)),
            (StepName::Report, self.enabled_standalone(StepName::Report)),
            (StepName::Finish, self.enabled_standalone(StepName::Finish)),
        ];
        if let Some(standalone) = detect_standalone(&counts)? {
            warn!(step = %standalone, "running a single step standalone");
            self.discover.common.enabled = standalone == StepName::Discover;
            self.provision.common.enabled = standalone == StepName::Provision;
            self.prepare.common.enabled = standalone == StepName::Prepare;
            self.execute.common.enabled = standalone == StepName::Execute;
            self.report.common.enabled = standalone == StepName::Report;
            self.finish.common.enabled = standalone == StepName::Finish;
        }
        Ok(())
    }

    fn enabled_standalone(&self, step: StepName) -> usize {
        let (enabled, count) = match step {
            StepName::Discover => (
                self.discover.common.enabled,
                self.discover.standalone_phases(),
            ),
            StepName::Provision => (
                self.provision.common.enabled,
                self.provision.standalone_phases(),
            ),
            StepName::Prepare => (
                self.prepare.common.enabled,
                self.prepare.standalone_phases(),
            ),
            StepName::Execute => (
                self.execute.common.enabled,
                self.execute.standalone_phases(),
            ),
            StepName::Report => (self.report.common.enabled, self.report.standalone_phases()),
            StepName::Finish => (self.finish.common.enabled, self.finish.standalone_phases()),
        };
        if enabled { count } else { 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::state::read_json;
    use crate::tree::{RawNode, TreeDocument};
    use serde_json::{json, Map, Value};
    use std::collections::BTreeSet;

    fn node(name: &str, data: Value) -> RawNode {
        let data = data.as_object().expect("object").clone();
        let defined: BTreeSet<String> = data.keys().cloned().collect();
        RawNode {
            name: name.to_string(),
            data,
            defined,
            sources: Vec::new(),
        }
    }

    fn write_tree(root: &std::path::Path, nodes: Vec<RawNode>) -> Tree {
        let document = TreeDocument {
            nodes: nodes.clone(),
        };
        std::fs::create_dir_all(root).expect("mkdir");
        std::fs::write(
            root.join("metadata.json"),
            serde_json::to_string_pretty(&document).expect("serialize"),
        )
        .expect("write");
        Tree::new(root.to_path_buf(), nodes)
    }

    fn shared(
        tree_root: &std::path::Path,
        workdir: &std::path::Path,
        steps: &[StepName],
    ) -> Arc<RunShared> {
        Arc::new(RunShared {
            tree_root: tree_root.to_path_buf(),
            workdir: workdir.to_path_buf(),
            environment: BTreeMap::new(),
            enabled_steps: steps.iter().copied().collect(),
            dry: false,
            force: false,
            output_limit_bytes: 100_000,
        })
    }

    fn smoke_plan(tree: &Tree) -> Plan {
        crate::core::query::plans(tree, &Default::default())
            .expect("plans")
            .remove(0)
    }

    #[test]
    fn full_pipeline_runs_and_collects_results() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tree_root = temp.path().join("tree");
        let tree = write_tree(
            &tree_root,
            vec![
                node("/tests/good", json!({"test": "true"})),
                node("/tests/bad", json!({"test": "false"})),
                node(
                    "/plans/smoke",
                    json!({
                        "discover": {"how": "tree"},
                        "execute": {"how": "shell"},
                    }),
                ),
            ],
        );
        let workdir = temp.path().join("run");
        let shared = shared(&tree_root, &workdir, &STEPS);
        let log = RunLog::new(&workdir);

        let mut runner = PlanRunner::new(smoke_plan(&tree), shared).expect("runner");
        runner.go(&tree, &log).expect("go");

        let results = runner.execute.results();
        assert_eq!(results.len(), 2);
        assert!(runner.finish.common.is_done());
        assert!(runner.worktree.join("metadata.json").is_file());
    }

    #[test]
    fn zero_tests_skips_middle_steps_but_runs_finish() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tree_root = temp.path().join("tree");
        let tree = write_tree(
            &tree_root,
            vec![node(
                "/plans/empty",
                json!({
                    "discover": {"how": "tree", "names": ["no-such-test"]},
                    "execute": {"how": "shell"},
                    "finish": {"how": "shell", "script": "touch finished"},
                }),
            )],
        );
        let workdir = temp.path().join("run");
        let shared = shared(&tree_root, &workdir, &STEPS);
        let log = RunLog::new(&workdir);

        let mut runner = PlanRunner::new(smoke_plan(&tree), shared).expect("runner");
        runner.go(&tree, &log).expect("go");

        assert!(runner.discover.common.is_done());
        assert!(!runner.provision.common.is_done());
        assert!(!runner.execute.common.is_done());
        assert!(runner.finish.common.is_done());
    }

    #[test]
    fn finish_runs_even_when_a_stage_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tree_root = temp.path().join("tree");
        let tree = write_tree(
            &tree_root,
            vec![
                node("/tests/good", json!({"test": "true"})),
                node(
                    "/plans/failing",
                    json!({
                        "discover": {"how": "tree"},
                        "prepare": {"how": "shell", "script": "exit 1"},
                        "execute": {"how": "shell"},
                        "finish": {"how": "shell", "script": "touch cleaned-up"},
                    }),
                ),
            ],
        );
        let workdir = temp.path().join("run");
        let shared = shared(&tree_root, &workdir, &STEPS);
        let log = RunLog::new(&workdir);

        let mut runner = PlanRunner::new(smoke_plan(&tree), shared).expect("runner");
        let err = runner.go(&tree, &log).unwrap_err();
        assert!(err.to_string().contains("failed on guest"));
        assert!(runner.finish.common.is_done());
        assert!(runner.worktree.join("cleaned-up").exists());
    }

    #[test]
    fn disabled_step_misconfiguration_is_only_a_warning() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tree_root = temp.path().join("tree");
        let tree = write_tree(
            &tree_root,
            vec![
                node("/tests/good", json!({"test": "true"})),
                node(
                    "/plans/smoke",
                    json!({
                        "discover": {"how": "tree"},
                        "execute": {"how": "shell"},
                        // Bad method, but the report step stays disabled.
                        "report": {"how": "morse-code"},
                    }),
                ),
            ],
        );
        let workdir = temp.path().join("run");
        let enabled = [
            StepName::Discover,
            StepName::Provision,
            StepName::Prepare,
            StepName::Execute,
            StepName::Finish,
        ];
        let shared = shared(&tree_root, &workdir, &enabled);
        let log = RunLog::new(&workdir);

        let mut runner = PlanRunner::new(smoke_plan(&tree), shared).expect("runner");
        runner.go(&tree, &log).expect("go");
        assert_eq!(runner.execute.results().len(), 1);
    }

    #[test]
    fn enabled_step_misconfiguration_is_fatal() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tree_root = temp.path().join("tree");
        let tree = write_tree(
            &tree_root,
            vec![node(
                "/plans/smoke",
                json!({"execute": {"how": "quantum"}}),
            )],
        );
        let workdir = temp.path().join("run");
        let shared = shared(&tree_root, &workdir, &STEPS);
        let log = RunLog::new(&workdir);

        let mut runner = PlanRunner::new(smoke_plan(&tree), shared).expect("runner");
        let err = runner.go(&tree, &log).unwrap_err();
        assert!(err.to_string().contains("Unsupported execute method"));
    }

    #[test]
    fn plan_environment_reaches_executed_tests() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tree_root = temp.path().join("tree");
        let tree = write_tree(
            &tree_root,
            vec![
                node(
                    "/tests/env",
                    json!({"test": "test \"$STAGE\" = ci && test -n \"$TMT_PLAN_DATA\""}),
                ),
                node(
                    "/plans/env",
                    json!({
                        "discover": {"how": "tree"},
                        "execute": {"how": "shell"},
                        "environment": {"STAGE": "ci"},
                    }),
                ),
            ],
        );
        let workdir = temp.path().join("run");
        let shared = shared(&tree_root, &workdir, &STEPS);
        let log = RunLog::new(&workdir);

        let mut runner = PlanRunner::new(smoke_plan(&tree), shared).expect("runner");
        runner.go(&tree, &log).expect("go");
        assert_eq!(
            runner.execute.results()[0].result,
            crate::core::result::Outcome::Pass
        );
    }

    #[test]
    fn resumed_plan_skips_completed_steps() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tree_root = temp.path().join("tree");
        let tree = write_tree(
            &tree_root,
            vec![
                node("/tests/good", json!({"test": "true"})),
                node(
                    "/plans/smoke",
                    json!({
                        "discover": {"how": "tree"},
                        "execute": {"how": "shell"},
                    }),
                ),
            ],
        );
        let workdir = temp.path().join("run");
        let log = RunLog::new(&workdir);

        let mut first = PlanRunner::new(
            smoke_plan(&tree),
            shared(&tree_root, &workdir, &STEPS),
        )
        .expect("runner");
        first.go(&tree, &log).expect("go");
        let results_path = first.execute.common.workdir.join("results.json");
        let before: Map<String, Value> = read_json(&results_path).expect("results");

        // Killing the process and reloading from disk must not re-execute
        // anything nor change persisted results.
        let mut resumed = PlanRunner::new(
            smoke_plan(&tree),
            shared(&tree_root, &workdir, &STEPS),
        )
        .expect("runner");
        resumed.go(&tree, &log).expect("go");
        assert_eq!(resumed.execute.results().len(), 1);
        let after: Map<String, Value> = read_json(&results_path).expect("results");
        assert_eq!(before, after);
    }
}
