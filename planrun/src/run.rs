//! Run orchestrator: resumable top-level lifecycle over selected plans.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::query::{self, Selection};
use crate::core::result::{exit_code, summary, TestResult};
use crate::exit_codes;
use crate::io::config::{save_last_run, UserConfig};
use crate::io::env::{environment_files_to_dict, environment_to_dict};
use crate::io::run_log::{self, RunLog};
use crate::io::state::{read_json_opt, write_json};
use crate::io::tree_store;
use crate::plan::{PlanRunner, RunShared};
use crate::steps::{StepName, StepRange};

/// Inputs gathered at the CLI boundary, passed down explicitly.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Use this workdir instead of allocating a fresh one.
    pub id: Option<PathBuf>,
    /// Resume the most recent run.
    pub last: bool,
    /// Metadata tree root (current directory when unset).
    pub root: Option<PathBuf>,
    /// Plan selection; empty means "restore persisted or take everything".
    pub plans: Selection,
    /// Steps explicitly requested by name.
    pub steps: BTreeSet<StepName>,
    /// Enable all steps.
    pub all_steps: bool,
    /// Step range selection (since/until/after/before/skip).
    pub range: StepRange,
    /// `KEY=VALUE` environment variables, highest precedence.
    pub environment: Vec<String>,
    /// Environment files, relative to the tree root.
    pub environment_files: Vec<String>,
    /// Context dimensions for metadata adjustment.
    pub context: BTreeMap<String, String>,
    /// Remove the workdir after a successful finish.
    pub remove: bool,
    /// No-op mode: resolve everything, execute nothing.
    pub dry: bool,
    /// Throw away previous step data on wake.
    pub force: bool,
    /// Tail the run log instead of executing.
    pub follow: bool,
}

/// Persisted run descriptor (`run.json`), the single source of
/// resumability truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub root: PathBuf,
    pub plans: Vec<String>,
    pub steps: BTreeSet<StepName>,
    pub environment: BTreeMap<String, String>,
    pub remove: bool,
}

/// A test run, a container of plans.
pub struct Run {
    options: RunOptions,
    config: UserConfig,
    config_path: PathBuf,
    workdir: PathBuf,
    environment_from_workdir: BTreeMap<String, String>,
    restored_plans: Option<Vec<String>>,
    enabled_steps: BTreeSet<StepName>,
    remove: bool,
}

impl Run {
    pub fn new(options: RunOptions, config: UserConfig, config_path: PathBuf) -> Result<Run> {
        let workdir = resolve_workdir(&options, &config)?;
        let remove = options.remove;
        let enabled_steps = options.steps.clone();
        Ok(Run {
            options,
            config,
            config_path,
            workdir,
            environment_from_workdir: BTreeMap::new(),
            restored_plans: None,
            enabled_steps,
            remove,
        })
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Execute the run and return the process exit code.
    pub fn go(&mut self) -> Result<i32> {
        // Resolve the metadata tree first; the workdir must never live
        // inside it to avoid self-referential worktree syncing.
        let root_hint = self
            .options
            .root
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));
        let tree = tree_store::resolve(&root_hint, &self.options.context)?;
        fs::create_dir_all(&self.workdir)
            .with_context(|| format!("create workdir {}", self.workdir.display()))?;
        let workdir = self
            .workdir
            .canonicalize()
            .with_context(|| format!("resolve workdir {}", self.workdir.display()))?;
        self.workdir = workdir;
        if self.workdir.starts_with(tree.root()) {
            bail!("Run workdir must not be inside the metadata tree root.");
        }

        save_last_run(&self.config_path, &self.workdir)?;
        let log = RunLog::new(&self.workdir);
        log.line(&self.workdir.display().to_string())?;

        self.load()?;

        // Follow the log instead of executing the run.
        if self.options.follow {
            run_log::follow(&self.workdir)?;
            return Ok(exit_codes::OK);
        }

        // Run-level environment: persisted workdir values are overridden
        // by environment files, which in turn lose to command line pairs.
        let mut environment = self.environment_from_workdir.clone();
        environment.extend(environment_files_to_dict(
            &self.options.environment_files,
            tree.root(),
        )?);
        environment.extend(environment_to_dict(&self.options.environment)?);

        // Resolve the step selection into the enabled set.
        if self.options.all_steps
            || !self.options.range.is_empty()
            || self.enabled_steps.is_empty()
        {
            self.enabled_steps.extend(self.options.range.resolve());
        }
        debug!(steps = ?self.enabled_steps, "enabled steps");

        // Select plans: explicit selection beats the persisted one.
        let plans = if !self.options.plans.is_empty() || self.restored_plans.is_none() {
            let mut selection = self.options.plans.clone();
            selection.filters.push("enabled:true".to_string());
            query::plans(&tree, &selection)?
        } else {
            let names = self.restored_plans.clone().unwrap_or_default();
            query::plans_by_exact_names(&tree, &names)?
        };
        if plans.is_empty() {
            bail!("No plans found.");
        }
        log.line(&format!(
            "Found {}.",
            match plans.len() {
                1 => "1 plan".to_string(),
                count => format!("{count} plans"),
            }
        ))?;

        // Persist the run before executing anything.
        let state = RunState {
            root: tree.root().clone(),
            plans: plans.iter().map(|plan| plan.core.name.clone()).collect(),
            steps: self.enabled_steps.clone(),
            environment: environment.clone(),
            remove: self.remove,
        };
        write_json(&self.workdir.join("run.json"), &state)?;

        let shared = Arc::new(RunShared {
            tree_root: tree.root().clone(),
            workdir: self.workdir.clone(),
            environment,
            enabled_steps: self.enabled_steps.clone(),
            dry: self.options.dry,
            force: self.options.force,
            output_limit_bytes: self.config.output_limit_bytes,
        });

        // Iterate over plans.
        let mut runners = Vec::new();
        for plan in plans {
            let mut runner = PlanRunner::new(plan, Arc::clone(&shared))?;
            runner.go(&tree, &log)?;
            runners.push(runner);
        }

        self.finish(&runners, &log)
    }

    /// Load persisted selection, honoring command line precedence.
    fn load(&mut self) -> Result<()> {
        let Some(state) = read_json_opt::<RunState>(&self.workdir.join("run.json"))? else {
            debug!("run data not found");
            return Ok(());
        };

        // Restore plan selection only if not overridden on the command line.
        if self.options.plans.is_empty() {
            self.restored_plans = Some(state.plans);
        }

        // Restore enabled steps only if not selected on the command line.
        let steps_selected = !self.options.steps.is_empty()
            || self.options.all_steps
            || !self.options.range.is_empty();
        if !steps_selected {
            self.enabled_steps = state.steps;
        }

        self.environment_from_workdir = state.environment;
        self.remove = self.remove || state.remove;
        Ok(())
    }

    /// Check overall results and compute the process exit code.
    fn finish(&mut self, runners: &[PlanRunner], log: &RunLog) -> Result<i32> {
        // Interesting results exist only when execute or report is enabled.
        let interesting = self.enabled_steps.contains(&StepName::Execute)
            || self.enabled_steps.contains(&StepName::Report);

        let results: Vec<TestResult> = runners
            .iter()
            .flat_map(|runner| runner.execute.results().iter().cloned())
            .collect();
        if interesting {
            log.line("")?;
            log.line(&format!("total: {}", summary(&results)))?;
        }

        // Remove the workdir if requested.
        if self.remove && self.enabled_steps.contains(&StepName::Finish) && !self.options.dry {
            debug!(workdir = %self.workdir.display(), "removing workdir");
            fs::remove_dir_all(&self.workdir)
                .with_context(|| format!("remove workdir {}", self.workdir.display()))?;
        }

        // Execution intentionally skipped in no-op mode exits clean, and
        // without execute or report there is nothing to judge.
        if self.options.dry || !interesting {
            return Ok(exit_codes::OK);
        }
        Ok(exit_code(&results))
    }
}

/// Pick the run workdir: explicit id, last run, or a fresh `run-NNN`.
fn resolve_workdir(options: &RunOptions, config: &UserConfig) -> Result<PathBuf> {
    if let Some(id) = &options.id {
        return Ok(id.clone());
    }
    if options.last {
        return config
            .last_run
            .clone()
            .context("No last run id found. Have you executed any run?");
    }
    if options.follow {
        bail!("Run id has to be specified in order to use --follow.");
    }
    allocate_workdir(&config.workdir_root)
}

/// Allocate the next free `run-NNN` directory under the workdir root.
fn allocate_workdir(workdir_root: &Path) -> Result<PathBuf> {
    fs::create_dir_all(workdir_root)
        .with_context(|| format!("create workdir root {}", workdir_root.display()))?;
    let mut highest = 0u32;
    for entry in fs::read_dir(workdir_root)
        .with_context(|| format!("read workdir root {}", workdir_root.display()))?
    {
        let entry = entry.context("read workdir root entry")?;
        let name = entry.file_name();
        if let Some(number) = name
            .to_str()
            .and_then(|name| name.strip_prefix("run-"))
            .and_then(|suffix| suffix.parse::<u32>().ok())
        {
            highest = highest.max(number);
        }
    }
    Ok(workdir_root.join(format!("run-{:03}", highest + 1)))
}
