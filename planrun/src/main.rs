//! Command line interface for the plan runner.
//!
//! The CLI stays thin: arguments are gathered into explicit option
//! structs and handed to the library, which owns all behavior.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};

use planrun::core::link::LinkNeedle;
use planrun::core::query::{self, Selection};
use planrun::exit_codes;
use planrun::io::config::{load_config, UserConfig};
use planrun::io::tree_store;
use planrun::run::{Run, RunOptions};
use planrun::steps::{StepName, StepRange};
use planrun::{logging, status};

#[derive(Parser)]
#[command(
    name = "planrun",
    version,
    about = "Run declarative test plans over a metadata tree"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute selected plans step by step.
    Run(RunArgs),
    /// Work with tests (L1 metadata).
    Test {
        #[command(subcommand)]
        action: EntityAction,
    },
    /// Work with plans (L2 metadata).
    Plan {
        #[command(subcommand)]
        action: EntityAction,
    },
    /// Work with stories (L3 metadata).
    Story {
        #[command(subcommand)]
        action: EntityAction,
    },
    /// Show status of run work directories.
    Status(StatusArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Use this workdir instead of allocating a fresh one.
    #[arg(short, long)]
    id: Option<PathBuf>,

    /// Resume the most recent run.
    #[arg(short, long)]
    last: bool,

    /// Metadata tree root (defaults to the current directory).
    #[arg(long)]
    root: Option<PathBuf>,

    #[command(flatten)]
    selection: SelectionArgs,

    /// Enable all steps.
    #[arg(short, long)]
    all: bool,

    /// Enable steps starting with this one.
    #[arg(long)]
    since: Option<String>,

    /// Enable steps up to this one.
    #[arg(long)]
    until: Option<String>,

    /// Enable steps after this one.
    #[arg(long)]
    after: Option<String>,

    /// Enable steps before this one.
    #[arg(long)]
    before: Option<String>,

    /// Skip given steps.
    #[arg(long)]
    skip: Vec<String>,

    /// Enable just the given steps.
    #[arg(long = "step")]
    steps: Vec<String>,

    /// Set environment variable (KEY=VALUE), highest precedence.
    #[arg(short, long)]
    environment: Vec<String>,

    /// Read environment variables from a file.
    #[arg(long = "environment-file")]
    environment_files: Vec<String>,

    /// Context dimension for metadata adjustment (KEY=VALUE).
    #[arg(short, long)]
    context: Vec<String>,

    /// Remove the workdir after a successful finish.
    #[arg(short, long)]
    remove: bool,

    /// Resolve everything but execute nothing.
    #[arg(long)]
    dry: bool,

    /// Throw away previous step data.
    #[arg(short, long)]
    force: bool,

    /// Tail the run log instead of executing.
    #[arg(long)]
    follow: bool,
}

#[derive(Args, Default)]
struct SelectionArgs {
    /// Select by name pattern (regex search).
    #[arg(short, long = "name")]
    names: Vec<String>,

    /// Select by filter expression.
    #[arg(long = "filter")]
    filters: Vec<String>,

    /// Select by condition expression.
    #[arg(long = "condition")]
    conditions: Vec<String>,

    /// Select by link ("relation:target" needle).
    #[arg(long = "link")]
    links: Vec<String>,

    /// Exclude matching names.
    #[arg(long = "exclude")]
    excludes: Vec<String>,
}

impl SelectionArgs {
    fn into_selection(self) -> Result<Selection> {
        let links = self
            .links
            .iter()
            .map(|needle| LinkNeedle::from_raw(needle))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Selection {
            names: self.names,
            filters: self.filters,
            conditions: self.conditions,
            links,
            excludes: self.excludes,
        })
    }
}

#[derive(Subcommand)]
enum EntityAction {
    /// List matching names.
    Ls {
        #[command(flatten)]
        selection: SelectionArgs,
    },
    /// Show full details of matching items.
    Show {
        #[command(flatten)]
        selection: SelectionArgs,
    },
}

#[derive(Args)]
struct StatusArgs {
    /// Show a single run workdir.
    #[arg(short, long)]
    id: Option<PathBuf>,

    /// Increase verbosity (-v plans, -vv steps).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            eprintln!("{error:#}");
            std::process::exit(exit_codes::ERROR);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let config_path = UserConfig::default_path();
    let config = load_config(&config_path)?;

    match cli.command {
        Command::Run(args) => cmd_run(args, config, config_path),
        Command::Test { action } => cmd_entity(Kind::Test, action),
        Command::Plan { action } => cmd_entity(Kind::Plan, action),
        Command::Story { action } => cmd_entity(Kind::Story, action),
        Command::Status(args) => {
            status::show(&config.workdir_root, args.id.as_deref(), args.verbose)?;
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_run(args: RunArgs, config: UserConfig, config_path: PathBuf) -> Result<i32> {
    let mut steps = std::collections::BTreeSet::new();
    for step in &args.steps {
        steps.insert(parse_step(step)?);
    }
    let range = StepRange {
        since: args.since.as_deref().map(parse_step).transpose()?,
        until: args.until.as_deref().map(parse_step).transpose()?,
        after: args.after.as_deref().map(parse_step).transpose()?,
        before: args.before.as_deref().map(parse_step).transpose()?,
        skip: args
            .skip
            .iter()
            .map(|step| parse_step(step))
            .collect::<Result<Vec<_>>>()?,
    };

    let options = RunOptions {
        id: args.id,
        last: args.last,
        root: args.root,
        plans: args.selection.into_selection()?,
        steps,
        all_steps: args.all,
        range,
        environment: args.environment,
        environment_files: args.environment_files,
        context: parse_pairs(&args.context)?,
        remove: args.remove,
        dry: args.dry,
        force: args.force,
        follow: args.follow,
    };

    Run::new(options, config, config_path)?.go()
}

enum Kind {
    Test,
    Plan,
    Story,
}

fn cmd_entity(kind: Kind, action: EntityAction) -> Result<i32> {
    let (selection, show) = match action {
        EntityAction::Ls { selection } => (selection, false),
        EntityAction::Show { selection } => (selection, true),
    };
    let selection = selection.into_selection()?;
    let tree = tree_store::resolve(std::path::Path::new("."), &BTreeMap::new())?;

    match kind {
        Kind::Test => {
            for test in query::tests(&tree, &selection, true)? {
                if show {
                    print!("{}", test.show());
                } else {
                    println!("{}", test.core.name);
                }
            }
        }
        Kind::Plan => {
            for plan in query::plans(&tree, &selection)? {
                if show {
                    print!("{}", plan.show());
                } else {
                    println!("{}", plan.core.name);
                }
            }
        }
        Kind::Story => {
            for story in query::stories(&tree, &selection)? {
                if show {
                    print!("{}", story.show());
                } else {
                    println!("{}", story.core.name);
                }
            }
        }
    }
    Ok(exit_codes::OK)
}

fn parse_step(value: &str) -> Result<StepName> {
    StepName::from_str(value).with_context(|| format!("Invalid step '{value}'."))
}

fn parse_pairs(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    let mut parsed = BTreeMap::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("Invalid KEY=VALUE pair '{pair}'.");
        };
        parsed.insert(key.trim().to_string(), value.to_string());
    }
    Ok(parsed)
}
