//! Loading and resolving metadata trees.
//!
//! A metadata root is a directory containing `metadata.json`, a document of
//! fully merged nodes produced by the external metadata provider. The
//! document is validated against an embedded JSON Schema (Draft 2020-12)
//! before any entity sees it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::Draft;
use serde_json::Value;
use tracing::debug;

use crate::core::fmf::FmfId;
use crate::errors::MetadataError;
use crate::io::process::run_command_with_timeout;
use crate::tree::{Tree, TreeDocument};

/// File marking (and holding) a metadata tree root.
pub const TREE_FILE: &str = "metadata.json";

const TREE_SCHEMA: &str = include_str!("../../schemas/metadata.schema.json");

/// Budget for remote reachability checks during id validation.
const REMOTE_CHECK_TIMEOUT: Duration = Duration::from_secs(60);

/// Walk up from `path` to find the nearest metadata tree root.
pub fn find_root(path: &Path) -> Result<PathBuf, MetadataError> {
    let start = path
        .canonicalize()
        .map_err(|_| MetadataError::new(format!("Directory '{}' not found.", path.display())))?;
    let mut current = Some(start.as_path());
    while let Some(directory) = current {
        if directory.join(TREE_FILE).is_file() {
            return Ok(directory.to_path_buf());
        }
        current = directory.parent();
    }
    Err(MetadataError::new(format!(
        "No metadata found in the '{}' directory, missing a '{TREE_FILE}' tree root.",
        path.display()
    )))
}

/// Load and schema-validate the metadata tree stored under `root`.
pub fn load_tree(root: &Path) -> Result<Tree> {
    let path = root.join(TREE_FILE);
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("read metadata tree {}", path.display()))?;
    let instance: Value = serde_json::from_str(&contents)
        .with_context(|| format!("parse metadata tree {}", path.display()))?;
    validate_schema(&instance)?;
    let document: TreeDocument = serde_json::from_value(instance)
        .with_context(|| format!("parse metadata tree {}", path.display()))?;
    debug!(root = %root.display(), nodes = document.nodes.len(), "metadata tree loaded");
    Ok(Tree::new(root.to_path_buf(), document.nodes))
}

/// Resolve and load the tree nearest to `path`, applying the context.
pub fn resolve(path: &Path, context: &BTreeMap<String, String>) -> Result<Tree> {
    let root = find_root(path)?;
    let mut tree = load_tree(&root)?;
    tree.adjust(context);
    Ok(tree)
}

fn validate_schema(instance: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(TREE_SCHEMA).context("parse embedded schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile metadata schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|error| error.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("metadata tree schema validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}

/// Validate an fmf id by attempting to resolve it.
///
/// Failures map to human readable errors: an unreachable repository, an
/// invalid git ref, an invalid path, or a missing tree root marker.
pub fn validate_id(id: &FmfId) -> Result<()> {
    if let Some(url) = &id.url {
        return validate_remote_id(id, url);
    }

    // Local id: check the path, then look for the tree root.
    let base = match &id.path {
        Some(path) => {
            let candidate = PathBuf::from(path);
            if !candidate.is_dir() {
                return Err(anyhow!("path '{path}' is invalid"));
            }
            candidate
        }
        None => PathBuf::from("."),
    };
    find_root(&base).map_err(|_| {
        anyhow!(
            "No tree found in '{}', missing a '{TREE_FILE}' tree root.",
            base.display()
        )
    })?;
    Ok(())
}

fn validate_remote_id(id: &FmfId, url: &str) -> Result<()> {
    let mut cmd = Command::new("git");
    cmd.arg("ls-remote").arg(url);
    let output = run_command_with_timeout(cmd, REMOTE_CHECK_TIMEOUT, 100_000)
        .map_err(|_| anyhow!("repo '{url}' cannot be cloned"))?;
    if output.timed_out || output.exit_code != Some(0) {
        return Err(anyhow!("repo '{url}' cannot be cloned"));
    }

    if let Some(git_ref) = &id.git_ref {
        let mut cmd = Command::new("git");
        cmd.arg("ls-remote").arg("--exit-code").arg(url).arg(git_ref);
        let output = run_command_with_timeout(cmd, REMOTE_CHECK_TIMEOUT, 100_000)
            .map_err(|_| anyhow!("git ref '{git_ref}' is invalid"))?;
        if output.timed_out || output.exit_code != Some(0) || output.stdout.is_empty() {
            return Err(anyhow!("git ref '{git_ref}' is invalid"));
        }
    }
    Ok(())
}
