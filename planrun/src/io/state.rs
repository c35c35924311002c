//! Atomic JSON state files with explicit absence handling.
//!
//! Every piece of persisted state (run descriptor, step state, results,
//! discovered tests) goes through these helpers. An absent file is a normal
//! condition reported as `None`; a malformed file or an I/O failure is an
//! error with the path attached. This keeps "no results yet" distinguishable
//! from "results file is broken" without exceptions doubling as control
//! flow.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

/// Load a JSON state file; `Ok(None)` when the file does not exist.
pub fn read_json_opt<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        debug!(path = %path.display(), "state file absent");
        return Ok(None);
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let value =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(value))
}

/// Load a JSON state file that must exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    read_json_opt(path)?
        .with_context(|| format!("missing state file {}", path.display()))
}

/// Atomically write a JSON state file (temp file + rename).
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value).context("serialize json")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("state path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp state {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace state {}", path.display()))?;
    Ok(())
}
