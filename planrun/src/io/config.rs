//! User-level configuration stored under `~/.config/planrun/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// User configuration (TOML).
///
/// This file is intended to be edited by humans and must remain stable and
/// automatable. Missing fields default to sensible values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UserConfig {
    /// Directory under which run workdirs are allocated.
    pub workdir_root: PathBuf,

    /// Workdir of the most recent run, used by `run --last`.
    pub last_run: Option<PathBuf>,

    /// Truncate captured test output beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            workdir_root: PathBuf::from("/var/tmp/planrun"),
            last_run: None,
            output_limit_bytes: 100_000,
        }
    }
}

impl UserConfig {
    pub fn validate(&self) -> Result<()> {
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.workdir_root.as_os_str().is_empty() {
            return Err(anyhow!("workdir_root must not be empty"));
        }
        Ok(())
    }

    /// Default location of the configuration file.
    pub fn default_path() -> PathBuf {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
            .unwrap_or_else(|| PathBuf::from("."));
        base.join("planrun").join("config.toml")
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `UserConfig::default()`.
pub fn load_config(path: &Path) -> Result<UserConfig> {
    if !path.exists() {
        let config = UserConfig::default();
        config.validate()?;
        return Ok(config);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let config: UserConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, config: &UserConfig) -> Result<()> {
    config.validate()?;
    let mut buf = toml::to_string_pretty(config).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

/// Record the most recent run workdir.
pub fn save_last_run(path: &Path, workdir: &Path) -> Result<()> {
    let mut config = load_config(path)?;
    config.last_run = Some(workdir.to_path_buf());
    write_config(path, &config)
}
