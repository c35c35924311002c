//! Guest abstraction for machines on which tests run.
//!
//! The [`Guest`] trait decouples the prepare/execute/finish orchestrators
//! from any particular transport. Only the `local` guest ships; tests use
//! scripted guests that record invocations without spawning processes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::io::process::run_command_with_timeout;

/// A shell command to run on a guest.
#[derive(Debug, Clone)]
pub struct GuestCommand {
    pub script: String,
    pub cwd: Option<PathBuf>,
    pub environment: BTreeMap<String, String>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl GuestCommand {
    pub fn new(script: impl Into<String>) -> GuestCommand {
        GuestCommand {
            script: script.into(),
            cwd: None,
            environment: BTreeMap::new(),
            timeout: Duration::from_secs(3600),
            output_limit_bytes: 100_000,
        }
    }
}

/// Captured command outcome.
#[derive(Debug, Clone)]
pub struct GuestOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code, `None` when killed by a signal.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

/// A machine (real or virtual) on which tests run.
pub trait Guest {
    fn name(&self) -> &str;

    /// Push a file or directory to the guest.
    fn push(&self, source: &Path, destination: &Path, options: &[String]) -> Result<()>;

    /// Pull a directory from the guest.
    fn pull(&self, destination: &Path) -> Result<()>;

    /// Run a command, capturing output and exit code.
    fn run(&self, command: &GuestCommand) -> Result<GuestOutput>;

    /// Stop the guest.
    fn stop(&self) -> Result<()>;

    /// Remove the guest completely.
    fn remove(&self) -> Result<()>;
}

/// Persisted guest descriptor, enough to reconstruct guests on wake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestRecord {
    pub name: String,
    pub how: String,
}

/// Guest backed by the local machine.
///
/// Push and pull are no-ops since the filesystem is shared; stop and
/// remove have nothing to tear down.
#[derive(Debug, Clone)]
pub struct LocalGuest {
    name: String,
}

impl LocalGuest {
    pub fn new(name: impl Into<String>) -> LocalGuest {
        LocalGuest { name: name.into() }
    }
}

impl Guest for LocalGuest {
    fn name(&self) -> &str {
        &self.name
    }

    fn push(&self, source: &Path, destination: &Path, _options: &[String]) -> Result<()> {
        debug!(
            guest = %self.name,
            source = %source.display(),
            destination = %destination.display(),
            "push is a no-op on the local guest"
        );
        Ok(())
    }

    fn pull(&self, destination: &Path) -> Result<()> {
        debug!(
            guest = %self.name,
            destination = %destination.display(),
            "pull is a no-op on the local guest"
        );
        Ok(())
    }

    fn run(&self, command: &GuestCommand) -> Result<GuestOutput> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&command.script);
        if let Some(cwd) = &command.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &command.environment {
            cmd.env(key, value);
        }
        let output =
            run_command_with_timeout(cmd, command.timeout, command.output_limit_bytes)?;
        Ok(GuestOutput {
            stdout: output.stdout_text(),
            stderr: output.stderr_text(),
            exit_code: output.exit_code,
            timed_out: output.timed_out,
        })
    }

    fn stop(&self) -> Result<()> {
        debug!(guest = %self.name, "stop is a no-op on the local guest");
        Ok(())
    }

    fn remove(&self) -> Result<()> {
        debug!(guest = %self.name, "remove is a no-op on the local guest");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_guest_runs_commands_with_environment_and_cwd() {
        let temp = tempfile::tempdir().expect("tempdir");
        let guest = LocalGuest::new("default-0");
        let mut command = GuestCommand::new("echo $GREETING; pwd");
        command.cwd = Some(temp.path().to_path_buf());
        command
            .environment
            .insert("GREETING".to_string(), "hello".to_string());

        let output = guest.run(&command).expect("run");
        assert_eq!(output.exit_code, Some(0));
        assert!(output.stdout.contains("hello"));
        let cwd = temp.path().canonicalize().expect("canonical");
        assert!(output.stdout.contains(&cwd.display().to_string()));
    }

    #[test]
    fn local_guest_reports_timeouts() {
        let guest = LocalGuest::new("default-0");
        let mut command = GuestCommand::new("sleep 30");
        command.timeout = Duration::from_millis(200);
        let output = guest.run(&command).expect("run");
        assert!(output.timed_out);
    }
}
