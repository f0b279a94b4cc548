//! External command execution.
//!
//! Network-facing git operations (clone, fetch, pull, push), `git apply`
//! and verification commands go through a [`CommandRunner`] so tests can
//! substitute a recording fake.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// One command invocation: working directory, argv and time limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub cwd: PathBuf,
    pub argv: Vec<String>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new<I, S>(cwd: &Path, argv: I, timeout: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            cwd: cwd.to_path_buf(),
            argv: argv.into_iter().map(Into::into).collect(),
            timeout,
        }
    }

    /// `git <args>` in `cwd`.
    pub fn git<I, S>(cwd: &Path, args: I, timeout: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut argv = vec!["git".to_string()];
        argv.extend(args.into_iter().map(Into::into));
        Self {
            cwd: cwd.to_path_buf(),
            argv,
            timeout,
        }
    }

    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or_default()
    }

    /// Space-joined argv, for logs and messages.
    pub fn display(&self) -> String {
        self.argv.join(" ")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was killed by a signal or timed out.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// stdout followed by stderr.
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (true, true) => String::new(),
            (false, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }

    /// Short failure description: timeout, exit code and the last
    /// stderr line.
    pub fn describe_failure(&self) -> String {
        if self.timed_out {
            return "timed out".to_string();
        }
        let code = self
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        match self.stderr.lines().rev().find(|l| !l.trim().is_empty()) {
            Some(line) => format!("exit {}: {}", code, line.trim()),
            None => format!("exit {}", code),
        }
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `spec` to completion. A non-zero exit or a timeout is reported
    /// in the output; only a failure to spawn is an error.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;
}

/// Runs commands with `tokio::process`. Timed-out children are killed.
#[derive(Debug, Clone, Default)]
pub struct TokioCommandRunner;

impl TokioCommandRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let (program, args) = spec
            .argv
            .split_first()
            .ok_or_else(|| Error::Command("empty command".to_string()))?;
        debug!(cmd = %spec.display(), cwd = %spec.cwd.display(), "running command");

        let child = Command::new(program)
            .args(args)
            .current_dir(&spec.cwd)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Command(format!("failed to spawn {}: {}", program, e)))?;

        match tokio::time::timeout(spec.timeout, child.wait_with_output()).await {
            Ok(output) => {
                let output = output?;
                let result = CommandOutput {
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    exit_code: output.status.code(),
                    timed_out: false,
                };
                debug!(cmd = %spec.display(), exit_code = ?result.exit_code, "command finished");
                Ok(result)
            }
            Err(_) => {
                warn!(
                    cmd = %spec.display(),
                    timeout_secs = spec.timeout.as_secs(),
                    "command timed out, killed"
                );
                Ok(CommandOutput {
                    timed_out: true,
                    ..CommandOutput::default()
                })
            }
        }
    }
}
