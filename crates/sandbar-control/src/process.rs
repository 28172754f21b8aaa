//! External command execution with retry support.
//!
//! All external tools (git, docker, compose, the task runner, nginx) are
//! invoked through [`CommandRunner`]. Failures whose stderr matches a
//! transient-error vocabulary are retried with exponential backoff, but only
//! for programs known to fail transiently; everything else runs exactly once.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};

/// Programs whose failures may be transient and are worth retrying.
const RETRIABLE_PROGRAMS: &[&str] = &["git", "docker", "docker-compose", "invoke"];

/// Lowercased stderr fragments that mark a failure as transient.
const TRANSIENT_MARKERS: &[&str] = &["network", "timeout", "connection", "temporary"];

/// A failed external command.
#[derive(Debug, thiserror::Error)]
#[error("{program} failed: {stderr}")]
pub struct CommandError {
    /// Program that failed.
    pub program: String,
    /// Captured stderr (or the spawn error text).
    pub stderr: String,
    /// Whether the failure matched the transient vocabulary.
    pub transient: bool,
}

/// Captured output of a successful command.
#[derive(Debug, Clone)]
pub struct CmdOutput {
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr (commands may write diagnostics here on success).
    pub stderr: String,
}

/// Builder for one external command invocation.
#[derive(Debug, Clone)]
pub struct Cmd {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    envs: Vec<(String, String)>,
}

impl Cmd {
    /// Start building a command for `program`.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            envs: Vec::new(),
        }
    }

    /// Append one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the working directory.
    #[must_use]
    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Add an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Program name.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    fn display(&self) -> String {
        let mut s = self.program.clone();
        for arg in &self.args {
            s.push(' ');
            s.push_str(arg);
        }
        s
    }

    async fn output(&self) -> Result<CmdOutput, CommandError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &self.envs {
            command.env(key, value);
        }

        let output = command.output().await.map_err(|e| CommandError {
            program: self.program.clone(),
            stderr: e.to_string(),
            transient: false,
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if output.status.success() {
            Ok(CmdOutput { stdout, stderr })
        } else {
            Err(CommandError {
                program: self.program.clone(),
                transient: is_transient(&stderr),
                stderr,
            })
        }
    }
}

/// Classify stderr text as transient or not.
#[must_use]
pub fn is_transient(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    TRANSIENT_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Runs external commands, retrying transient failures of retriable programs
/// with exponential backoff.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    max_attempts: u32,
    initial_delay: Duration,
}

impl CommandRunner {
    /// Create a runner with the given retry policy.
    #[must_use]
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
        }
    }

    /// Run a command to completion, capturing output.
    pub async fn run(&self, cmd: &Cmd) -> Result<CmdOutput, CommandError> {
        let attempts = if RETRIABLE_PROGRAMS.contains(&cmd.program()) {
            self.max_attempts
        } else {
            1
        };

        let mut delay = self.initial_delay;
        let mut attempt = 1;
        loop {
            debug!(command = %cmd.display(), attempt, "running command");
            match cmd.output().await {
                Ok(output) => return Ok(output),
                Err(e) if e.transient && attempt < attempts => {
                    warn!(
                        command = %cmd.display(),
                        attempt,
                        delay_secs = delay.as_secs(),
                        error = %e.stderr.trim(),
                        "transient command failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for CommandRunner {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(is_transient("fatal: unable to access: Connection refused"));
        assert!(is_transient("error: network is unreachable"));
        assert!(is_transient("Operation timeout after 30s"));
        assert!(is_transient("Temporary failure in name resolution"));
        assert!(!is_transient("fatal: repository not found"));
        assert!(!is_transient("permission denied"));
    }

    #[test]
    fn only_known_programs_are_retriable() {
        assert!(RETRIABLE_PROGRAMS.contains(&"git"));
        assert!(RETRIABLE_PROGRAMS.contains(&"docker"));
        assert!(RETRIABLE_PROGRAMS.contains(&"invoke"));
        assert!(!RETRIABLE_PROGRAMS.contains(&"rm"));
    }

    #[tokio::test]
    async fn runs_and_captures_stdout() {
        let runner = CommandRunner::default();
        let out = runner
            .run(&Cmd::new("echo").arg("hello"))
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn nonzero_exit_is_an_error() {
        let runner = CommandRunner::default();
        let err = runner
            .run(&Cmd::new("sh").args(["-c", "echo boom >&2; exit 1"]))
            .await
            .unwrap_err();
        assert!(err.stderr.contains("boom"));
        assert!(!err.transient);
    }

    #[tokio::test]
    async fn missing_program_is_an_error() {
        let runner = CommandRunner::default();
        let err = runner
            .run(&Cmd::new("definitely-not-a-real-program"))
            .await
            .unwrap_err();
        assert!(!err.transient);
    }
}
