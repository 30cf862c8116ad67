//! Process execution seam.
//!
//! Layer effectors, output commands, git fetches and the default remote
//! channel all spawn processes through [`ProcessExecutor`], so tests can
//! substitute scripted executors.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::ExecError;

/// Options for a single process invocation.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    /// Written to the child's stdin, which is then closed.
    pub stdin: Option<String>,
    /// `None` waits forever.
    pub timeout: Option<Duration>,
}

impl ExecOptions {
    pub fn in_dir(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: Some(cwd.into()),
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }
}

/// Captured result of a finished process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code; `-1` when the process was killed by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stderr if it has content, stdout otherwise.
    pub fn diagnostics(&self) -> &str {
        if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        }
    }
}

#[async_trait]
pub trait ProcessExecutor: Send + Sync {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        opts: &ExecOptions,
    ) -> Result<ProcessOutput, ExecError>;
}

/// Runs real processes with `tokio::process`. Children are killed when the
/// timeout elapses.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioProcessExecutor;

#[async_trait]
impl ProcessExecutor for TokioProcessExecutor {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        opts: &ExecOptions,
    ) -> Result<ProcessOutput, ExecError> {
        if program.is_empty() {
            return Err(ExecError::EmptyCommand);
        }
        let start = Instant::now();

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(&opts.env)
            .stdin(if opts.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &opts.cwd {
            cmd.current_dir(cwd);
        }

        debug!(program, args = ?args, cwd = ?opts.cwd, "spawning process");
        let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
            program: program.to_string(),
            source,
        })?;

        if let (Some(input), Some(mut stdin)) = (&opts.stdin, child.stdin.take()) {
            stdin
                .write_all(input.as_bytes())
                .await
                .map_err(|source| ExecError::Wait {
                    program: program.to_string(),
                    source,
                })?;
            drop(stdin);
        }

        let output = match opts.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| ExecError::Timeout {
                    program: program.to_string(),
                    millis: limit.as_millis() as u64,
                })?,
            None => child.wait_with_output().await,
        }
        .map_err(|source| ExecError::Wait {
            program: program.to_string(),
            source,
        })?;

        Ok(ProcessOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

/// Split a `["program", "arg", ...]` command into its parts.
pub fn split_command(command: &[String]) -> Result<(&str, &[String]), ExecError> {
    match command.split_first() {
        Some((program, args)) if !program.is_empty() => Ok((program.as_str(), args)),
        _ => Err(ExecError::EmptyCommand),
    }
}
