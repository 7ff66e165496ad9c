//! Sub-process execution.
//!
//! Every external tool the pipeline drives (the base interpreter, pip) runs
//! through [`CommandRunner`]. Commands run one at a time and are awaited to
//! completion before the caller continues.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::debug;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

/// Number of trailing stderr lines kept in error messages.
const STDERR_TAIL_LINES: usize = 20;

/// A command line to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Whether the argument list contains `arg` verbatim.
    pub fn has_arg(&self, arg: &str) -> bool {
        self.args.iter().any(|a| a == arg)
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Short description of a failed run: exit status plus the last lines of stderr.
    pub fn failure_reason(&self) -> String {
        let status = match self.code {
            Some(code) => format!("exit status {}", code),
            None => "terminated by signal".to_string(),
        };

        let lines: Vec<&str> = self
            .stderr
            .lines()
            .filter(|l| !l.trim().is_empty())
            .collect();
        if lines.is_empty() {
            return status;
        }
        let tail = &lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..];
        format!("{}: {}", status, tail.join("\n"))
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion. An `Err` means the command could not be
    /// started; a command that ran and failed is reported through
    /// [`CommandOutput::success`].
    async fn run(&self, command: &CommandSpec) -> Result<CommandOutput>;
}

/// Runs commands as child processes with captured output.
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    #[tracing::instrument(skip(self, command), fields(command = %command))]
    async fn run(&self, command: &CommandSpec) -> Result<CommandOutput> {
        debug!("Running {}", command);

        let mut cmd = tokio::process::Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &command.cwd {
            cmd.current_dir(cwd);
        }

        let output = cmd
            .output()
            .await
            .with_context(|| format!("Failed to start {}", command.program.display()))?;

        let result = CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        debug!("{} finished with {:?}", command.program.display(), result.code);
        Ok(result)
    }
}
