//! Centralized command execution with consistent error handling.
//!
//! All external tools are invoked through [`Cmd`], which resolves into an
//! [`Invocation`] and hands it to a [`ToolRunner`]. Production code uses
//! [`HostRunner`]; tests substitute a recording fake so the exact sequence
//! of mounts, unmounts, and package operations can be asserted without
//! touching the host.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;

/// A fully resolved command, ready to hand to a [`ToolRunner`].
#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
    pub current_dir: Option<PathBuf>,
    /// Inherit stdio instead of capturing. Used for long-running tools
    /// (debootstrap, apt, mksquashfs) whose progress the operator should see.
    pub interactive: bool,
}

impl Invocation {
    /// The command rendered as a single line, for logs and test assertions.
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Result of one external tool invocation.
#[derive(Debug, Clone)]
pub struct ExitOutcome {
    pub code: i32,
    /// Raw stdout. Kept as bytes because some tools (unzip -p, md5sum)
    /// produce output that is written to disk verbatim.
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl ExitOutcome {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stdout_trimmed(&self) -> String {
        self.stdout_text().trim().to_string()
    }

    pub fn stderr_trimmed(&self) -> &str {
        self.stderr.trim()
    }
}

/// An external tool exited non-zero.
///
/// Carried inside the error chain so stage drivers can recover the exit
/// code for failure reporting.
#[derive(Debug, Error)]
#[error("'{program}' failed (exit code {code})")]
pub struct CommandFailed {
    pub program: String,
    pub code: i32,
}

/// Capability interface for running external tools.
pub trait ToolRunner {
    /// Execute the invocation. `Err` means the command could not be
    /// spawned at all; a non-zero exit is an `Ok` outcome with that code.
    fn run(&self, invocation: &Invocation) -> Result<ExitOutcome>;
}

/// Runs commands on the host via `std::process`.
pub struct HostRunner;

impl ToolRunner for HostRunner {
    fn run(&self, invocation: &Invocation) -> Result<ExitOutcome> {
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args);
        for (key, value) in &invocation.envs {
            cmd.env(key, value);
        }
        if let Some(ref dir) = invocation.current_dir {
            cmd.current_dir(dir);
        }

        if invocation.interactive {
            cmd.stdin(Stdio::inherit());
            cmd.stdout(Stdio::inherit());
            cmd.stderr(Stdio::inherit());
            let status = cmd.status().with_context(|| {
                format!("Failed to execute '{}'. Is it installed?", invocation.program)
            })?;
            Ok(ExitOutcome {
                code: status.code().unwrap_or(-1),
                stdout: Vec::new(),
                stderr: String::new(),
            })
        } else {
            let output = cmd.output().with_context(|| {
                format!("Failed to execute '{}'. Is it installed?", invocation.program)
            })?;
            Ok(ExitOutcome {
                code: output.status.code().unwrap_or(-1),
                stdout: output.stdout,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
    }
}

/// Builder for configuring command execution.
pub struct Cmd {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    current_dir: Option<PathBuf>,
    interactive: bool,
    /// If true, don't fail on non-zero exit.
    allow_fail: bool,
    /// Custom error message prefix.
    error_prefix: Option<String>,
}

impl Cmd {
    /// Create a new command builder.
    pub fn new(program: impl AsRef<str>) -> Self {
        Self {
            program: program.as_ref().to_string(),
            args: Vec::new(),
            envs: Vec::new(),
            current_dir: None,
            interactive: false,
            allow_fail: false,
            error_prefix: None,
        }
    }

    /// Add a single argument.
    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

    /// Add multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for arg in args {
            self.args.push(arg.as_ref().to_string());
        }
        self
    }

    /// Add a path as an argument.
    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.to_string_lossy().into_owned());
        self
    }

    /// Set an environment variable for this invocation only.
    pub fn env(mut self, key: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.envs
            .push((key.as_ref().to_string(), value.as_ref().to_string()));
        self
    }

    /// Set the working directory.
    pub fn dir(mut self, dir: &Path) -> Self {
        self.current_dir = Some(dir.to_path_buf());
        self
    }

    /// Inherit stdio so the operator sees tool progress.
    pub fn interactive(mut self) -> Self {
        self.interactive = true;
        self
    }

    /// Allow non-zero exit codes without failing.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// Set a custom error message prefix.
    pub fn error_msg(mut self, msg: impl AsRef<str>) -> Self {
        self.error_prefix = Some(msg.as_ref().to_string());
        self
    }

    /// Run the command through the given runner.
    pub fn run_with(self, runner: &dyn ToolRunner) -> Result<ExitOutcome> {
        let invocation = Invocation {
            program: self.program,
            args: self.args,
            envs: self.envs,
            current_dir: self.current_dir,
            interactive: self.interactive,
        };
        let outcome = runner.run(&invocation)?;

        if !self.allow_fail && !outcome.success() {
            let prefix = self
                .error_prefix
                .unwrap_or_else(|| format!("'{}' failed", invocation.program));
            let failure = CommandFailed {
                program: invocation.program.clone(),
                code: outcome.code,
            };
            let stderr = outcome.stderr_trimmed();
            let message = if stderr.is_empty() {
                format!("{} (exit code {})", prefix, outcome.code)
            } else {
                format!("{} (exit code {}):\n{}", prefix, outcome.code, stderr)
            };
            return Err(anyhow::Error::new(failure).context(message));
        }

        Ok(outcome)
    }

    /// Run the command on the host.
    pub fn run(self) -> Result<ExitOutcome> {
        self.run_with(&HostRunner)
    }
}
