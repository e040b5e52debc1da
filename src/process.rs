//! Centralized execution of the privileged helpers.
//!
//! Every loop, device-mapper and image helper goes through [`Cmd`], so a
//! failure always carries the program name, exit code and stderr.

use std::ffi::{OsStr, OsString};
use std::path::Path;
use std::process::{Command, ExitStatus};
use std::thread;
use std::time::Duration;

use crate::error::{Error, Result};

/// Result of a command execution.
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Exit status of the command.
    pub status: ExitStatus,
    /// Captured stdout as a string.
    pub stdout: String,
    /// Captured stderr as a string.
    pub stderr: String,
}

impl CommandResult {
    /// Returns true if the command exited successfully.
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Get the exit code, or -1 if terminated by signal.
    pub fn code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }

    /// Get stdout, trimmed of whitespace.
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    /// Get stderr, trimmed of whitespace.
    pub fn stderr_trimmed(&self) -> &str {
        self.stderr.trim()
    }
}

/// Builder for configuring command execution.
pub struct Cmd {
    program: String,
    args: Vec<OsString>,
}

impl Cmd {
    /// Create a new command builder.
    pub fn new(program: impl AsRef<str>) -> Self {
        Self {
            program: program.as_ref().to_string(),
            args: Vec::new(),
        }
    }

    /// Add a single argument.
    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().into());
        self
    }

    /// Add multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for arg in args {
            self.args.push(arg.as_ref().into());
        }
        self
    }

    /// Add a path as an argument, without lossy conversion.
    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.as_os_str().to_os_string());
        self
    }

    /// Add a raw OS string argument (e.g. `of=<path>` for dd).
    pub fn arg_os(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    /// Run the command and capture output. Any non-zero exit is an
    /// [`Error::ExternalTool`].
    pub fn run(self) -> Result<CommandResult> {
        self.execute(false)
    }

    /// Like [`Cmd::run`], but a failure whose stderr reports the device is
    /// in use becomes [`Error::Busy`] for a [`RetryPolicy`] to retry.
    ///
    /// Only release operations (detach, remove) should use this.
    pub fn run_retryable(self) -> Result<CommandResult> {
        self.execute(true)
    }

    fn execute(self, busy_is_transient: bool) -> Result<CommandResult> {
        tracing::debug!(program = %self.program, args = ?self.args, "running helper");

        let output = Command::new(&self.program)
            .args(&self.args)
            .output()
            .map_err(|e| Error::ExternalTool {
                program: self.program.clone(),
                code: -1,
                stderr: format!("failed to execute: {}. Is it installed?", e),
            })?;

        let result = CommandResult {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !result.success() {
            let stderr = result.stderr_trimmed().to_string();
            if busy_is_transient && is_busy_message(&stderr) {
                return Err(Error::Busy {
                    program: self.program,
                    stderr,
                });
            }
            return Err(Error::ExternalTool {
                program: self.program,
                code: result.code(),
                stderr,
            });
        }

        Ok(result)
    }
}

/// Whether helper stderr says the resource is still in use.
pub fn is_busy_message(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("busy") || lower.contains("in use")
}

/// Bounded retry policy for transient detach/remove failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub attempts: u32,
    /// Delay before the second attempt; doubles after each failure.
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_delay: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Run `op`, retrying while it fails with a transient error.
    ///
    /// When the attempts are exhausted a busy failure is escalated to
    /// [`Error::ExternalTool`]. Non-transient errors return immediately.
    pub fn run<T, F>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let attempts = self.attempts.max(1);
        let mut delay = self.initial_delay;

        for attempt in 1..=attempts {
            match op() {
                Ok(value) => return Ok(value),
                Err(Error::Busy { program, stderr }) => {
                    if attempt == attempts {
                        return Err(Error::ExternalTool {
                            program,
                            code: -1,
                            stderr: format!("still busy after {} attempts: {}", attempts, stderr),
                        });
                    }
                    tracing::debug!(%program, attempt, ?delay, "device busy, retrying");
                    thread::sleep(delay);
                    delay = delay.saturating_mul(2);
                }
                Err(e) => return Err(e),
            }
        }

        unreachable!("retry loop always returns")
    }
}

// =============================================================================
// Tests
// =============================================================================
