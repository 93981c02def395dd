//! Bounded host command execution behind a runner seam.

use std::ffi::OsString;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use super::VmError;

/// Result of running a host command to completion.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ProcessOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: Vec<u8>,
    /// Captured standard error.
    pub stderr: Vec<u8>,
}

impl ProcessOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Returns stdout followed by stderr.
    #[must_use]
    pub fn combined(&self) -> Vec<u8> {
        let mut output = Vec::with_capacity(self.stdout.len() + self.stderr.len());
        output.extend_from_slice(&self.stdout);
        output.extend_from_slice(&self.stderr);
        output
    }

    /// Human readable representation of the exit status.
    #[must_use]
    pub fn status_text(&self) -> String {
        self.code
            .map_or_else(|| String::from("unknown"), |code| code.to_string())
    }
}

/// Future returned by [`CommandRunner::run`].
pub type RunnerFuture<'a> = Pin<Box<dyn Future<Output = Result<ProcessOutput, VmError>> + Send + 'a>>;

/// Abstraction over host command execution to support fakes in tests.
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with `args`, capturing stdout and stderr and killing
    /// the process once `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::Spawn`] if the command cannot be started and
    /// [`VmError::Timeout`] when it outlives `timeout`.
    fn run<'a>(&'a self, program: &'a str, args: &'a [OsString], timeout: Duration)
    -> RunnerFuture<'a>;
}

/// Real command runner that shells out to the host operating system.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
        timeout: Duration,
    ) -> RunnerFuture<'a> {
        Box::pin(async move {
            let child = Command::new(program)
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|err| VmError::Spawn {
                    program: program.to_owned(),
                    message: err.to_string(),
                })?;

            // Dropping the wait future on timeout drops the child, which kills it.
            let output = tokio::time::timeout(timeout, child.wait_with_output())
                .await
                .map_err(|_| VmError::Timeout {
                    program: program.to_owned(),
                    timeout,
                })?
                .map_err(|err| VmError::io(format!("waiting for {program}"), &err))?;

            Ok(ProcessOutput {
                code: output.status.code(),
                stdout: output.stdout,
                stderr: output.stderr,
            })
        })
    }
}

/// Runs a command and returns its combined output, treating a non-zero exit
/// status as an error.
///
/// # Errors
///
/// Propagates runner errors and returns [`VmError::CommandFailure`] when the
/// command exits unsuccessfully.
pub async fn run_checked<R: CommandRunner + ?Sized>(
    runner: &R,
    program: &str,
    args: &[OsString],
    timeout: Duration,
) -> Result<Vec<u8>, VmError> {
    let output = runner.run(program, args, timeout).await?;
    if output.is_success() {
        return Ok(output.combined());
    }
    Err(VmError::CommandFailure {
        program: program.to_owned(),
        status_text: output.status_text(),
        output: String::from_utf8_lossy(&output.combined()).into_owned(),
    })
}
