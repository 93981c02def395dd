//! Live VM handed to jobs by the pool.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::monitor::{BEFORE_CONTEXT_DEFAULT, Monitor, MonitorContext};
use super::workdir::remove_instance_dir;
use super::{ExitCondition, Shared};
use crate::machine::Machine;
use crate::report::{Report, Reporter};
use crate::vmimpl::VmError;

/// Per-command knobs for [`Instance::run`].
pub struct RunOptions {
    /// Ways for the command to end that are not crashes.
    /// Defaults to [`ExitCondition::NORMAL`].
    pub exit: ExitCondition,
    /// Bytes of console output kept before a crash. Defaults to 128 KiB.
    pub output_size: usize,
    /// Every message counts as progress and postpones the hang deadline.
    pub activity: Option<mpsc::Receiver<()>>,
    /// Called once, as soon as the command is known to be over.
    pub on_finish: Option<Box<dyn FnOnce() + Send>>,
    /// Cancels the command after this long.
    pub timeout: Option<Duration>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            exit: ExitCondition::NORMAL,
            output_size: BEFORE_CONTEXT_DEFAULT,
            activity: None,
            on_finish: None,
            timeout: None,
        }
    }
}

impl RunOptions {
    /// Sets the accepted exit conditions.
    #[must_use]
    pub const fn exit(mut self, exit: ExitCondition) -> Self {
        self.exit = exit;
        self
    }

    /// Sets how much output is kept before a crash.
    #[must_use]
    pub const fn output_size(mut self, output_size: usize) -> Self {
        self.output_size = output_size;
        self
    }

    /// Sets the activity channel.
    #[must_use]
    pub fn activity(mut self, activity: mpsc::Receiver<()>) -> Self {
        self.activity = Some(activity);
        self
    }

    /// Sets the early-finish callback.
    #[must_use]
    pub fn on_finish(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_finish = Some(Box::new(callback));
        self
    }

    /// Sets the command deadline.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunOptions")
            .field("exit", &self.exit)
            .field("output_size", &self.output_size)
            .field("activity", &self.activity.is_some())
            .field("on_finish", &self.on_finish.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Result of [`Instance::run`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RunOutcome {
    /// Console output retained by the monitor.
    pub output: Vec<u8>,
    /// The crash, if the command ended in one.
    pub report: Option<Report>,
}

/// One booted VM owned by a pool slot.
pub struct Instance<M: Machine> {
    machine: M,
    workdir: Utf8PathBuf,
    index: usize,
    shared: Arc<Shared>,
    closed: AtomicBool,
}

impl<M: Machine> fmt::Debug for Instance<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("index", &self.index)
            .field("workdir", &self.workdir)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl<M: Machine> Instance<M> {
    pub(crate) fn new(machine: M, workdir: Utf8PathBuf, index: usize, shared: Arc<Shared>) -> Self {
        shared.stats.instance_opened();
        Self {
            machine,
            workdir,
            index,
            shared,
            closed: AtomicBool::new(false),
        }
    }

    /// Slot index this instance belongs to.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Host directory reserved for this instance.
    #[must_use]
    pub fn workdir(&self) -> &Utf8Path {
        &self.workdir
    }

    /// Runs `command` inside the VM and watches it for crashes.
    ///
    /// The command is cancelled when `ctx` is, when `options.timeout`
    /// elapses, and when this call returns. A crash, hang or unexpected exit
    /// comes back as [`RunOutcome::report`]; `Err` is reserved for failing to
    /// start the command at all.
    ///
    /// # Errors
    ///
    /// Returns the driver's [`VmError`] when the command cannot be started.
    pub async fn run(
        &self,
        ctx: &CancellationToken,
        reporter: &dyn Reporter,
        command: &str,
        options: RunOptions,
    ) -> Result<RunOutcome, VmError> {
        let run_ctx = ctx.child_token();
        let _cancel_on_return = run_ctx.clone().drop_guard();
        if let Some(timeout) = options.timeout {
            let deadline = run_ctx.clone();
            tokio::spawn(async move {
                tokio::select! {
                    () = deadline.cancelled() => {}
                    () = tokio::time::sleep(timeout) => deadline.cancel(),
                }
            });
        }

        debug!(index = self.index, command, "running command");
        let (output, exit) = self.machine.run(run_ctx, command).await?;
        let context = MonitorContext {
            machine: &self.machine,
            reporter,
            stats: &self.shared.stats,
            shutdown: &self.shared.shutdown,
            settings: self.shared.monitor,
            no_output_timeout: self.shared.timeouts.no_output,
        };
        let mut monitor = Monitor::new(context, options.exit, options.output_size, options.on_finish);
        let report = monitor
            .monitor_execution(output, exit, options.activity)
            .await;
        if let Some(crash) = &report {
            debug!(index = self.index, title = %crash.title, crash_type = %crash.crash_type, "command crashed");
        }
        Ok(RunOutcome {
            output: monitor.into_output(),
            report,
        })
    }

    /// Copies a host file into the VM and returns its path there.
    ///
    /// # Errors
    ///
    /// Returns the driver's [`VmError`] when the transfer fails.
    pub async fn copy(&self, host_src: &Utf8Path) -> Result<Utf8PathBuf, VmError> {
        self.machine.copy(host_src).await
    }

    /// Makes host port `port` reachable from inside the VM and returns the
    /// address the guest should dial.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::ForwardPort`] when the port is invalid or a
    /// forward is already set up.
    pub fn forward(&self, port: u16) -> Result<String, VmError> {
        self.machine.forward(port)
    }

    /// Describes the VM for crash reproduction.
    ///
    /// # Errors
    ///
    /// Returns the driver's [`VmError`] when the description is unavailable.
    pub fn info(&self) -> Result<Vec<u8>, VmError> {
        self.machine.info()
    }

    /// Shuts the VM down and removes its working directory.
    ///
    /// Only the first call does anything.
    ///
    /// # Errors
    ///
    /// Returns the first failure among stopping the VM and removing the
    /// directory; both are always attempted.
    pub async fn close(&self) -> Result<(), VmError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let stopped = self.machine.close().await;
        let removed = remove_instance_dir(&self.workdir);
        self.shared.stats.instance_closed();
        if let Err(err) = &removed {
            warn!(index = self.index, error = %err, "failed to remove instance directory");
        }
        stopped.and(removed)
    }
}
