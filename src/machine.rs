//! Seam between the pool/monitor and concrete VM drivers.
//!
//! A [`Provisioner`] boots machines; a [`Machine`] is one live VM that can
//! run commands, receive files and produce diagnostics. The QEMU driver in
//! [`crate::qemu`] is the production implementation; tests plug in the fakes
//! from [`crate::test_support`].

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::report::Report;
use crate::vmimpl::VmError;

/// Future returned by machine and provisioner operations.
pub type MachineFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// How a remote command finished. Delivered exactly once per run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CommandExit {
    /// The command exited successfully.
    Exited,
    /// The command's context was cancelled before it finished.
    TimedOut,
    /// The command or its transport failed; carries a description.
    Failed(String),
}

/// Receiving half of a command's single exit notification.
pub type ExitReceiver = oneshot::Receiver<CommandExit>;

/// Live console and command output observed while a command runs.
///
/// Wraps a broadcast subscription so that concurrent runs on the same
/// machine each see the full stream. Slow consumers lose the oldest chunks
/// rather than stalling the VM.
#[derive(Debug)]
pub struct CommandOutput {
    rx: broadcast::Receiver<Bytes>,
}

impl CommandOutput {
    /// Wraps a broadcast receiver.
    #[must_use]
    pub const fn new(rx: broadcast::Receiver<Bytes>) -> Self {
        Self { rx }
    }

    /// Waits for the next chunk; returns `None` once every producer is gone.
    ///
    /// Cancel safe.
    pub async fn recv(&mut self) -> Option<Bytes> {
        loop {
            match self.rx.recv().await {
                Ok(chunk) => return Some(chunk),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "console consumer fell behind; chunks dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Returns a chunk that is already buffered, without waiting.
    pub fn try_recv(&mut self) -> Option<Bytes> {
        loop {
            match self.rx.try_recv() {
                Ok(chunk) => return Some(chunk),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "console consumer fell behind; chunks dropped");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }
}

/// One live VM.
pub trait Machine: Send + Sync {
    /// Starts `command` inside the VM.
    ///
    /// The command is cancelled when `ctx` is cancelled. Output arrives on
    /// the returned [`CommandOutput`] and the exit status on the returned
    /// [`ExitReceiver`].
    ///
    /// # Errors
    ///
    /// Returns [`VmError`] when the command cannot be started.
    fn run<'a>(
        &'a self,
        ctx: CancellationToken,
        command: &'a str,
    ) -> MachineFuture<'a, Result<(CommandOutput, ExitReceiver), VmError>>;

    /// Copies a host file into the VM and returns its path inside the VM.
    ///
    /// # Errors
    ///
    /// Returns [`VmError`] when the transfer fails.
    fn copy<'a>(&'a self, host_src: &'a Utf8Path) -> MachineFuture<'a, Result<Utf8PathBuf, VmError>>;

    /// Sets up a reverse forward so the VM can reach `port` on the host and
    /// returns the address to use from inside the VM.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::ForwardPort`] when forwarding is not possible.
    fn forward(&self, port: u16) -> Result<String, VmError>;

    /// Returns a human-readable description of how the VM was started.
    ///
    /// # Errors
    ///
    /// Returns [`VmError`] when the description is unavailable.
    fn info(&self) -> Result<Vec<u8>, VmError>;

    /// Collects extra state (registers, lock statistics) for a crash.
    /// Failures are reported inline in the returned bytes.
    fn diagnose<'a>(&'a self, report: &'a Report) -> MachineFuture<'a, Vec<u8>>;

    /// Stops the VM and releases its host resources. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`VmError`] when teardown fails.
    fn close(&self) -> MachineFuture<'_, Result<(), VmError>>;
}

/// Boots [`Machine`]s for the pool.
pub trait Provisioner: Send + Sync {
    /// Machine type produced by this provisioner.
    type Machine: Machine + 'static;

    /// Number of VMs this provisioner is configured to run concurrently.
    fn count(&self) -> usize;

    /// Boots the VM for slot `index`, using `workdir` for its temporary
    /// files.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::Boot`] when the VM does not come up.
    fn create<'a>(
        &'a self,
        workdir: &'a Utf8Path,
        index: usize,
    ) -> MachineFuture<'a, Result<Self::Machine, VmError>>;
}
