//! SSH/SCP argument construction and the boot-time readiness waiter.

use std::ffi::OsString;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::command::CommandRunner;
use super::merger::MergerError;
use super::VmError;

/// SSH client binary.
pub const SSH_BIN: &str = "ssh";
/// SCP client binary.
pub const SCP_BIN: &str = "scp";

/// Delay between readiness probes.
pub const SSH_POLL_INTERVAL: Duration = Duration::from_secs(5);
const SSH_PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection details for one VM's SSH endpoint.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshOptions {
    /// Host to connect to.
    pub addr: String,
    /// Forwarded SSH port on `addr`.
    pub port: u16,
    /// Private key to authenticate with.
    pub key: Option<Utf8PathBuf>,
    /// Remote user name.
    pub user: String,
}

impl SshOptions {
    /// Returns `user@addr`.
    #[must_use]
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.addr)
    }
}

/// Builds the option list for `ssh`.
#[must_use]
pub fn ssh_args(
    debug: bool,
    key: Option<&Utf8Path>,
    port: u16,
    forward_port: Option<u16>,
) -> Vec<OsString> {
    let mut args = common_args("-p", key, port);
    if let Some(forward) = forward_port {
        args.push(OsString::from("-R"));
        args.push(OsString::from(format!("{forward}:127.0.0.1:{forward}")));
    }
    if debug {
        args.push(OsString::from("-v"));
    }
    args
}

/// Builds the option list for `scp`.
#[must_use]
pub fn scp_args(debug: bool, key: Option<&Utf8Path>, port: u16) -> Vec<OsString> {
    let mut args = common_args("-P", key, port);
    if debug {
        args.push(OsString::from("-v"));
    }
    args
}

fn common_args(port_flag: &str, key: Option<&Utf8Path>, port: u16) -> Vec<OsString> {
    let mut args: Vec<OsString> = [
        port_flag,
        &port.to_string(),
        "-F",
        "/dev/null",
        "-o",
        "UserKnownHostsFile=/dev/null",
        "-o",
        "IdentitiesOnly=yes",
        "-o",
        "BatchMode=yes",
        "-o",
        "StrictHostKeyChecking=no",
        "-o",
        "ConnectTimeout=10",
    ]
    .into_iter()
    .map(OsString::from)
    .collect();
    if let Some(path) = key {
        args.push(OsString::from("-i"));
        args.push(OsString::from(path.as_str()));
    }
    args
}

/// Polls a VM over SSH until it answers or a deadline passes.
#[derive(Debug)]
pub struct SshWaiter<'a, R: CommandRunner + ?Sized> {
    runner: &'a R,
    options: &'a SshOptions,
    debug: bool,
    timeout: Duration,
}

impl<'a, R: CommandRunner + ?Sized> SshWaiter<'a, R> {
    /// Creates a waiter that gives up after `timeout`.
    #[must_use]
    pub const fn new(runner: &'a R, options: &'a SshOptions, debug: bool, timeout: Duration) -> Self {
        Self {
            runner,
            options,
            debug,
            timeout,
        }
    }

    /// Probes with `ssh ... pwd` until it succeeds.
    ///
    /// Stops early when `stop` fires (the VM's console stream ended, meaning
    /// QEMU exited) or when `shutdown` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::Boot`] describing the last probe failure when the
    /// deadline passes, or why waiting was abandoned.
    pub async fn wait(
        &self,
        stop: &mut oneshot::Receiver<MergerError>,
        shutdown: &CancellationToken,
    ) -> Result<(), VmError> {
        let started = Instant::now();
        let mut args = ssh_args(self.debug, self.options.key.as_deref(), self.options.port, None);
        args.push(OsString::from(self.options.destination()));
        args.push(OsString::from("pwd"));

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    return Err(boot_error("shutdown requested while waiting for SSH"));
                }
                ended = &mut *stop => {
                    let reason = ended.map_or_else(
                        |_| String::from("console stream dropped"),
                        |err| err.to_string(),
                    );
                    return Err(boot_error(format!("VM exited before SSH became reachable: {reason}")));
                }
                () = tokio::time::sleep(SSH_POLL_INTERVAL) => {}
            }

            let last_error = match self.runner.run(SSH_BIN, &args, SSH_PROBE_TIMEOUT).await {
                Ok(output) if output.is_success() => {
                    debug!(port = self.options.port, elapsed = ?started.elapsed(), "ssh is reachable");
                    return Ok(());
                }
                Ok(output) => String::from_utf8_lossy(&output.combined()).trim().to_owned(),
                Err(err) => err.to_string(),
            };
            debug!(port = self.options.port, error = %last_error, "ssh not reachable yet");

            if started.elapsed() > self.timeout {
                return Err(boot_error(format!("can't ssh into the instance: {last_error}")));
            }
        }
    }
}

/// Waits for SSH with the default poll interval.
///
/// # Errors
///
/// See [`SshWaiter::wait`].
pub async fn wait_for_ssh<R: CommandRunner + ?Sized>(
    runner: &R,
    options: &SshOptions,
    debug: bool,
    timeout: Duration,
    stop: &mut oneshot::Receiver<MergerError>,
    shutdown: &CancellationToken,
) -> Result<(), VmError> {
    SshWaiter::new(runner, options, debug, timeout)
        .wait(stop, shutdown)
        .await
}

fn boot_error(message: impl Into<String>) -> VmError {
    VmError::Boot {
        message: message.into(),
        output: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedRunner;
    use crate::vmimpl::merger::MergerErrorKind;
    use rstest::{fixture, rstest};

    #[fixture]
    fn options() -> SshOptions {
        SshOptions {
            addr: String::from("localhost"),
            port: 2222,
            key: Some(Utf8PathBuf::from("/keys/id_rsa")),
            user: String::from("root"),
        }
    }

    fn rendered(args: &[OsString]) -> String {
        args.iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn ssh_args_include_key_and_reverse_forward() {
        let args = ssh_args(false, Some(Utf8Path::new("/keys/id_rsa")), 2222, Some(8080));

        assert_eq!(
            rendered(&args),
            "-p 2222 -F /dev/null -o UserKnownHostsFile=/dev/null -o IdentitiesOnly=yes \
             -o BatchMode=yes -o StrictHostKeyChecking=no -o ConnectTimeout=10 \
             -i /keys/id_rsa -R 8080:127.0.0.1:8080"
        );
    }

    #[test]
    fn ssh_args_in_debug_mode_are_verbose() {
        let args = rendered(&ssh_args(true, None, 22, None));

        assert!(args.ends_with("-v"), "args: {args}");
        assert!(!args.contains("-i "), "args: {args}");
    }

    #[test]
    fn scp_args_use_capital_port_flag() {
        let args = rendered(&scp_args(false, None, 2200));

        assert!(args.starts_with("-P 2200 -F /dev/null"), "args: {args}");
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn wait_succeeds_after_failed_probes(options: SshOptions) {
        let runner = ScriptedRunner::new();
        runner.push_failure(255);
        runner.push_success();
        let (_tx, mut stop) = oneshot::channel();

        SshWaiter::new(&runner, &options, false, Duration::from_secs(60))
            .wait(&mut stop, &CancellationToken::new())
            .await
            .expect("ssh should become reachable");

        let invocations = runner.invocations();
        assert_eq!(invocations.len(), 2);
        let command = invocations.first().expect("probe").command_string();
        assert!(command.starts_with("ssh -p 2222"), "command: {command}");
        assert!(command.ends_with("root@localhost pwd"), "command: {command}");
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn wait_gives_up_after_deadline(options: SshOptions) {
        let runner = ScriptedRunner::new();
        for _ in 0..4 {
            runner.push_output(Some(255), "", "Connection refused");
        }
        let (_tx, mut stop) = oneshot::channel();

        let err = SshWaiter::new(&runner, &options, false, Duration::from_secs(12))
            .wait(&mut stop, &CancellationToken::new())
            .await
            .expect_err("deadline should pass");

        assert!(err.is_boot_error());
        assert!(
            err.to_string().contains("can't ssh into the instance: Connection refused"),
            "unexpected error: {err}"
        );
        assert_eq!(runner.invocations().len(), 3);
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn wait_stops_when_vm_exits(options: SshOptions) {
        let runner = ScriptedRunner::new();
        let (tx, mut stop) = oneshot::channel();
        tx.send(MergerError {
            name: String::from("qemu"),
            kind: MergerErrorKind::Eof,
        })
        .expect("send");

        let err = SshWaiter::new(&runner, &options, false, Duration::from_secs(60))
            .wait(&mut stop, &CancellationToken::new())
            .await
            .expect_err("exited VM cannot boot");

        assert!(err.to_string().contains("VM exited before SSH became reachable"));
        assert!(runner.invocations().is_empty());
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn wait_honours_shutdown(options: SshOptions) {
        let runner = ScriptedRunner::new();
        let (_tx, mut stop) = oneshot::channel();
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let err = wait_for_ssh(&runner, &options, false, Duration::from_secs(60), &mut stop, &shutdown)
            .await
            .expect_err("shutdown aborts the wait");

        assert!(err.to_string().contains("shutdown"));
    }
}
