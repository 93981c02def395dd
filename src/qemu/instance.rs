//! One running QEMU virtual machine.

use std::ffi::OsString;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::args::{BootPorts, build_qemu_args};
use super::diagnose;
use super::qmp::QmpClient;
use super::QemuSettings;
use crate::machine::{CommandOutput, ExitReceiver, Machine, MachineFuture};
use crate::report::Report;
use crate::vmimpl::ssh::{SCP_BIN, SSH_BIN};
use crate::vmimpl::{
    CommandRunner, OutputMerger, SshOptions, SshWaiter, VmError, multiplex,
    run_checked, scp_args, ssh_args, unused_tcp_port,
};

/// Merger stream carrying QEMU's stdout (the serial console).
pub const QEMU_STREAM: &str = "qemu";
/// Merger stream carrying QEMU's stderr.
pub const QEMU_STDERR_STREAM: &str = "qemu-stderr";

/// Directory inside the guest where commands run and files are copied.
pub const TARGET_DIR: &str = "/";

const COPY_TIMEOUT: Duration = Duration::from_secs(180);
const STDERR_DRAIN: Duration = Duration::from_secs(1);
const CONSOLE_LOG: &str = "console.log";

/// A booted QEMU VM reachable over SSH.
#[derive(Debug)]
pub struct QemuInstance<R: CommandRunner> {
    index: usize,
    settings: Arc<QemuSettings>,
    version: String,
    workdir: Utf8PathBuf,
    ssh: SshOptions,
    runner: R,
    args: Vec<String>,
    monitor_port: u16,
    forward_port: Mutex<Option<u16>>,
    qmp: tokio::sync::Mutex<Option<QmpClient>>,
    child: tokio::sync::Mutex<Option<Child>>,
    merger: OutputMerger,
    console_closed: CancellationToken,
}

impl<R: CommandRunner> QemuInstance<R> {
    /// Starts QEMU for slot `index` and waits until the guest answers SSH.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::Boot`] carrying the console output captured so far
    /// when QEMU cannot be started, exits early, or SSH never comes up.
    pub(crate) async fn boot(
        settings: Arc<QemuSettings>,
        version: String,
        runner: R,
        workdir: &Utf8Path,
        index: usize,
        shutdown: &CancellationToken,
    ) -> Result<Self, VmError> {
        let ports = BootPorts {
            monitor: unused_tcp_port()?,
            ssh: unused_tcp_port()?,
        };
        let args = build_qemu_args(&settings, index, ports);
        info!(index, binary = %settings.binary, ?args, "starting VM");

        let mut child = Command::new(&settings.binary)
            .args(&args)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| VmError::Boot {
                message: format!("failed to start {} {args:?}: {err}", settings.binary),
                output: Vec::new(),
            })?;

        let tee = if settings.debug {
            let path = workdir.join(CONSOLE_LOG);
            match tokio::fs::File::create(&path).await {
                Ok(file) => Some(file),
                Err(err) => {
                    warn!(index, path = %path, error = %err, "cannot create console log");
                    None
                }
            }
        } else {
            None
        };
        let merger = OutputMerger::new(tee);
        let boot_output = merger.subscribe();
        if let Some(stdout) = child.stdout.take() {
            merger.add(QEMU_STREAM, stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            merger.add(QEMU_STDERR_STREAM, stderr);
        }
        let console_done = merger.take_error(QEMU_STREAM);
        let stderr_done = merger.take_error(QEMU_STDERR_STREAM);

        let ssh = SshOptions {
            addr: String::from("localhost"),
            port: ports.ssh,
            key: settings.ssh_key.clone(),
            user: settings.ssh_user.clone(),
        };
        let instance = Self {
            index,
            version,
            workdir: workdir.to_owned(),
            ssh,
            runner,
            args,
            monitor_port: ports.monitor,
            forward_port: Mutex::new(None),
            qmp: tokio::sync::Mutex::new(None),
            child: tokio::sync::Mutex::new(Some(child)),
            merger,
            settings,
            console_closed: CancellationToken::new(),
        };

        let Some(mut stop) = console_done else {
            instance.shutdown().await;
            return Err(VmError::Boot {
                message: String::from("QEMU console is not available"),
                output: Vec::new(),
            });
        };

        let (collector_stop, collected) = collect_boot_output(boot_output);
        let waited = SshWaiter::new(
            &instance.runner,
            &instance.ssh,
            instance.settings.debug,
            instance.settings.boot_timeout,
        )
        .wait(&mut stop, shutdown)
        .await;

        if let Err(err) = waited {
            // QEMU reports setup failures on stderr just before exiting.
            if let Some(done) = stderr_done {
                tokio::time::timeout(STDERR_DRAIN, done).await.ok();
            }
            collector_stop.send(()).ok();
            let output = collected.await.unwrap_or_default();
            instance.shutdown().await;
            return Err(err.into_boot_error(output));
        }
        collector_stop.send(()).ok();
        collected.await.ok();
        let console_closed = instance.console_closed.clone();
        tokio::spawn(async move {
            // An aborted reader drops the sender; only a real EOF or read
            // error means the VM went away.
            if let Ok(ended) = stop.await {
                debug!(index, reason = %ended, "VM console closed");
                console_closed.cancel();
            }
        });
        info!(index, ssh_port = ports.ssh, "VM booted");
        Ok(instance)
    }

    fn ssh_base_args(&self) -> Vec<OsString> {
        let mut args = ssh_args(
            self.settings.debug,
            self.ssh.key.as_deref(),
            self.ssh.port,
            None,
        );
        args.push(OsString::from(self.ssh.destination()));
        args
    }

    fn current_forward_port(&self) -> Option<u16> {
        *self
            .forward_port
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn run_command(
        &self,
        ctx: CancellationToken,
        command: &str,
    ) -> Result<(CommandOutput, ExitReceiver), VmError> {
        let name = format!("ssh-{}", Uuid::new_v4());
        let mut args = ssh_args(
            self.settings.debug,
            self.ssh.key.as_deref(),
            self.ssh.port,
            self.current_forward_port(),
        );
        args.push(OsString::from(self.ssh.destination()));
        args.push(OsString::from(format!("cd {TARGET_DIR} && {command}")));
        debug!(index = self.index, ?args, "running command");

        // Subscribe before spawning so no output is missed.
        let output = self.merger.subscribe();
        let mut child = Command::new(SSH_BIN)
            .args(&args)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| VmError::Spawn {
                program: String::from(SSH_BIN),
                message: err.to_string(),
            })?;
        if let Some(stdout) = child.stdout.take() {
            self.merger.add(name.clone(), stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            self.merger.add_untracked(format!("{name}-stderr"), stderr);
        }
        let done = self.merger.take_error(&name).ok_or_else(|| VmError::Infra {
            message: String::from("ssh stdout is not available"),
            output: Vec::new(),
        })?;
        Ok((
            output,
            multiplex(ctx, self.console_closed.clone(), child, done, name),
        ))
    }

    async fn copy_file(&self, host_src: &Utf8Path) -> Result<Utf8PathBuf, VmError> {
        let base = host_src
            .file_name()
            .ok_or_else(|| VmError::Config(format!("cannot copy {host_src}: no file name")))?;
        let vm_dst = Utf8Path::new(TARGET_DIR).join(base);
        let mut args = scp_args(self.settings.debug, self.ssh.key.as_deref(), self.ssh.port);
        args.push(OsString::from(host_src.as_str()));
        args.push(OsString::from(format!("{}:{vm_dst}", self.ssh.destination())));
        debug!(index = self.index, ?args, "copying file");
        run_checked(&self.runner, SCP_BIN, &args, COPY_TIMEOUT).await?;
        Ok(vm_dst)
    }

    async fn hmp(&self, command: &str, cpu: usize) -> Result<String, VmError> {
        let mut qmp = self.qmp.lock().await;
        if qmp.is_none() {
            *qmp = Some(QmpClient::connect(self.monitor_port).await?);
        }
        let Some(client) = qmp.as_mut() else {
            return Err(VmError::Qmp(String::from("QMP connection unavailable")));
        };
        let result = client.hmp(command, cpu).await;
        if result.is_err() {
            // Reconnect on the next request.
            *qmp = None;
        }
        result
    }

    async fn dump_registers(&self) -> Vec<u8> {
        let mut output = diagnose::registers_header().into_bytes();
        for cpu in 0..self.settings.cpu {
            match self.hmp("info registers", cpu).await {
                Ok(registers) => {
                    output.extend_from_slice(format!("info registers vcpu {cpu}\n").as_bytes());
                    output.extend_from_slice(registers.as_bytes());
                }
                Err(err) => {
                    warn!(index = self.index, cpu, error = %err, "failed reading registers");
                    output.extend_from_slice(format!("Failed reading regs: {err}\n").as_bytes());
                }
            }
        }
        output
    }

    async fn diagnose_report(&self, report: &Report) -> Vec<u8> {
        if diagnose::wants_lockdep_dump(report) {
            return diagnose::dump_lockdep(&self.runner, &self.ssh_base_args()).await;
        }
        self.dump_registers().await
    }

    async fn shutdown(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(err) = child.start_kill() {
                debug!(index = self.index, error = %err, "QEMU already exited");
            }
            if let Err(err) = child.wait().await {
                warn!(index = self.index, error = %err, "failed to reap QEMU");
            }
        }
        self.merger.shutdown().await;
        self.qmp.lock().await.take();
    }

    fn describe(&self) -> Vec<u8> {
        format!(
            "{}\n{} {:?}\n",
            self.version, self.settings.binary, self.args
        )
        .into_bytes()
    }

    fn set_forward(&self, port: u16) -> Result<String, VmError> {
        if port == 0 {
            return Err(VmError::ForwardPort(String::from("forward port is zero")));
        }
        let mut forward = self
            .forward_port
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if forward.is_some() {
            return Err(VmError::ForwardPort(String::from("forward port already set")));
        }
        *forward = Some(port);
        Ok(format!("localhost:{port}"))
    }
}

impl<R: CommandRunner> Machine for QemuInstance<R> {
    fn run<'a>(
        &'a self,
        ctx: CancellationToken,
        command: &'a str,
    ) -> MachineFuture<'a, Result<(CommandOutput, ExitReceiver), VmError>> {
        Box::pin(self.run_command(ctx, command))
    }

    fn copy<'a>(&'a self, host_src: &'a Utf8Path) -> MachineFuture<'a, Result<Utf8PathBuf, VmError>> {
        Box::pin(self.copy_file(host_src))
    }

    fn forward(&self, port: u16) -> Result<String, VmError> {
        self.set_forward(port)
    }

    fn info(&self) -> Result<Vec<u8>, VmError> {
        Ok(self.describe())
    }

    fn diagnose<'a>(&'a self, report: &'a Report) -> MachineFuture<'a, Vec<u8>> {
        Box::pin(self.diagnose_report(report))
    }

    fn close(&self) -> MachineFuture<'_, Result<(), VmError>> {
        Box::pin(async move {
            self.shutdown().await;
            Ok(())
        })
    }
}

/// Buffers console output until told to stop, then drains whatever is
/// already queued and returns it.
fn collect_boot_output(
    mut output: CommandOutput,
) -> (oneshot::Sender<()>, tokio::task::JoinHandle<Vec<u8>>) {
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        let mut collected = Vec::new();
        loop {
            tokio::select! {
                biased;
                _ = &mut stop_rx => break,
                received = output.recv() => match received {
                    Some(chunk) => collected.extend_from_slice(&chunk),
                    None => break,
                },
            }
        }
        while let Some(chunk) = output.try_recv() {
            collected.extend_from_slice(&chunk);
        }
        collected
    });
    (stop_tx, handle)
}
