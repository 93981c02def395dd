//! Test support utilities shared across unit and integration tests.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;

use crate::machine::{
    CommandExit, CommandOutput, ExitReceiver, Machine, MachineFuture, Provisioner,
};
use crate::report::Report;
use crate::vmimpl::{CommandRunner, ProcessOutput, RunnerFuture, VmError};

fn locked<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<ProcessOutput>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        locked(&self.invocations).clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        locked(&self.responses).push_back(ProcessOutput {
            code,
            stdout: stdout.into().into_bytes(),
            stderr: stderr.into().into_bytes(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
        _timeout: Duration,
    ) -> RunnerFuture<'a> {
        locked(&self.invocations).push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        let response = locked(&self.responses)
            .pop_front()
            .ok_or_else(|| VmError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            });
        Box::pin(async move { response })
    }
}

/// Scripted behaviour of one command started on a [`FakeMachine`].
#[derive(Clone, Debug, Default)]
pub struct ScriptedRun {
    /// Chunks published on the output stream as soon as the command starts.
    pub output: Vec<Bytes>,
    /// Exit delivered after the delay; `None` keeps the command running
    /// until its context is cancelled.
    pub exit: Option<(Duration, CommandExit)>,
}

impl ScriptedRun {
    /// A command that prints `chunks` and never exits on its own.
    #[must_use]
    pub fn printing<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        Self {
            output: chunks.into_iter().map(Into::into).collect(),
            exit: None,
        }
    }

    /// Delivers `exit` once `after` has elapsed.
    #[must_use]
    pub fn exiting(mut self, after: Duration, exit: CommandExit) -> Self {
        self.exit = Some((after, exit));
        self
    }
}

#[derive(Debug)]
struct FakeMachineState {
    console: broadcast::Sender<Bytes>,
    runs: Mutex<VecDeque<ScriptedRun>>,
    commands: Mutex<Vec<String>>,
    diagnosed: Mutex<Vec<String>>,
    diagnosis: Mutex<Vec<u8>>,
    forward_port: Mutex<Option<u16>>,
    closes: AtomicUsize,
}

/// In-memory [`Machine`] whose commands follow a script.
///
/// Clones share state, so a test can keep a handle while the pool owns
/// another.
#[derive(Clone, Debug)]
pub struct FakeMachine {
    state: Arc<FakeMachineState>,
}

impl Default for FakeMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeMachine {
    /// Creates a machine with no scripted runs.
    #[must_use]
    pub fn new() -> Self {
        let (console, _) = broadcast::channel(1024);
        Self {
            state: Arc::new(FakeMachineState {
                console,
                runs: Mutex::new(VecDeque::new()),
                commands: Mutex::new(Vec::new()),
                diagnosed: Mutex::new(Vec::new()),
                diagnosis: Mutex::new(b"fake registers\n".to_vec()),
                forward_port: Mutex::new(None),
                closes: AtomicUsize::new(0),
            }),
        }
    }

    /// Queues the behaviour of the next command.
    pub fn script(&self, run: ScriptedRun) {
        locked(&self.state.runs).push_back(run);
    }

    /// Publishes console output to every running command.
    pub fn console(&self, chunk: impl Into<Bytes>) {
        self.state.console.send(chunk.into()).ok();
    }

    /// Sets the bytes returned by [`Machine::diagnose`].
    pub fn set_diagnosis(&self, diagnosis: impl Into<Vec<u8>>) {
        *locked(&self.state.diagnosis) = diagnosis.into();
    }

    /// Commands started so far.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        locked(&self.state.commands).clone()
    }

    /// Titles of the reports passed to [`Machine::diagnose`].
    #[must_use]
    pub fn diagnosed(&self) -> Vec<String> {
        locked(&self.state.diagnosed).clone()
    }

    /// Number of times [`Machine::close`] ran.
    #[must_use]
    pub fn closes(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }
}

impl Machine for FakeMachine {
    fn run<'a>(
        &'a self,
        ctx: CancellationToken,
        command: &'a str,
    ) -> MachineFuture<'a, Result<(CommandOutput, ExitReceiver), VmError>> {
        locked(&self.state.commands).push(command.to_owned());
        let script = locked(&self.state.runs).pop_front().unwrap_or_default();
        let output = CommandOutput::new(self.state.console.subscribe());
        for chunk in script.output {
            self.state.console.send(chunk).ok();
        }
        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(async move {
            let exit = match script.exit {
                Some((after, exit)) => tokio::select! {
                    () = ctx.cancelled() => CommandExit::TimedOut,
                    () = tokio::time::sleep(after) => exit,
                },
                None => {
                    ctx.cancelled().await;
                    CommandExit::TimedOut
                }
            };
            exit_tx.send(exit).ok();
        });
        Box::pin(async move { Ok((output, exit_rx)) })
    }

    fn copy<'a>(&'a self, host_src: &'a Utf8Path) -> MachineFuture<'a, Result<Utf8PathBuf, VmError>> {
        let copied = host_src
            .file_name()
            .map(|name| Utf8Path::new("/").join(name))
            .ok_or_else(|| VmError::Config(format!("cannot copy {host_src}")));
        Box::pin(async move { copied })
    }

    fn forward(&self, port: u16) -> Result<String, VmError> {
        let mut forward = locked(&self.state.forward_port);
        if port == 0 || forward.is_some() {
            return Err(VmError::ForwardPort(format!("cannot forward {port}")));
        }
        *forward = Some(port);
        Ok(format!("localhost:{port}"))
    }

    fn info(&self) -> Result<Vec<u8>, VmError> {
        Ok(b"fake machine\n".to_vec())
    }

    fn diagnose<'a>(&'a self, report: &'a Report) -> MachineFuture<'a, Vec<u8>> {
        locked(&self.state.diagnosed).push(report.title.clone());
        let diagnosis = locked(&self.state.diagnosis).clone();
        Box::pin(async move { diagnosis })
    }

    fn close(&self) -> MachineFuture<'_, Result<(), VmError>> {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }
}

/// [`Provisioner`] handing out clones of one [`FakeMachine`].
///
/// Clones share the failure queue and the creation counter.
#[derive(Clone, Debug)]
pub struct FakeProvisioner {
    count: usize,
    machine: FakeMachine,
    failures: Arc<Mutex<VecDeque<VmError>>>,
    created: Arc<AtomicUsize>,
}

impl FakeProvisioner {
    /// Creates a provisioner for `count` slots.
    #[must_use]
    pub fn new(count: usize, machine: FakeMachine) -> Self {
        Self {
            count,
            machine,
            failures: Arc::new(Mutex::new(VecDeque::new())),
            created: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Makes the next `create` call fail with `err`.
    pub fn fail_next(&self, err: VmError) {
        locked(&self.failures).push_back(err);
    }

    /// Number of machines created successfully.
    #[must_use]
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl Provisioner for FakeProvisioner {
    type Machine = FakeMachine;

    fn count(&self) -> usize {
        self.count
    }

    fn create<'a>(
        &'a self,
        _workdir: &'a Utf8Path,
        _index: usize,
    ) -> MachineFuture<'a, Result<Self::Machine, VmError>> {
        let result = locked(&self.failures).pop_front().map_or_else(
            || {
                self.created.fetch_add(1, Ordering::SeqCst);
                Ok(self.machine.clone())
            },
            Err,
        );
        Box::pin(async move { result })
    }
}
