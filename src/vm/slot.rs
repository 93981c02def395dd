//! Per-slot state and job hand-off.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::Instance;
use crate::machine::Machine;

/// Lifecycle phase of a slot.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum SlotState {
    /// No VM; the slot is between cycles or its boot failed.
    #[default]
    Offline,
    /// A VM is being created.
    Booting,
    /// The VM is up and the slot waits for a job.
    Waiting,
    /// A job owns the VM.
    Running,
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Offline => "offline",
            Self::Booting => "booting",
            Self::Waiting => "waiting",
            Self::Running => "running",
        };
        f.write_str(label)
    }
}

/// Snapshot of a slot for status displays.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Info {
    /// Current phase.
    pub state: SlotState,
    /// Free-form status text set by the running job.
    pub status: String,
    /// When `state` or `status` last changed.
    pub last_update: DateTime<Utc>,
}

impl Default for Info {
    fn default() -> Self {
        Self {
            state: SlotState::Offline,
            status: String::new(),
            last_update: Utc::now(),
        }
    }
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lets a running job publish its status.
///
/// A default updater is detached from any slot.
#[derive(Clone, Debug, Default)]
pub struct InfoUpdater {
    info: Arc<Mutex<Info>>,
}

impl InfoUpdater {
    /// Applies `change` to the slot info and stamps `last_update`.
    pub fn update(&self, change: impl FnOnce(&mut Info)) {
        let mut info = locked(&self.info);
        change(&mut info);
        info.last_update = Utc::now();
    }

    /// Replaces the status text.
    pub fn set_status(&self, status: impl Into<String>) {
        let text = status.into();
        self.update(|info| info.status = text);
    }
}

/// Future returned by a [`Job`].
pub type JobFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Work run against each VM a slot boots.
///
/// The token is cancelled when the job is replaced or the pool shuts down.
pub type Job<M> = Arc<dyn Fn(CancellationToken, Arc<Instance<M>>, InfoUpdater) -> JobFuture + Send + Sync>;

/// Wraps an async closure as a [`Job`].
pub fn job<M, F, Fut>(run: F) -> Job<M>
where
    M: Machine + 'static,
    F: Fn(CancellationToken, Arc<Instance<M>>, InfoUpdater) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |ctx, instance, updater| Box::pin(run(ctx, instance, updater)))
}

struct Assignment<M: Machine> {
    job: Option<Job<M>>,
    stop: Option<CancellationToken>,
    handoff: Option<mpsc::Sender<Job<M>>>,
}

pub(crate) struct Slot<M: Machine> {
    info: Arc<Mutex<Info>>,
    assignment: Mutex<Assignment<M>>,
}

impl<M: Machine> Slot<M> {
    pub(crate) fn new() -> Self {
        Self {
            info: Arc::new(Mutex::new(Info::default())),
            assignment: Mutex::new(Assignment {
                job: None,
                stop: None,
                handoff: None,
            }),
        }
    }

    /// Starts a cycle: clears the info, installs the cycle's stop token and
    /// a fresh hand-off channel.
    pub(crate) fn reset(&self, stop: CancellationToken) -> mpsc::Receiver<Job<M>> {
        let (tx, rx) = mpsc::channel(1);
        *locked(&self.info) = Info::default();
        let mut assignment = locked(&self.assignment);
        assignment.stop = Some(stop);
        assignment.handoff = Some(tx);
        rx
    }

    pub(crate) fn set_state(&self, state: SlotState) {
        let mut info = locked(&self.info);
        info.state = state;
        info.last_update = Utc::now();
    }

    pub(crate) fn info(&self) -> Info {
        locked(&self.info).clone()
    }

    pub(crate) fn updater(&self) -> InfoUpdater {
        InfoUpdater {
            info: Arc::clone(&self.info),
        }
    }

    pub(crate) fn job(&self) -> Option<Job<M>> {
        locked(&self.assignment).job.clone()
    }

    /// Replaces the slot's job. A cycle already running the previous job is
    /// cancelled; a cycle waiting for one receives `job` directly.
    pub(crate) fn free(&self, job: Job<M>) {
        let mut assignment = locked(&self.assignment);
        if let (Some(_), Some(stop)) = (&assignment.job, &assignment.stop) {
            stop.cancel();
        }
        assignment.job = Some(Arc::clone(&job));
        if let Some(handoff) = &assignment.handoff {
            handoff.try_send(job).ok();
        }
    }
}
