//! Fixed set of slots that keep VMs booted and busy.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::slot::Slot;
use super::workdir::{make_instance_dir, remove_instance_dir};
use super::{Info, Instance, Job, MonitorSettings, Shared, SlotState};
use crate::config::{Timeouts, VmConfig};
use crate::machine::Provisioner;
use crate::stats::PoolStats;
use crate::vmimpl::VmError;

const BOOT_ERROR_BUFFER: usize = 16;
const BOOT_FAILURE_BACKOFF: Duration = Duration::from_secs(1);

/// Pool-level settings independent of the VM driver.
#[derive(Clone, Debug)]
pub struct PoolSettings {
    /// Parent of the per-instance temporary directories.
    pub workdir: Utf8PathBuf,
    /// Hang and boot deadlines.
    pub timeouts: Timeouts,
    /// Monitor timing.
    pub monitor: MonitorSettings,
    /// Limits the pool to a single VM.
    pub debug: bool,
    /// Process-wide shutdown signal.
    pub shutdown: CancellationToken,
}

impl PoolSettings {
    /// Settings with default timeouts for a pool rooted at `workdir`.
    #[must_use]
    pub fn new(workdir: impl Into<Utf8PathBuf>, shutdown: CancellationToken) -> Self {
        Self {
            workdir: workdir.into(),
            timeouts: Timeouts::default(),
            monitor: MonitorSettings::default(),
            debug: false,
            shutdown,
        }
    }

    /// Settings described by a loaded configuration.
    #[must_use]
    pub fn from_config(config: &VmConfig, shutdown: CancellationToken) -> Self {
        Self {
            workdir: Utf8PathBuf::from(&config.workdir),
            timeouts: config.timeouts(),
            monitor: MonitorSettings::default(),
            debug: config.debug,
            shutdown,
        }
    }
}

/// A fixed number of VM slots, each booting, running and recycling VMs for
/// as long as [`Pool::run_loop`] runs.
pub struct Pool<P: Provisioner> {
    provisioner: P,
    slots: Vec<Slot<P::Machine>>,
    workdir: Utf8PathBuf,
    shared: Arc<Shared>,
    assign_lock: Mutex<()>,
    boot_errors: mpsc::Sender<VmError>,
    boot_error_rx: Mutex<Option<mpsc::Receiver<VmError>>>,
}

impl<P: Provisioner + 'static> Pool<P> {
    /// Creates a pool with one slot per VM the provisioner offers.
    #[must_use]
    pub fn new(provisioner: P, settings: PoolSettings) -> Self {
        let available = provisioner.count();
        let count = if settings.debug && available > 1 {
            info!(available, "limiting number of VMs from {available} to 1 in debug mode");
            1
        } else {
            available
        };
        let (boot_errors, boot_error_rx) = mpsc::channel(BOOT_ERROR_BUFFER);
        Self {
            provisioner,
            slots: (0..count).map(|_| Slot::new()).collect(),
            workdir: settings.workdir,
            shared: Arc::new(Shared {
                stats: Arc::new(PoolStats::default()),
                timeouts: settings.timeouts,
                monitor: settings.monitor,
                shutdown: settings.shutdown,
            }),
            assign_lock: Mutex::new(()),
            boot_errors,
            boot_error_rx: Mutex::new(Some(boot_error_rx)),
        }
    }

    /// Number of slots.
    #[must_use]
    pub fn count(&self) -> usize {
        self.slots.len()
    }

    /// Pool-wide counters.
    #[must_use]
    pub fn stats(&self) -> &PoolStats {
        &self.shared.stats
    }

    /// Takes the receiver of boot failures. Only the first call gets it.
    pub fn take_boot_errors(&self) -> Option<mpsc::Receiver<VmError>> {
        self.boot_error_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Boots the VM for slot `index` outside of the slot loop.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::InvalidIndex`] for an index outside the pool,
    /// [`VmError::Io`] when the instance directory cannot be created and
    /// the provisioner's error when the VM fails to boot.
    pub async fn create(&self, index: usize) -> Result<Instance<P::Machine>, VmError> {
        if index >= self.slots.len() {
            return Err(VmError::InvalidIndex {
                index,
                count: self.slots.len(),
            });
        }
        let dir = make_instance_dir(&self.workdir, index)?;
        match self.provisioner.create(&dir, index).await {
            Ok(machine) => Ok(Instance::new(machine, dir, index, Arc::clone(&self.shared))),
            Err(err) => {
                discard_dir(&dir);
                Err(err)
            }
        }
    }

    /// Runs every slot until `ctx` is cancelled and all cycles wound down.
    pub async fn run_loop(self: &Arc<Self>, ctx: CancellationToken) {
        let mut slots = JoinSet::new();
        for index in 0..self.slots.len() {
            let pool = Arc::clone(self);
            let slot_ctx = ctx.clone();
            slots.spawn(async move { pool.run_slot(index, &slot_ctx).await });
        }
        while slots.join_next().await.is_some() {}
    }

    async fn run_slot(&self, index: usize, ctx: &CancellationToken) {
        let Some(slot) = self.slots.get(index) else {
            return;
        };
        while !ctx.is_cancelled() {
            let stop = ctx.child_token();
            let handoff = slot.reset(stop.clone());
            self.run_cycle(slot, index, &stop, handoff).await;
            slot.set_state(SlotState::Offline);
        }
        debug!(index, "slot loop stopped");
    }

    async fn run_cycle(
        &self,
        slot: &Slot<P::Machine>,
        index: usize,
        stop: &CancellationToken,
        mut handoff: mpsc::Receiver<Job<P::Machine>>,
    ) {
        debug!(index, "booting instance");
        slot.set_state(SlotState::Booting);
        let started = Instant::now();
        let instance = match self.create(index).await {
            Ok(instance) => Arc::new(instance),
            Err(err) => {
                warn!(index, error = %err, "failed to boot instance");
                self.report_boot_error(err);
                tokio::select! {
                    () = stop.cancelled() => {}
                    () = tokio::time::sleep(BOOT_FAILURE_BACKOFF) => {}
                }
                return;
            }
        };
        self.shared.stats.record_boot(started.elapsed());

        slot.set_state(SlotState::Waiting);
        let assigned = match slot.job() {
            Some(assigned) => Some(assigned),
            None => tokio::select! {
                () = stop.cancelled() => None,
                received = handoff.recv() => received,
            },
        };
        if let Some(run) = assigned {
            slot.set_state(SlotState::Running);
            run(stop.clone(), Arc::clone(&instance), slot.updater()).await;
        }
        if let Err(err) = instance.close().await {
            warn!(index, error = %err, "failed to close instance");
        }
    }

    fn report_boot_error(&self, err: VmError) {
        match self.boot_errors.try_send(err) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => {
                warn!(error = %dropped, "boot error channel full; dropping error");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Gives slot `index` a new job. A cycle running the previous job is
    /// restarted; a cycle waiting for work picks `job` up immediately.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::InvalidIndex`] for an index outside the pool.
    pub fn assign(&self, index: usize, job: Job<P::Machine>) -> Result<(), VmError> {
        let _serialised = self.assign_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = self.slots.get(index).ok_or(VmError::InvalidIndex {
            index,
            count: self.slots.len(),
        })?;
        slot.free(job);
        Ok(())
    }

    /// Gives every slot the same job.
    pub fn set_default(&self, job: &Job<P::Machine>) {
        let _serialised = self.assign_lock.lock().unwrap_or_else(PoisonError::into_inner);
        for slot in &self.slots {
            slot.free(Arc::clone(job));
        }
    }

    /// Snapshot of slot `index`.
    #[must_use]
    pub fn slot_info(&self, index: usize) -> Option<Info> {
        self.slots.get(index).map(Slot::info)
    }

    /// Snapshots of every slot, in index order.
    #[must_use]
    pub fn infos(&self) -> Vec<Info> {
        self.slots.iter().map(Slot::info).collect()
    }

    /// Checks that every instance was closed.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::ActiveInstances`] while any instance is still open.
    pub fn close(&self) -> Result<(), VmError> {
        match self.shared.stats.active_instances() {
            0 => Ok(()),
            count => Err(VmError::ActiveInstances { count }),
        }
    }
}

fn discard_dir(dir: &Utf8Path) {
    if let Err(err) = remove_instance_dir(dir) {
        warn!(error = %err, "failed to remove instance directory");
    }
}
