//! QEMU-backed VM driver.
//!
//! [`QemuPool`] validates settings once, then boots [`QemuInstance`]s on
//! demand. Booting is retried when QEMU trips over a host port or device
//! that another VM grabbed in the meantime.

use std::ffi::OsString;
use std::future::Future;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

mod args;
pub mod diagnose;
mod instance;
pub mod qmp;

pub use args::{BootPorts, build_qemu_args};
pub use instance::{QEMU_STDERR_STREAM, QEMU_STREAM, QemuInstance, TARGET_DIR};

use crate::config::{COUNT_RANGE, CPU_RANGE, MEM_RANGE, VmConfig};
use crate::machine::{MachineFuture, Provisioner};
use crate::vmimpl::{CommandRunner, ProcessCommandRunner, VmError, run_checked};

/// Upper bound on provisioning retries after transient failures.
pub const MAX_PROVISION_RETRIES: usize = 1000;

const VERSION_TIMEOUT: Duration = Duration::from_secs(60);

// Older QEMU prints "could", newer "Could".
const TRANSIENT_FAILURES: [&str; 3] = [
    "ould not set up host forwarding rule",
    "Device or resource busy",
    "Address already in use",
];

/// Resolved settings shared by every VM a [`QemuPool`] boots.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct QemuSettings {
    /// QEMU system emulator binary.
    pub binary: String,
    /// Number of VMs.
    pub count: usize,
    /// vCPUs per VM.
    pub cpu: usize,
    /// Memory per VM in MiB.
    pub mem: usize,
    /// Raw disk image.
    pub image: Utf8PathBuf,
    /// Kernel image.
    pub kernel: Utf8PathBuf,
    /// Kernel command line.
    pub kernel_cmdline: String,
    /// SSH private key.
    pub ssh_key: Option<Utf8PathBuf>,
    /// SSH user.
    pub ssh_user: String,
    /// Deadline for SSH to come up after QEMU starts.
    pub boot_timeout: Duration,
    /// Keeps console logs and enables verbose SSH.
    pub debug: bool,
}

impl QemuSettings {
    /// Builds driver settings from a loaded configuration.
    #[must_use]
    pub fn from_config(config: &VmConfig) -> Self {
        Self {
            binary: config.qemu.clone(),
            count: config.count,
            cpu: config.cpu,
            mem: config.mem,
            image: Utf8PathBuf::from(&config.image),
            kernel: Utf8PathBuf::from(&config.kernel),
            kernel_cmdline: config.kernel_cmdline.clone(),
            ssh_key: config.ssh_key.as_ref().map(Utf8PathBuf::from),
            ssh_user: config.ssh_user.clone(),
            boot_timeout: config.timeouts().boot,
            debug: config.debug,
        }
    }

    /// Checks resource bounds.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::Config`] naming the offending value.
    pub fn validate(&self) -> Result<(), VmError> {
        check_range("count", self.count, &COUNT_RANGE)?;
        check_range("cpu", self.cpu, &CPU_RANGE)?;
        check_range("mem", self.mem, &MEM_RANGE)?;
        Ok(())
    }
}

fn check_range(name: &str, value: usize, range: &RangeInclusive<usize>) -> Result<(), VmError> {
    if range.contains(&value) {
        return Ok(());
    }
    Err(VmError::Config(format!(
        "bad qemu {name}: {value}, want [{}-{}]",
        range.start(),
        range.end()
    )))
}

/// Boots QEMU VMs for the pool.
#[derive(Debug)]
pub struct QemuPool<R: CommandRunner = ProcessCommandRunner> {
    settings: Arc<QemuSettings>,
    version: String,
    runner: R,
    shutdown: CancellationToken,
}

impl QemuPool<ProcessCommandRunner> {
    /// Convenience constructor that wires the real process runner.
    ///
    /// # Errors
    ///
    /// See [`QemuPool::new`].
    pub async fn from_config(config: &VmConfig, shutdown: CancellationToken) -> Result<Self, VmError> {
        Self::new(QemuSettings::from_config(config), ProcessCommandRunner, shutdown).await
    }
}

impl<R: CommandRunner + Clone + 'static> QemuPool<R> {
    /// Validates `settings`, checks the disk image, resolves the kernel path
    /// and records the QEMU version.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::Config`] for out-of-range settings or a missing or
    /// empty image, and propagates failures of `<qemu> --version`.
    pub async fn new(
        mut settings: QemuSettings,
        runner: R,
        shutdown: CancellationToken,
    ) -> Result<Self, VmError> {
        settings.validate()?;
        check_image(&settings.image).await?;
        settings.kernel = absolute(&settings.kernel)?;

        let output = run_checked(
            &runner,
            &settings.binary,
            &[OsString::from("--version")],
            VERSION_TIMEOUT,
        )
        .await?;
        let version = String::from_utf8_lossy(&output)
            .lines()
            .next()
            .unwrap_or_default()
            .to_owned();
        info!(binary = %settings.binary, %version, count = settings.count, "QEMU pool ready");

        Ok(Self {
            settings: Arc::new(settings),
            version,
            runner,
            shutdown,
        })
    }

    /// Version line reported by the QEMU binary.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Settings every VM is booted with.
    #[must_use]
    pub fn settings(&self) -> &QemuSettings {
        &self.settings
    }

    async fn create_instance(&self, workdir: &Utf8Path, index: usize) -> Result<QemuInstance<R>, VmError> {
        provision_with_retry(MAX_PROVISION_RETRIES, |_| {
            QemuInstance::boot(
                Arc::clone(&self.settings),
                self.version.clone(),
                self.runner.clone(),
                workdir,
                index,
                &self.shutdown,
            )
        })
        .await
    }
}

impl<R: CommandRunner + Clone + 'static> Provisioner for QemuPool<R> {
    type Machine = QemuInstance<R>;

    fn count(&self) -> usize {
        self.settings.count
    }

    fn create<'a>(
        &'a self,
        workdir: &'a Utf8Path,
        index: usize,
    ) -> MachineFuture<'a, Result<Self::Machine, VmError>> {
        Box::pin(self.create_instance(workdir, index))
    }
}

/// Returns `true` when a provisioning failure is caused by a resource race
/// with another VM and booting again is likely to succeed.
#[must_use]
pub fn is_transient_provisioning_failure(err: &VmError) -> bool {
    let message = err.to_string();
    let output = err
        .output()
        .map(String::from_utf8_lossy)
        .unwrap_or_default();
    TRANSIENT_FAILURES
        .iter()
        .any(|needle| message.contains(needle) || output.contains(needle))
}

/// Runs `attempt` until it succeeds, fails permanently, or `max_retries`
/// transient failures have been retried.
///
/// `attempt` receives the zero-based attempt number.
///
/// # Errors
///
/// Returns the first non-transient error, or the last transient one once
/// the retry budget is spent.
pub async fn provision_with_retry<T, F, Fut>(max_retries: usize, mut attempt: F) -> Result<T, VmError>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, VmError>>,
{
    let mut retries = 0;
    loop {
        match attempt(retries).await {
            Ok(value) => return Ok(value),
            Err(err) if retries < max_retries && is_transient_provisioning_failure(&err) => {
                debug!(attempt = retries, error = %err, "retrying transient provisioning failure");
                retries += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

async fn check_image(image: &Utf8Path) -> Result<(), VmError> {
    let metadata = tokio::fs::metadata(image)
        .await
        .map_err(|_| VmError::Config(format!("image file '{image}' does not exist")))?;
    if metadata.len() == 0 {
        return Err(VmError::Config(format!("image file '{image}' is empty")));
    }
    Ok(())
}

fn absolute(path: &Utf8Path) -> Result<Utf8PathBuf, VmError> {
    let resolved = std::path::absolute(path)
        .map_err(|err| VmError::io(format!("resolving {path}"), &err))?;
    Utf8PathBuf::try_from(resolved)
        .map_err(|err| VmError::Config(format!("kernel path is not UTF-8: {err}")))
}
