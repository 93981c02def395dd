//! Configuration loading via `ortho-config`.

use std::ops::RangeInclusive;
use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Default kernel command line passed with `-append`.
pub const DEFAULT_KERNEL_CMDLINE: &str = "root=/dev/sda console=ttyS0";

/// Accepted number of VMs.
pub const COUNT_RANGE: RangeInclusive<usize> = 1..=1024;
/// Accepted number of vCPUs per VM.
pub const CPU_RANGE: RangeInclusive<usize> = 1..=1024;
/// Accepted VM memory, in MiB.
pub const MEM_RANGE: RangeInclusive<usize> = 128..=1_048_576;

/// VM pool configuration derived from environment variables and
/// configuration files.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "VMWATCH",
    discovery(
        app_name = "vmwatch",
        env_var = "VMWATCH_CONFIG_PATH",
        config_file_name = "vmwatch.toml",
        dotfile_name = ".vmwatch.toml",
        project_file_name = "vmwatch.toml"
    )
)]
pub struct VmConfig {
    /// Directory holding per-instance temporary directories.
    #[ortho_config(default = "/tmp/vmwatch".to_owned())]
    pub workdir: String,
    /// QEMU system emulator binary.
    #[ortho_config(default = "qemu-system-x86_64".to_owned())]
    pub qemu: String,
    /// Number of VMs to run in parallel.
    #[ortho_config(default = 1)]
    pub count: usize,
    /// Number of vCPUs per VM.
    #[ortho_config(default = 1)]
    pub cpu: usize,
    /// VM memory in MiB.
    #[ortho_config(default = 1024)]
    pub mem: usize,
    /// Raw disk image booted (in snapshot mode) by every VM. Required.
    pub image: String,
    /// Kernel image passed to QEMU with `-kernel`. Required.
    pub kernel: String,
    /// Kernel command line.
    #[ortho_config(default = DEFAULT_KERNEL_CMDLINE.to_owned())]
    pub kernel_cmdline: String,
    /// SSH private key accepted by the image.
    pub ssh_key: Option<String>,
    /// SSH user inside the image.
    #[ortho_config(default = "root".to_owned())]
    pub ssh_user: String,
    /// Seconds without console progress before a hang is reported.
    #[ortho_config(default = 300)]
    pub no_output_timeout_secs: u64,
    /// Seconds a VM may take to become reachable over SSH.
    #[ortho_config(default = 600)]
    pub boot_timeout_secs: u64,
    /// Keeps console logs, enables verbose SSH and limits the pool to one VM.
    #[ortho_config(default = false)]
    pub debug: bool,
}

/// Deadlines applied to VM execution.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Timeouts {
    /// How long a command may run without signs of progress.
    pub no_output: Duration,
    /// How long a VM may take to boot and answer SSH.
    pub boot: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            no_output: Duration::from_secs(5 * 60),
            boot: Duration::from_secs(10 * 60),
        }
    }
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }
}

impl VmConfig {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: set {} or add {} to vmwatch.toml",
                metadata.description, metadata.env_var, metadata.toml_key
            )));
        }
        Ok(())
    }

    fn require_range(
        value: usize,
        range: &RangeInclusive<usize>,
        metadata: &FieldMetadata,
    ) -> Result<(), ConfigError> {
        if range.contains(&value) {
            return Ok(());
        }
        Err(ConfigError::OutOfRange(format!(
            "{} {value} is outside [{}, {}]: adjust {} or {} in vmwatch.toml",
            metadata.description,
            range.start(),
            range.end(),
            metadata.env_var,
            metadata.toml_key
        )))
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("vmwatch")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Returns the execution deadlines described by this configuration.
    #[must_use]
    pub const fn timeouts(&self) -> Timeouts {
        Timeouts {
            no_output: Duration::from_secs(self.no_output_timeout_secs),
            boot: Duration::from_secs(self.boot_timeout_secs),
        }
    }

    /// Performs semantic validation. Error messages include guidance on how
    /// to provide or correct values via environment variables or the
    /// configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty
    /// and [`ConfigError::OutOfRange`] when a numeric field is out of bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_field(
            &self.image,
            &FieldMetadata::new("disk image", "VMWATCH_IMAGE", "image"),
        )?;
        Self::require_field(
            &self.kernel,
            &FieldMetadata::new("kernel image", "VMWATCH_KERNEL", "kernel"),
        )?;
        Self::require_field(
            &self.qemu,
            &FieldMetadata::new("QEMU binary", "VMWATCH_QEMU", "qemu"),
        )?;
        Self::require_field(
            &self.ssh_user,
            &FieldMetadata::new("SSH user", "VMWATCH_SSH_USER", "ssh_user"),
        )?;
        Self::require_field(
            &self.workdir,
            &FieldMetadata::new("working directory", "VMWATCH_WORKDIR", "workdir"),
        )?;
        Self::require_range(
            self.count,
            &COUNT_RANGE,
            &FieldMetadata::new("VM count", "VMWATCH_COUNT", "count"),
        )?;
        Self::require_range(
            self.cpu,
            &CPU_RANGE,
            &FieldMetadata::new("vCPU count", "VMWATCH_CPU", "cpu"),
        )?;
        Self::require_range(
            self.mem,
            &MEM_RANGE,
            &FieldMetadata::new("VM memory (MiB)", "VMWATCH_MEM", "mem"),
        )?;
        Ok(())
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a numeric field is outside its accepted range.
    #[error("configuration value out of range: {0}")]
    OutOfRange(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
