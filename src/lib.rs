//! Core library for the vmwatch VM pool.
//!
//! The crate keeps a fixed number of disposable QEMU virtual machines busy
//! running commands over SSH, and watches their serial console for kernel
//! crashes, hangs and lost connectivity (boot → run → detect → recycle).

pub mod config;
pub mod logging;
pub mod machine;
pub mod qemu;
pub mod report;
pub mod stats;
pub mod test_support;
pub mod vm;
pub mod vmimpl;

pub use config::{ConfigError, Timeouts, VmConfig};
pub use machine::{CommandExit, CommandOutput, ExitReceiver, Machine, MachineFuture, Provisioner};
pub use qemu::{QemuInstance, QemuPool, QemuSettings};
pub use report::{CrashType, PatternReporter, Report, Reporter};
pub use stats::PoolStats;
pub use vm::{
    ExitCondition, Info, InfoUpdater, Instance, Job, MonitorSettings, Pool, PoolSettings,
    RunOptions, RunOutcome, SlotState, job,
};
pub use vmimpl::VmError;
