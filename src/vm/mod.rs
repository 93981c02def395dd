//! VM pool, instance lifecycle and crash monitoring.
//!
//! A [`Pool`] keeps a fixed number of slots busy: each slot boots a VM,
//! hands it to its assigned [`Job`], closes it once the job returns and
//! starts over. Jobs drive the VM through [`Instance::run`], which watches
//! the console and returns a classified [`crate::report::Report`] when the
//! kernel crashes, hangs or stops answering.

use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::Timeouts;
use crate::stats::PoolStats;

mod instance;
mod monitor;
mod pool;
mod slot;
mod workdir;

pub use instance::{Instance, RunOptions, RunOutcome};
pub use monitor::{
    AFTER_CONTEXT, BEFORE_CONTEXT_DEFAULT, EXECUTING_PROGRAM_MARKER, LOST_CONNECTION_CRASH,
    MAX_ERROR_LENGTH, NO_OUTPUT_CRASH, TIMEOUT_CRASH, VM_DIAGNOSIS_START,
};
pub use pool::{Pool, PoolSettings};
pub use slot::{Info, InfoUpdater, Job, JobFuture, SlotState, job};

/// Which ways for a command to end count as expected.
///
/// Combine flags with `|`.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct ExitCondition(u8);

impl ExitCondition {
    /// No exit is expected; any exit is a lost connection.
    pub const NONE: Self = Self(0);
    /// Hitting the command's deadline is expected.
    pub const TIMEOUT: Self = Self(1);
    /// A successful exit is expected.
    pub const NORMAL: Self = Self(1 << 1);
    /// A failing exit is expected.
    pub const ERROR: Self = Self(1 << 2);

    /// Returns `true` when every flag in `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }
}

impl BitOr for ExitCondition {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ExitCondition {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Timing knobs of the crash monitor.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MonitorSettings {
    /// How often the hang deadline is checked.
    pub tick_period: Duration,
    /// How long to keep collecting output after a crash is spotted.
    pub wait_for_output: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            tick_period: Duration::from_secs(10),
            wait_for_output: Duration::from_secs(10),
        }
    }
}

/// State shared by the pool and every instance it created.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) stats: Arc<PoolStats>,
    pub(crate) timeouts: Timeouts,
    pub(crate) monitor: MonitorSettings,
    pub(crate) shutdown: CancellationToken,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_conditions_combine() {
        let policy = ExitCondition::NORMAL | ExitCondition::TIMEOUT;

        assert!(policy.contains(ExitCondition::NORMAL));
        assert!(policy.contains(ExitCondition::TIMEOUT));
        assert!(!policy.contains(ExitCondition::ERROR));
        assert!(!policy.contains(ExitCondition::NONE));
    }
}
