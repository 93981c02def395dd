//! Counters shared by every slot of a pool.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Running average of durations.
#[derive(Debug, Default)]
pub struct AverageValue {
    samples: Mutex<(Duration, u32)>,
}

impl AverageValue {
    /// Adds one sample.
    pub fn save(&self, value: Duration) {
        let mut samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        samples.0 = samples.0.saturating_add(value);
        samples.1 = samples.1.saturating_add(1);
    }

    /// Returns the mean of all samples, or `None` before the first one.
    #[must_use]
    pub fn value(&self) -> Option<Duration> {
        let samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        let (total, count) = *samples;
        total.checked_div(count)
    }
}

/// Pool-wide statistics and the live-instance counter.
#[derive(Debug, Default)]
pub struct PoolStats {
    output_bytes: AtomicU64,
    active: AtomicUsize,
    boot_time: AverageValue,
}

impl PoolStats {
    /// Adds `len` bytes to the received-output counter.
    pub fn add_output(&self, len: usize) {
        self.output_bytes
            .fetch_add(u64::try_from(len).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    /// Total console bytes observed by monitors.
    #[must_use]
    pub fn output_bytes(&self) -> u64 {
        self.output_bytes.load(Ordering::Relaxed)
    }

    /// Records one successful boot.
    pub fn record_boot(&self, elapsed: Duration) {
        self.boot_time.save(elapsed);
    }

    /// Mean time from boot start to SSH readiness.
    #[must_use]
    pub fn average_boot_time(&self) -> Option<Duration> {
        self.boot_time.value()
    }

    pub(crate) fn instance_opened(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn instance_closed(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    /// Number of instances created and not yet closed.
    #[must_use]
    pub fn active_instances(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}
