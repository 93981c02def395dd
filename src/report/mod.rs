//! Crash reports and the pattern-database seam consumed by the monitor.
//!
//! The monitor never interprets console text itself. It asks a [`Reporter`]
//! whether a window of output contains a crash and, once extraction starts,
//! asks it to parse a [`Report`] out of the accumulated buffer. Everything
//! beyond trimming and rebasing offsets is left to the reporter.

use std::fmt;

mod patterns;

pub use patterns::{DEFAULT_CRASH_PATTERNS, DEFAULT_SUPPRESSIONS, PatternReporter};

/// Classification attached to a [`Report`].
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum CrashType {
    /// A crash the reporter could not classify any further.
    #[default]
    Unknown,
    /// The SSH session or the VM process died unexpectedly.
    LostConnection,
    /// The command hit its execution deadline.
    Timeout,
    /// Nothing happened inside the VM for longer than the no-output timeout.
    NoOutput,
    /// Kernel `WARNING:` splat.
    Warning,
    /// Kernel `BUG:` or similar assertion failure.
    Bug,
    /// Memory-safety violation (KASAN, KFENCE, paging faults, GPF).
    MemorySafety,
    /// Task hang or RCU stall reported by the kernel itself.
    Hang,
    /// Kernel panic.
    Panic,
}

impl fmt::Display for CrashType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Unknown => "unknown",
            Self::LostConnection => "lost-connection",
            Self::Timeout => "timeout",
            Self::NoOutput => "no-output",
            Self::Warning => "warning",
            Self::Bug => "bug",
            Self::MemorySafety => "memory-safety",
            Self::Hang => "hang",
            Self::Panic => "panic",
        };
        f.write_str(label)
    }
}

/// A classified crash extracted from VM console output.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Report {
    /// One-line crash title.
    pub title: String,
    /// Crash classification.
    pub crash_type: CrashType,
    /// Console output surrounding the crash.
    pub output: Vec<u8>,
    /// Offset of the first byte of the crash inside [`Report::output`].
    pub start_pos: usize,
    /// Offset one past the last byte of the crash inside [`Report::output`].
    pub end_pos: usize,
    /// Whether the crash matches a suppression and should be ignored.
    pub suppressed: bool,
}

/// Pattern database used to recognise crashes in console output.
pub trait Reporter: Send + Sync {
    /// Returns `true` when `output` contains a recognisable crash.
    fn contains_crash(&self, output: &[u8]) -> bool;

    /// Parses the first crash found in `output` at or after `offset`.
    ///
    /// Offsets in the returned report refer to the whole of `output`, which
    /// is also copied into [`Report::output`].
    fn parse_from(&self, output: &[u8], offset: usize) -> Option<Report>;

    /// Returns `true` when `output` matches a suppression.
    fn is_suppressed(&self, output: &[u8]) -> bool;
}
