//! Per-command crash detection.
//!
//! The monitor multiplexes the command's exit, its console output, the
//! activity channel, a hang ticker and the shutdown token. Output is kept in
//! a sliding buffer; each append is scanned from `match_pos`, which trails
//! the end of the buffer by at least one line so that a crash line split
//! across chunks is still seen whole.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{ExitCondition, MonitorSettings};
use crate::machine::{CommandExit, CommandOutput, ExitReceiver, Machine};
use crate::report::{CrashType, Report, Reporter};
use crate::stats::PoolStats;

/// How far behind the end of the buffer crash matching restarts.
pub const MAX_ERROR_LENGTH: usize = 256;
/// Default bytes of context kept before a crash.
pub const BEFORE_CONTEXT_DEFAULT: usize = 128 << 10;
/// Bytes of context kept after a crash.
pub const AFTER_CONTEXT: usize = 128 << 10;

/// Title of reports for commands that died without a kernel crash.
pub const LOST_CONNECTION_CRASH: &str = "lost connection to test machine";
/// Title of reports for hung VMs.
pub const NO_OUTPUT_CRASH: &str = "no output from test machine";
/// Title of reports for commands that hit their deadline.
pub const TIMEOUT_CRASH: &str = "timed out";
/// Separator between crash output and diagnosis output.
pub const VM_DIAGNOSIS_START: &[u8] = b"\nVM DIAGNOSIS:\n";
/// Console text printed by the fuzzer each time it makes progress.
pub const EXECUTING_PROGRAM_MARKER: &[u8] = b"executed programs:";

const UNKNOWN_CRASH: &str = "unknown error";

/// Sliding window over console output.
#[derive(Debug)]
pub(crate) struct ConsoleBuffer {
    output: Vec<u8>,
    match_pos: usize,
    before_context: usize,
}

impl ConsoleBuffer {
    pub(crate) const fn new(before_context: usize) -> Self {
        Self {
            output: Vec::new(),
            match_pos: 0,
            before_context,
        }
    }

    pub(crate) fn output(&self) -> &[u8] {
        &self.output
    }

    pub(crate) const fn match_pos(&self) -> usize {
        self.match_pos
    }

    /// Bytes that still need crash matching.
    pub(crate) fn window(&self) -> &[u8] {
        self.output.get(self.match_pos..).unwrap_or_default()
    }

    /// Appends `chunk`; returns `true` when the window now holds a crash.
    ///
    /// On a clean append the buffer is compacted to the trailing
    /// `before_context` bytes once it exceeds twice that size, and
    /// `match_pos` moves to the start of the line holding the byte
    /// [`MAX_ERROR_LENGTH`] from the end. The walk back to that line start
    /// covers at most another [`MAX_ERROR_LENGTH`] bytes, so output without
    /// newlines is never rescanned from the start of the buffer.
    pub(crate) fn append(&mut self, chunk: &[u8], reporter: &dyn Reporter) -> bool {
        self.output.extend_from_slice(chunk);
        if reporter.contains_crash(self.window()) {
            return true;
        }
        if self.output.len() > self.before_context.saturating_mul(2) {
            let excess = self.output.len() - self.before_context;
            self.output.drain(..excess);
        }
        let tail = self.output.len().saturating_sub(MAX_ERROR_LENGTH);
        let floor = tail.saturating_sub(MAX_ERROR_LENGTH);
        self.match_pos = self
            .output
            .get(floor..tail)
            .and_then(|head| head.iter().rposition(|&byte| byte == b'\n'))
            .map_or(floor, |newline| floor + newline + 1);
        false
    }

    /// Appends without scanning; used while collecting trailing output.
    pub(crate) fn extend(&mut self, chunk: &[u8]) {
        self.output.extend_from_slice(chunk);
    }
}

/// Everything a [`Monitor`] needs from its surroundings.
pub(crate) struct MonitorContext<'a, M: Machine> {
    pub(crate) machine: &'a M,
    pub(crate) reporter: &'a dyn Reporter,
    pub(crate) stats: &'a PoolStats,
    pub(crate) shutdown: &'a CancellationToken,
    pub(crate) settings: MonitorSettings,
    pub(crate) no_output_timeout: Duration,
}

/// Crash-detection state machine for one command.
pub(crate) struct Monitor<'a, M: Machine> {
    ctx: MonitorContext<'a, M>,
    exit: ExitCondition,
    buffer: ConsoleBuffer,
    last_execute_time: Instant,
    on_finish: Option<Box<dyn FnOnce() + Send>>,
    extract_called: bool,
}

impl<'a, M: Machine> Monitor<'a, M> {
    pub(crate) fn new(
        ctx: MonitorContext<'a, M>,
        exit: ExitCondition,
        before_context: usize,
        on_finish: Option<Box<dyn FnOnce() + Send>>,
    ) -> Self {
        Self {
            ctx,
            exit,
            buffer: ConsoleBuffer::new(before_context),
            last_execute_time: Instant::now(),
            on_finish,
            extract_called: false,
        }
    }

    /// Console output retained so far.
    pub(crate) fn into_output(self) -> Vec<u8> {
        self.buffer.output
    }

    /// Watches the command until it ends, crashes, hangs or the process
    /// shuts down.
    pub(crate) async fn monitor_execution(
        &mut self,
        mut output: CommandOutput,
        mut exit: ExitReceiver,
        mut activity: Option<mpsc::Receiver<()>>,
    ) -> Option<Report> {
        let shutdown = self.ctx.shutdown;
        let tick = self.ctx.settings.tick_period;
        let mut ticker = tokio::time::interval_at(Instant::now() + tick, tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut output_open = true;

        let report = loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break None,
                status = &mut exit => {
                    let finished = status.unwrap_or_else(|_| {
                        CommandExit::Failed(String::from("command exit status lost"))
                    });
                    break self.handle_exit(finished, &mut output).await;
                }
                received = output.recv(), if output_open => match received {
                    Some(chunk) => {
                        self.ctx.stats.add_output(chunk.len());
                        if contains_marker(&chunk) {
                            self.last_execute_time = Instant::now();
                        }
                        if self.buffer.append(&chunk, self.ctx.reporter) {
                            break self.extract_error(Some(UNKNOWN_CRASH), &mut output).await;
                        }
                    }
                    None => output_open = false,
                },
                signal = next_activity(&mut activity) => match signal {
                    Some(()) => self.last_execute_time = Instant::now(),
                    None => activity = None,
                },
                _ = ticker.tick() => {
                    if self.last_execute_time.elapsed() > self.ctx.no_output_timeout {
                        break self.extract_error(Some(NO_OUTPUT_CRASH), &mut output).await;
                    }
                }
            }
        };
        self.notify_finished();
        report
    }

    async fn handle_exit(&mut self, finished: CommandExit, output: &mut CommandOutput) -> Option<Report> {
        debug!(?finished, "command exited");
        match finished {
            CommandExit::Exited => {
                // A delayed oops may still be on its way.
                let default = (!self.exit.contains(ExitCondition::NORMAL)).then_some(LOST_CONNECTION_CRASH);
                self.extract_error(default, output).await
            }
            CommandExit::TimedOut => {
                if self.exit.contains(ExitCondition::TIMEOUT) {
                    return None;
                }
                self.extract_error(Some(TIMEOUT_CRASH), output).await
            }
            CommandExit::Failed(_) => {
                // A lost connection can race with a kernel oops; the oops wins.
                let default = (!self.exit.contains(ExitCondition::ERROR)).then_some(LOST_CONNECTION_CRASH);
                self.extract_error(default, output).await
            }
        }
    }

    /// Builds the final report.
    ///
    /// # Panics
    ///
    /// Panics when called a second time on the same monitor.
    async fn extract_error(
        &mut self,
        default: Option<&'static str>,
        output: &mut CommandOutput,
    ) -> Option<Report> {
        assert!(!self.extract_called, "crash extraction ran twice for one command");
        self.extract_called = true;
        self.notify_finished();

        let mut diagnosis = Vec::new();
        let early = default
            .filter(|&title| title != NO_OUTPUT_CRASH)
            .and_then(|title| self.create_report(Some(title)));
        if let Some(report) = early {
            diagnosis = self.ctx.machine.diagnose(&report).await;
        }
        // The hang deadline already waited long enough.
        if default != Some(NO_OUTPUT_CRASH) {
            self.wait_for_output(output).await;
        }
        let late = default
            .is_none()
            .then(|| self.create_report(None))
            .flatten();
        if let Some(report) = late {
            diagnosis = self.ctx.machine.diagnose(&report).await;
        }

        let mut report = self.create_report(default)?;
        if !diagnosis.is_empty() {
            report.output.extend_from_slice(VM_DIAGNOSIS_START);
            report.output.extend_from_slice(&diagnosis);
        }
        Some(report)
    }

    fn create_report(&self, default: Option<&str>) -> Option<Report> {
        let reporter = self.ctx.reporter;
        let output = self.buffer.output();
        let Some(mut report) = reporter.parse_from(output, self.buffer.match_pos()) else {
            let title = default?;
            return Some(Report {
                title: title.to_owned(),
                crash_type: default_crash_type(title),
                output: output.to_vec(),
                start_pos: 0,
                end_pos: 0,
                suppressed: reporter.is_suppressed(output),
            });
        };
        let start = report.start_pos.saturating_sub(self.buffer.before_context);
        let end = report
            .end_pos
            .saturating_add(AFTER_CONTEXT)
            .min(report.output.len())
            .max(start);
        report.output = report.output.get(start..end).map(<[u8]>::to_vec).unwrap_or_default();
        report.start_pos -= start;
        report.end_pos = report.end_pos.saturating_sub(start);
        Some(report)
    }

    async fn wait_for_output(&mut self, output: &mut CommandOutput) {
        let shutdown = self.ctx.shutdown;
        let deadline = tokio::time::sleep(self.ctx.settings.wait_for_output);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => return,
                () = &mut deadline => return,
                received = output.recv() => match received {
                    Some(chunk) => {
                        self.ctx.stats.add_output(chunk.len());
                        self.buffer.extend(&chunk);
                    }
                    None => return,
                },
            }
        }
    }

    fn notify_finished(&mut self) {
        if let Some(callback) = self.on_finish.take() {
            callback();
        }
    }
}

fn default_crash_type(title: &str) -> CrashType {
    match title {
        LOST_CONNECTION_CRASH => CrashType::LostConnection,
        NO_OUTPUT_CRASH => CrashType::NoOutput,
        TIMEOUT_CRASH => CrashType::Timeout,
        _ => CrashType::Unknown,
    }
}

fn contains_marker(chunk: &[u8]) -> bool {
    chunk
        .windows(EXECUTING_PROGRAM_MARKER.len())
        .any(|window| window == EXECUTING_PROGRAM_MARKER)
}

async fn next_activity(activity: &mut Option<mpsc::Receiver<()>>) -> Option<()> {
    match activity {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::PatternReporter;
    use crate::test_support::FakeMachine;
    use bytes::Bytes;
    use proptest::prelude::*;
    use tokio::sync::broadcast;

    fn reporter() -> PatternReporter {
        PatternReporter::new().expect("built-in patterns compile")
    }

    #[test]
    fn crash_split_across_chunks_is_found() {
        let reporter = reporter();
        let mut buffer = ConsoleBuffer::new(BEFORE_CONTEXT_DEFAULT);

        assert!(!buffer.append(b"[  1.0] booting\n[  2.0] BU", &reporter));
        assert!(buffer.append(b"G: KASAN: use-after-free in foo\n", &reporter));
    }

    #[test]
    fn buffer_is_compacted_to_before_context() {
        let reporter = reporter();
        let mut buffer = ConsoleBuffer::new(64);
        let line = [b'x'; 31].iter().copied().chain([b'\n']).collect::<Vec<_>>();

        for _ in 0..5 {
            assert!(!buffer.append(&line, &reporter));
        }

        assert_eq!(buffer.output().len(), 64);
        assert_eq!(buffer.match_pos(), 0);
    }

    #[test]
    fn match_position_trails_by_whole_lines() {
        let reporter = reporter();
        let mut buffer = ConsoleBuffer::new(BEFORE_CONTEXT_DEFAULT);
        let mut chunk = vec![b'a'; 300];
        chunk.push(b'\n');
        chunk.extend_from_slice(&[b'b'; 300]);

        assert!(!buffer.append(&chunk, &reporter));

        assert_eq!(buffer.match_pos(), 301);
    }

    #[test]
    fn walk_back_is_bounded_without_newlines() {
        let reporter = reporter();
        let mut buffer = ConsoleBuffer::new(BEFORE_CONTEXT_DEFAULT);
        let garbage = vec![b'z'; 4096];

        assert!(!buffer.append(&garbage, &reporter));

        assert_eq!(buffer.match_pos(), 4096 - 2 * MAX_ERROR_LENGTH);
        assert_eq!(buffer.window().len(), 2 * MAX_ERROR_LENGTH);
    }

    #[test]
    fn marker_is_detected_anywhere_in_a_chunk() {
        assert!(contains_marker(b"2024/01/01 executed programs: 12\n"));
        assert!(!contains_marker(b"executed program"));
    }

    #[test]
    fn default_titles_map_to_crash_types() {
        assert_eq!(default_crash_type(LOST_CONNECTION_CRASH), CrashType::LostConnection);
        assert_eq!(default_crash_type(NO_OUTPUT_CRASH), CrashType::NoOutput);
        assert_eq!(default_crash_type(TIMEOUT_CRASH), CrashType::Timeout);
        assert_eq!(default_crash_type(UNKNOWN_CRASH), CrashType::Unknown);
    }

    #[tokio::test(start_paused = true)]
    #[should_panic(expected = "crash extraction ran twice")]
    async fn second_extraction_is_a_contract_violation() {
        let machine = FakeMachine::new();
        let reporter = reporter();
        let stats = PoolStats::default();
        let shutdown = CancellationToken::new();
        let context = MonitorContext {
            machine: &machine,
            reporter: &reporter,
            stats: &stats,
            shutdown: &shutdown,
            settings: MonitorSettings::default(),
            no_output_timeout: Duration::from_secs(300),
        };
        let mut monitor = Monitor::new(context, ExitCondition::NORMAL, BEFORE_CONTEXT_DEFAULT, None);
        let (_console, rx) = broadcast::channel::<Bytes>(4);
        let mut output = CommandOutput::new(rx);

        let first = monitor.extract_error(Some(LOST_CONNECTION_CRASH), &mut output).await;
        assert!(first.is_some());
        monitor.extract_error(Some(LOST_CONNECTION_CRASH), &mut output).await;
    }

    proptest! {
        #[test]
        fn match_position_stays_near_the_end(
            chunks in prop::collection::vec(
                prop::collection::vec(prop::sample::select(&b"abc \n"[..]), 0..400),
                1..20,
            ),
        ) {
            let reporter = reporter();
            let mut buffer = ConsoleBuffer::new(512);
            for chunk in &chunks {
                prop_assert!(!buffer.append(chunk, &reporter));
                let output = buffer.output();
                let pos = buffer.match_pos();
                prop_assert!(pos <= output.len());
                let tail = output.len().saturating_sub(MAX_ERROR_LENGTH);
                prop_assert!(
                    pos == 0
                        || output.get(pos - 1) == Some(&b'\n')
                        || pos == tail.saturating_sub(MAX_ERROR_LENGTH)
                );
                prop_assert!(output.len() - pos >= output.len().min(MAX_ERROR_LENGTH));
                prop_assert!(output.len() - pos <= 2 * MAX_ERROR_LENGTH);
                prop_assert!(output.len() <= 1024 || output.len() == 512);
            }
        }
    }
}
