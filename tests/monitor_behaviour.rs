//! Behavioural tests for crash detection while a command runs in a VM.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use camino::Utf8PathBuf;
use rstest::rstest;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use vmwatch::test_support::{FakeMachine, FakeProvisioner, ScriptedRun};
use vmwatch::vm::{LOST_CONNECTION_CRASH, NO_OUTPUT_CRASH, TIMEOUT_CRASH, VM_DIAGNOSIS_START};
use vmwatch::{
    CommandExit, CrashType, ExitCondition, Instance, PatternReporter, Pool, PoolSettings,
    RunOptions, RunOutcome,
};

struct Harness {
    machine: FakeMachine,
    pool: Pool<FakeProvisioner>,
    instance: Instance<FakeMachine>,
    reporter: PatternReporter,
    shutdown: CancellationToken,
    _workdir: TempDir,
}

impl Harness {
    async fn new() -> Self {
        let machine = FakeMachine::new();
        let workdir = TempDir::new().expect("temp dir");
        let root = Utf8PathBuf::from_path_buf(workdir.path().to_path_buf()).expect("utf8 path");
        let shutdown = CancellationToken::new();
        let pool = Pool::new(
            FakeProvisioner::new(1, machine.clone()),
            PoolSettings::new(root, shutdown.clone()),
        );
        let instance = pool.create(0).await.expect("instance");
        Self {
            machine,
            pool,
            instance,
            reporter: PatternReporter::new().expect("patterns"),
            shutdown,
            _workdir: workdir,
        }
    }

    async fn run(&self, options: RunOptions) -> RunOutcome {
        self.instance
            .run(&CancellationToken::new(), &self.reporter, "./syz-executor", options)
            .await
            .expect("command starts")
    }
}

#[tokio::test(start_paused = true)]
async fn kernel_crash_is_reported_with_trailing_output_and_diagnosis() {
    let harness = Harness::new().await;
    harness.machine.script(ScriptedRun::printing([
        "[    1.0] boot ok\n",
        "[    9.2] BUG: KASAN: use-after-free in tcp_close\n",
        "Call Trace:\n dump_stack\n",
    ]));

    let outcome = harness.run(RunOptions::default()).await;

    let report = outcome.report.expect("crash report");
    assert_eq!(report.title, "BUG: KASAN: use-after-free in tcp_close");
    assert_eq!(report.crash_type, CrashType::MemorySafety);
    assert!(!report.suppressed);
    let crash_line = report
        .output
        .get(report.start_pos..report.end_pos)
        .expect("offsets inside output");
    assert_eq!(crash_line, b"[    9.2] BUG: KASAN: use-after-free in tcp_close");
    let text = String::from_utf8_lossy(&report.output);
    assert!(text.contains("Call Trace:"), "output: {text}");
    let mut diagnosis = VM_DIAGNOSIS_START.to_vec();
    diagnosis.extend_from_slice(b"fake registers\n");
    assert!(report.output.ends_with(&diagnosis));
    assert_eq!(
        harness.machine.diagnosed(),
        vec!["BUG: KASAN: use-after-free in tcp_close"]
    );
}

#[tokio::test(start_paused = true)]
async fn crash_line_split_across_chunks_is_detected() {
    let harness = Harness::new().await;
    harness.machine.script(ScriptedRun::printing([
        "[   12.0] Kernel pa",
        "nic - not syncing: Fatal exception\n",
    ]));

    let outcome = harness.run(RunOptions::default()).await;

    let report = outcome.report.expect("crash report");
    assert_eq!(report.title, "Kernel panic - not syncing: Fatal exception");
    assert_eq!(report.crash_type, CrashType::Panic);
}

#[tokio::test(start_paused = true)]
async fn clean_exit_waits_for_late_output_then_reports_nothing() {
    let harness = Harness::new().await;
    harness.machine.script(
        ScriptedRun::printing(["all programs done\n"])
            .exiting(Duration::from_secs(1), CommandExit::Exited),
    );
    let started = Instant::now();

    let outcome = harness.run(RunOptions::default()).await;

    assert_eq!(outcome.report, None);
    assert_eq!(outcome.output, b"all programs done\n");
    assert!(started.elapsed() >= Duration::from_secs(11));
}

#[tokio::test(start_paused = true)]
async fn crash_printed_after_clean_exit_is_still_reported() {
    let harness = Harness::new().await;
    harness.machine.script(
        ScriptedRun::printing(["done\n"]).exiting(Duration::from_secs(1), CommandExit::Exited),
    );
    let machine = harness.machine.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(3)).await;
        machine.console("WARNING: CPU: 1 PID: 7 at kernel/fork.c:12\n");
    });

    let outcome = harness.run(RunOptions::default()).await;

    let report = outcome.report.expect("late crash report");
    assert_eq!(report.crash_type, CrashType::Warning);
    assert_eq!(
        harness.machine.diagnosed(),
        vec!["WARNING: CPU: 1 PID: 7 at kernel/fork.c:12"]
    );
}

#[rstest]
#[case::exited(CommandExit::Exited, ExitCondition::ERROR)]
#[case::failed(CommandExit::Failed(String::from("ssh: connection reset")), ExitCondition::NORMAL)]
#[tokio::test(start_paused = true)]
async fn unexpected_exit_is_a_lost_connection(
    #[case] exit: CommandExit,
    #[case] allowed: ExitCondition,
) {
    let harness = Harness::new().await;
    harness
        .machine
        .script(ScriptedRun::printing(["running\n"]).exiting(Duration::from_secs(2), exit));

    let outcome = harness.run(RunOptions::default().exit(allowed)).await;

    let report = outcome.report.expect("lost connection report");
    assert_eq!(report.title, LOST_CONNECTION_CRASH);
    assert_eq!(report.crash_type, CrashType::LostConnection);
    assert_eq!(harness.machine.diagnosed(), vec![LOST_CONNECTION_CRASH]);
}

#[tokio::test(start_paused = true)]
async fn expected_failure_without_crash_reports_nothing() {
    let harness = Harness::new().await;
    harness.machine.script(ScriptedRun::printing(["running\n"]).exiting(
        Duration::from_secs(2),
        CommandExit::Failed(String::from("exit status 1")),
    ));

    let outcome = harness
        .run(RunOptions::default().exit(ExitCondition::ERROR))
        .await;

    assert_eq!(outcome.report, None);
}

#[tokio::test(start_paused = true)]
async fn deadline_without_timeout_policy_is_a_timeout_crash() {
    let harness = Harness::new().await;
    harness.machine.script(ScriptedRun::printing(["fuzzing\n"]));

    let outcome = harness
        .run(RunOptions::default().timeout(Duration::from_secs(30)))
        .await;

    let report = outcome.report.expect("timeout report");
    assert_eq!(report.title, TIMEOUT_CRASH);
    assert_eq!(report.crash_type, CrashType::Timeout);
}

#[tokio::test(start_paused = true)]
async fn deadline_allowed_by_policy_reports_nothing() {
    let harness = Harness::new().await;
    harness.machine.script(ScriptedRun::printing(["fuzzing\n"]));
    let started = Instant::now();

    let outcome = harness
        .run(
            RunOptions::default()
                .exit(ExitCondition::NORMAL | ExitCondition::TIMEOUT)
                .timeout(Duration::from_secs(30)),
        )
        .await;

    assert_eq!(outcome.report, None);
    assert!(started.elapsed() < Duration::from_secs(40));
}

#[tokio::test(start_paused = true)]
async fn silent_vm_is_reported_as_hung_without_diagnosis() {
    let harness = Harness::new().await;
    harness.machine.script(ScriptedRun::printing(["started\n"]));
    let started = Instant::now();

    let outcome = harness.run(RunOptions::default()).await;

    let report = outcome.report.expect("no-output report");
    assert_eq!(report.title, NO_OUTPUT_CRASH);
    assert_eq!(report.crash_type, CrashType::NoOutput);
    assert!(started.elapsed() > Duration::from_secs(300));
    assert!(harness.machine.diagnosed().is_empty());
}

#[tokio::test(start_paused = true)]
async fn activity_signals_postpone_the_hang_deadline() {
    let harness = Harness::new().await;
    harness.machine.script(ScriptedRun::printing(["started\n"]));
    let (activity, signals) = mpsc::channel(1);
    tokio::spawn(async move {
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_secs(60)).await;
            if activity.send(()).await.is_err() {
                return;
            }
        }
    });

    let outcome = harness
        .run(
            RunOptions::default()
                .exit(ExitCondition::NORMAL | ExitCondition::TIMEOUT)
                .activity(signals)
                .timeout(Duration::from_secs(480)),
        )
        .await;

    assert_eq!(outcome.report, None);
}

#[tokio::test(start_paused = true)]
async fn progress_marker_postpones_the_hang_deadline() {
    let harness = Harness::new().await;
    harness.machine.script(ScriptedRun::printing(["started\n"]));
    let machine = harness.machine.clone();
    tokio::spawn(async move {
        for round in 0..10 {
            tokio::time::sleep(Duration::from_secs(60)).await;
            machine.console(format!("2024/05/01 executed programs: {round}\n"));
        }
    });

    let outcome = harness
        .run(
            RunOptions::default()
                .exit(ExitCondition::NORMAL | ExitCondition::TIMEOUT)
                .timeout(Duration::from_secs(480)),
        )
        .await;

    assert_eq!(outcome.report, None);
}

#[tokio::test(start_paused = true)]
async fn shutdown_ends_monitoring_without_a_report() {
    let harness = Harness::new().await;
    harness.machine.script(ScriptedRun::printing(["fuzzing\n"]));
    let shutdown = harness.shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        shutdown.cancel();
    });
    let finished = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&finished);

    let outcome = harness
        .run(RunOptions::default().on_finish(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .await;

    assert_eq!(outcome.report, None);
    assert_eq!(finished.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn finish_callback_fires_once_per_crash() {
    let harness = Harness::new().await;
    harness
        .machine
        .script(ScriptedRun::printing(["BUG: unable to handle page fault for address: 0\n"]));
    let finished = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&finished);

    let outcome = harness
        .run(RunOptions::default().on_finish(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .await;

    assert!(outcome.report.is_some());
    assert_eq!(finished.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn suppressed_crashes_are_flagged() {
    let harness = Harness::new().await;
    harness.machine.script(ScriptedRun::printing([
        "Out of memory: Killed process 4242 (syz-executor)\n",
        "WARNING: CPU: 0 PID: 4242 at mm/page_alloc.c:4477\n",
    ]));

    let outcome = harness.run(RunOptions::default()).await;

    let report = outcome.report.expect("crash report");
    assert!(report.suppressed);
}

#[tokio::test(start_paused = true)]
async fn received_output_is_counted() {
    let harness = Harness::new().await;
    let chunks = ["line one\n", "line two\n"];
    harness.machine.script(
        ScriptedRun::printing(chunks).exiting(Duration::from_secs(1), CommandExit::Exited),
    );

    harness.run(RunOptions::default()).await;

    let expected: usize = chunks.iter().map(|chunk| chunk.len()).sum();
    assert_eq!(
        harness.pool.stats().output_bytes(),
        u64::try_from(expected).expect("fits")
    );
    harness.instance.close().await.expect("close");
    assert_eq!(harness.pool.stats().active_instances(), 0);
}
