//! Binary entry point for the vmwatch CLI.

use std::io::{self, Write};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use shell_escape::unix::escape;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use vmwatch::logging::{self, LoggingError};
use vmwatch::{
    ConfigError, ExitCondition, InfoUpdater, Instance, Job, Machine, PatternReporter, Pool,
    PoolSettings, QemuPool, Report, Reporter, RunOptions, VmConfig, VmError, job,
};

mod cli;

use cli::{Cli, RunCommand};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Logging(#[from] LoggingError),
    #[error("VM error: {0}")]
    Vm(#[from] VmError),
    #[error("crash patterns failed to compile: {0}")]
    Patterns(#[from] regex::Error),
    #[error("invalid command argument: {0}")]
    InvalidCommand(String),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    match cli {
        Cli::Run(command) => run_command(command).await,
    }
}

async fn run_command(args: RunCommand) -> Result<i32, CliError> {
    validate_command_args(&args.command)?;
    let remote_command = render_remote_command(&args.command);

    let mut config = VmConfig::load_without_cli_args()?;
    if let Some(count) = args.count {
        config.count = count;
    }
    config.debug |= args.debug;
    config.validate()?;
    logging::init(config.debug)?;

    let shutdown = CancellationToken::new();
    let on_interrupt = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted; shutting down");
            on_interrupt.cancel();
        }
    });

    let reporter = Arc::new(PatternReporter::new()?);
    let qemu = QemuPool::from_config(&config, shutdown.clone()).await?;
    let pool = Arc::new(Pool::new(
        qemu,
        PoolSettings::from_config(&config, shutdown.clone()),
    ));
    if let Some(mut boot_errors) = pool.take_boot_errors() {
        tokio::spawn(async move {
            while let Some(err) = boot_errors.recv().await {
                warn!(error = %err, "VM failed to boot");
            }
        });
    }

    let timeout = args.timeout.map(Duration::from_secs);
    pool.set_default(&command_job(remote_command, reporter, timeout));
    info!(count = pool.count(), "starting VM pool");
    pool.run_loop(shutdown).await;
    pool.close()?;
    Ok(0)
}

/// Job that runs `command` until it crashes the VM, then lets the slot
/// recycle it.
fn command_job<M: Machine + 'static>(
    command: String,
    reporter: Arc<PatternReporter>,
    timeout: Option<Duration>,
) -> Job<M> {
    job(move |ctx: CancellationToken, instance: Arc<Instance<M>>, updater: InfoUpdater| {
        let script = command.clone();
        let patterns = Arc::clone(&reporter);
        async move {
            run_until_crash(&ctx, &instance, patterns.as_ref(), &script, timeout, &updater).await;
        }
    })
}

async fn run_until_crash<M: Machine>(
    ctx: &CancellationToken,
    instance: &Instance<M>,
    reporter: &dyn Reporter,
    command: &str,
    timeout: Option<Duration>,
    updater: &InfoUpdater,
) -> Option<Report> {
    let index = instance.index();
    let mut iteration: u64 = 0;
    while !ctx.is_cancelled() {
        iteration = iteration.saturating_add(1);
        updater.set_status(format!("run {iteration}"));
        let base = RunOptions::default().exit(ExitCondition::NORMAL | ExitCondition::TIMEOUT);
        let options = match timeout {
            Some(limit) => base.timeout(limit),
            None => base,
        };
        match instance.run(ctx, reporter, command, options).await {
            Ok(outcome) => {
                if let Some(report) = outcome.report {
                    log_report(index, &report);
                    return Some(report);
                }
            }
            Err(err) => {
                warn!(index, error = %err, "failed to start command");
                return None;
            }
        }
    }
    None
}

fn log_report(index: usize, report: &Report) {
    if report.suppressed {
        info!(index, title = %report.title, "suppressed crash");
        return;
    }
    warn!(index, title = %report.title, crash_type = %report.crash_type, "VM crashed");
    let mut stderr = io::stderr();
    writeln!(stderr, "=== VM {index}: {} ===", report.title).ok();
    stderr.write_all(&report.output).ok();
    writeln!(stderr).ok();
}

fn render_remote_command(args: &[String]) -> String {
    args.iter()
        .map(|arg| escape(arg.as_str().into()).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

fn validate_command_args(args: &[String]) -> Result<(), CliError> {
    for arg in args {
        if arg
            .chars()
            .any(|ch| matches!(ch, '\u{0000}'..='\u{001F}' | '\u{007F}'))
        {
            return Err(CliError::InvalidCommand(String::from(concat!(
                "command arguments must not contain control characters (ASCII ",
                "0x00-0x1F or 0x7F, e.g. newline, carriage return, tab, NUL)"
            ))));
        }
    }
    Ok(())
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
