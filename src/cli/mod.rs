//! Command-line interface definitions for the `vmwatch` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::Parser;

/// Top-level CLI for the `vmwatch` binary.
#[derive(Debug, Parser)]
#[command(
    name = "vmwatch",
    about = "Run a command in a pool of QEMU VMs and watch their consoles for kernel crashes",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Boot the pool and run a command in every VM until interrupted.
    #[command(
        name = "run",
        about = "Boot the VM pool and run a command in every VM until interrupted"
    )]
    Run(RunCommand),
}

/// Arguments for the `vmwatch run` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct RunCommand {
    /// Override the number of VMs booted in parallel.
    #[arg(long, value_name = "N")]
    pub(crate) count: Option<usize>,
    /// Stop each command after this many seconds without treating it as a
    /// crash.
    #[arg(long, value_name = "SECONDS")]
    pub(crate) timeout: Option<u64>,
    /// Keep the console log, use verbose SSH, log at debug level and boot a
    /// single VM.
    #[arg(long)]
    pub(crate) debug: bool,
    /// Command to execute inside each VM (use -- to separate flags).
    #[arg(required = true, trailing_var_arg = true)]
    pub(crate) command: Vec<String>,
}
