//! Building blocks shared by VM drivers: host command execution, output
//! merging, SSH helpers, the exit multiplexer and port allocation.

pub mod command;
mod error;
pub mod merger;
pub mod multiplex;
pub mod port;
pub mod ssh;

pub use command::{CommandRunner, ProcessCommandRunner, ProcessOutput, RunnerFuture, run_checked};
pub use error::VmError;
pub use merger::{MergerError, MergerErrorKind, OutputMerger};
pub use multiplex::multiplex;
pub use port::unused_tcp_port;
pub use ssh::{SshOptions, SshWaiter, scp_args, ssh_args, wait_for_ssh};
