//! Crash diagnosis helpers for Linux guests.

use std::ffi::OsString;
use std::sync::LazyLock;
use std::time::Duration;

use regex::bytes::Regex;

use crate::report::Report;
use crate::vmimpl::ssh::SSH_BIN;
use crate::vmimpl::CommandRunner;

/// Bound on diagnostic SSH commands.
pub const SSH_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Files dumped when the kernel runs out of lockdep slots.
pub const LOCKDEP_FILES: [&str; 3] = ["/proc/lockdep_stats", "/proc/lockdep", "/proc/lockdep_chains"];

#[expect(clippy::expect_used, reason = "pattern is a compile-time constant")]
static POINTER_TOKENS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r" *\[?[0-9a-f]{8,}\]?\s*").expect("pointer pattern compiles")
});

/// Returns `true` when the report is a lockdep capacity overflow
/// (`BUG: MAX_LOCKDEP_KEYS too low!` and friends).
#[must_use]
pub fn wants_lockdep_dump(report: &Report) -> bool {
    report.title.contains("MAX_LOCKDEP")
}

/// Removes hashed kernel pointer values from `output`.
#[must_use]
pub fn strip_pointers(output: &[u8]) -> Vec<u8> {
    POINTER_TOKENS.replace_all(output, b"".as_slice()).into_owned()
}

/// Dumps the lockdep tables over SSH.
///
/// `ssh_base` holds the SSH options and destination; the `cat` command is
/// appended. Failures are appended to the output as text.
pub async fn dump_lockdep<R: CommandRunner + ?Sized>(runner: &R, ssh_base: &[OsString]) -> Vec<u8> {
    let mut args = ssh_base.to_vec();
    args.push(OsString::from("cat"));
    args.extend(LOCKDEP_FILES.iter().map(OsString::from));

    let output = match runner.run(SSH_BIN, &args, SSH_COMMAND_TIMEOUT).await {
        Ok(result) => {
            let mut output = result.combined();
            if !result.is_success() {
                output.extend_from_slice(
                    format!("ssh exited with status {}", result.status_text()).as_bytes(),
                );
            }
            output
        }
        Err(err) => err.to_string().into_bytes(),
    };
    strip_pointers(&output)
}

/// Header for a register dump, stamped with the local wall-clock time.
#[must_use]
pub fn registers_header() -> String {
    format!("{}  Registers:\n", chrono::Local::now().format("%H:%M:%S"))
}
