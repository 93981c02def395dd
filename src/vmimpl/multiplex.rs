//! Turns a running remote command into a single exit notification.

use std::time::Duration;

use tokio::process::Child;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::merger::MergerError;
use crate::machine::{CommandExit, ExitReceiver};

/// How long a command may take to exit after its output stream closed.
const REAP_TIMEOUT: Duration = Duration::from_secs(10);

/// Watches `child` and reports how it finished.
///
/// Cancelling `ctx` kills the command and reports [`CommandExit::TimedOut`].
/// When `stream` fires first (the command's stdout closed) the child is
/// reaped and its exit status decides between [`CommandExit::Exited`] and
/// [`CommandExit::Failed`]. When `console_closed` fires first the VM is
/// gone and the command is reported as [`CommandExit::Failed`]. The child
/// is always killed and reaped before the notification is sent.
#[must_use]
pub fn multiplex(
    ctx: CancellationToken,
    console_closed: CancellationToken,
    mut child: Child,
    stream: oneshot::Receiver<MergerError>,
    name: String,
) -> ExitReceiver {
    let (exit_tx, exit_rx) = oneshot::channel();
    tokio::spawn(async move {
        let exit = tokio::select! {
            () = ctx.cancelled() => CommandExit::TimedOut,
            ended = stream => reap(&mut child, ended, &name).await,
            () = console_closed.cancelled() => {
                CommandExit::Failed(format!("{name}: VM console closed"))
            }
        };
        if let Err(err) = child.start_kill() {
            debug!(command = %name, error = %err, "command already gone");
        }
        child.wait().await.ok();
        debug!(command = %name, ?exit, "command finished");
        exit_tx.send(exit).ok();
    });
    exit_rx
}

async fn reap(
    child: &mut Child,
    ended: Result<MergerError, oneshot::error::RecvError>,
    name: &str,
) -> CommandExit {
    let status = match tokio::time::timeout(REAP_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) => status,
        Ok(Err(err)) => return CommandExit::Failed(format!("{name}: {err}")),
        Err(_) => {
            return CommandExit::Failed(format!("{name}: still running after its output closed"));
        }
    };
    if status.success() {
        return CommandExit::Exited;
    }
    let reason = ended.map_or_else(
        |_| format!("{name}: output stream dropped"),
        |err| err.to_string(),
    );
    CommandExit::Failed(format!("{reason} ({status})"))
}
