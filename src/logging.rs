//! Structured logging setup for the `vmwatch` binary.

use thiserror::Error;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Errors raised while installing the global subscriber.
#[derive(Debug, Error)]
pub enum LoggingError {
    /// Another subscriber was already installed.
    #[error("failed to install log subscriber: {0}")]
    Install(#[from] tracing_subscriber::util::TryInitError),
}

/// Default filter directive when `RUST_LOG` is unset.
#[must_use]
pub const fn default_directive(debug: bool) -> &'static str {
    if debug { "debug" } else { "info" }
}

/// Installs a formatting subscriber filtered by `RUST_LOG`, falling back to
/// `info` (or `debug` when `debug` is set).
///
/// # Errors
///
/// Returns [`LoggingError::Install`] when a global subscriber already exists.
pub fn init(debug: bool) -> Result<(), LoggingError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug)));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .try_init()?;
    Ok(())
}
