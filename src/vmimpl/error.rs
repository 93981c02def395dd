//! Error type shared by the VM drivers, the monitor and the pool.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced while provisioning, driving or recycling VMs.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum VmError {
    /// The VM failed to boot or never became reachable. Carries whatever
    /// console output was captured while booting.
    #[error("{message}")]
    Boot {
        /// One-line description of the failure.
        message: String,
        /// Console output collected before the failure.
        output: Vec<u8>,
    },
    /// Host-side infrastructure failed while handling the VM.
    #[error("{message}")]
    Infra {
        /// One-line description of the failure.
        message: String,
        /// Console output related to the failure, possibly empty.
        output: Vec<u8>,
    },
    /// Raised when a host command cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when a host command completes with a non-zero exit code.
    #[error("{program} exited with status {status_text}: {output}")]
    CommandFailure {
        /// Command name used for the attempted operation.
        program: String,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Combined output captured from the process.
        output: String,
    },
    /// Raised when a host command outlives its deadline and is killed.
    #[error("{program} did not finish within {timeout:?}")]
    Timeout {
        /// Command that was killed.
        program: String,
        /// Deadline the command exceeded.
        timeout: Duration,
    },
    /// Raised when an instance index falls outside the pool.
    #[error("invalid VM index {index}: pool has {count} slot(s)")]
    InvalidIndex {
        /// Requested index.
        index: usize,
        /// Number of slots in the pool.
        count: usize,
    },
    /// Raised when a reverse port forward cannot be set up.
    #[error("port forwarding failed: {0}")]
    ForwardPort(String),
    /// Raised when the QEMU machine protocol exchange fails.
    #[error("QEMU monitor error: {0}")]
    Qmp(String),
    /// Raised when a filesystem or socket operation fails.
    #[error("{context}: {message}")]
    Io {
        /// Operation that failed.
        context: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the pool is closed while instances are still live.
    #[error("pool closed with {count} active instance(s)")]
    ActiveInstances {
        /// Number of instances that were never closed.
        count: usize,
    },
    /// Raised when driver settings are out of range or incomplete.
    #[error("invalid VM configuration: {0}")]
    Config(String),
}

impl VmError {
    /// Builds an [`VmError::Io`] from an operation label and an I/O error.
    #[must_use]
    pub fn io(context: impl Into<String>, err: &std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            message: err.to_string(),
        }
    }

    /// Returns `true` for errors raised while the VM was booting.
    #[must_use]
    pub const fn is_boot_error(&self) -> bool {
        matches!(self, Self::Boot { .. })
    }

    /// Returns the console output attached to boot and infrastructure
    /// errors.
    #[must_use]
    pub fn output(&self) -> Option<&[u8]> {
        match self {
            Self::Boot { output, .. } | Self::Infra { output, .. } => Some(output),
            _ => None,
        }
    }

    /// Converts the error into a boot error carrying `output`.
    ///
    /// Boot errors keep their message and have their output replaced when it
    /// is empty; every other variant is rendered into the message.
    #[must_use]
    pub fn into_boot_error(self, output: Vec<u8>) -> Self {
        match self {
            Self::Boot {
                message,
                output: existing,
            } if !existing.is_empty() => Self::Boot {
                message,
                output: existing,
            },
            Self::Boot { message, .. } => Self::Boot { message, output },
            other => Self::Boot {
                message: other.to_string(),
                output,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn into_boot_error_attaches_output_to_other_variants() {
        let err = VmError::Spawn {
            program: String::from("qemu-system-x86_64"),
            message: String::from("No such file or directory"),
        }
        .into_boot_error(b"console".to_vec());

        assert!(err.is_boot_error());
        assert_eq!(err.output(), Some(b"console".as_slice()));
        assert!(err.to_string().contains("failed to spawn qemu-system-x86_64"));
    }

    #[test]
    fn into_boot_error_keeps_existing_output() {
        let err = VmError::Boot {
            message: String::from("can't ssh into the instance"),
            output: b"first".to_vec(),
        }
        .into_boot_error(b"second".to_vec());

        assert_eq!(err.output(), Some(b"first".as_slice()));
    }
}
