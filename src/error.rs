//! Error taxonomy for the supervisor.
//!
//! Covers application import failure, the master-level halt signal,
//! bind retries, and the catch-all case for anything unexpected in the
//! control loop. Transient `EAGAIN`/`EINTR` conditions are not modeled
//! as a variant here — they are matched inline at the call site and
//! swallowed, never surfaced.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type returned by fallible supervisor operations.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The configured application locator did not resolve to a callable
    /// value. Translated to exit code [`crate::config::APP_LOAD_ERROR`]
    /// when it surfaces from a forked child.
    #[error("application failed to load: {0}")]
    AppImport(String),

    /// A listener could not be bound after exhausting the retry budget.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// A Unix socket path exists and is not a socket; refuse to remove it.
    #[error("{0:?} exists and is not a socket")]
    NotASocket(PathBuf),

    /// `fork()` itself failed.
    #[error("fork failed: {0}")]
    Fork(String),

    /// Generic I/O failure outside the EAGAIN/EINTR-swallowing paths.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The pool cannot be sustained; propagates a reason and the process
    /// exit status the master should terminate with. This is the Rust
    /// replacement for the original's `HaltServerException`, consumed
    /// as data by the control loop rather than raised as an exception.
    #[error("halt server: {reason} (exit {exit_status})")]
    Halt { reason: String, exit_status: i32 },
}

impl SupervisorError {
    pub fn halt(reason: impl Into<String>, exit_status: i32) -> Self {
        SupervisorError::Halt {
            reason: reason.into(),
            exit_status,
        }
    }
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

/// True if `errno` denotes a transient, swallow-and-retry condition
/// (`EAGAIN`/`EWOULDBLOCK`/`EINTR`). Used at self-pipe and socket call
/// sites.
pub fn is_transient(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
    )
}

pub fn is_transient_errno(errno: nix::errno::Errno) -> bool {
    matches!(errno, nix::errno::Errno::EAGAIN | nix::errno::Errno::EINTR)
}
