//! Error types for the cronkeeper-exec crate.

use thiserror::Error;

/// Errors that prevent a command from producing an exit status at all.
///
/// A command that runs and exits non-zero, or is killed by its timeout, is
/// not an error; it is reported through [`crate::ExecResult`].
#[derive(Debug, Error)]
pub enum ExecError {
    /// The shell could not be spawned (missing binary, bad working directory, …).
    #[error("spawn error: {0}")]
    Spawn(String),

    /// Waiting on the child failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, ExecError>;
