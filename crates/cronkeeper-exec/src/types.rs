//! Shared data types for cronkeeper-exec.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::truncate::DEFAULT_MAX_CHARS;

/// Exit code reported when the child was killed because its timeout expired.
pub const TIMED_OUT_EXIT_CODE: i32 = -1;

/// Exit code reported when the shell could not be spawned at all.
pub const SPAWN_FAILED_EXIT_CODE: i32 = -2;

// ---------------------------------------------------------------------------
// ExecResult
// ---------------------------------------------------------------------------

/// Outcome of one command run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResult {
    /// Process exit code (0 = success, [`TIMED_OUT_EXIT_CODE`] on timeout,
    /// `128 + signal` when the child died from a signal).
    pub exit_code: i32,

    /// Captured standard output (ANSI escapes stripped, truncated).
    pub stdout: String,

    /// Captured standard error (ANSI escapes stripped, truncated).
    pub stderr: String,

    /// `true` when the timeout fired before the child exited.
    pub timed_out: bool,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }
}

// ---------------------------------------------------------------------------
// ExecOptions
// ---------------------------------------------------------------------------

/// Per-run execution context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecOptions {
    /// Kill the child once this much time has passed. `None` waits forever.
    pub timeout: Option<Duration>,

    /// Working directory for the child. `None` inherits the scheduler's cwd.
    pub working_dir: Option<PathBuf>,

    /// Extra environment variables layered over the inherited environment.
    pub env: BTreeMap<String, String>,

    /// Maximum characters kept per stream (see `truncate::truncate_output`).
    pub max_output_chars: usize,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            working_dir: None,
            env: BTreeMap::new(),
            max_output_chars: DEFAULT_MAX_CHARS,
        }
    }
}
