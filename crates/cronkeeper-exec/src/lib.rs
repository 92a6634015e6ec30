//! cronkeeper-exec — runs task command lines through a shell.
//!
//! Each run spawns `<shell> -c <command>` in its own process group with the
//! task's working directory and environment, races the child against an
//! optional timeout, and returns the exit code plus ANSI-stripped,
//! truncated stdout/stderr.
//!
//! ```rust,no_run
//! use cronkeeper_exec::{CommandRunner, ExecOptions, ShellRunner};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let runner = ShellRunner::default();
//!     let options = ExecOptions {
//!         timeout: Some(Duration::from_secs(5)),
//!         ..ExecOptions::default()
//!     };
//!     let result = runner.run("echo hello", &options).await.unwrap();
//!     println!("{} -> {}", result.exit_code, result.stdout);
//! }
//! ```

pub mod error;
pub mod runner;
pub mod truncate;
pub mod types;

pub use error::{ExecError, Result};
pub use runner::{CommandRunner, ShellRunner};
pub use types::{ExecOptions, ExecResult, SPAWN_FAILED_EXIT_CODE, TIMED_OUT_EXIT_CODE};
