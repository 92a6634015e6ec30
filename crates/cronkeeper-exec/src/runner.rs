//! `ShellRunner` — spawns a command line through a shell and races it against
//! its timeout.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command as AsyncCommand;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{
    error::{ExecError, Result},
    truncate,
    types::{ExecOptions, ExecResult, TIMED_OUT_EXIT_CODE},
};

/// How long to keep draining pipes after the child has exited or been killed.
///
/// A backgrounded grandchild that escaped the process group can hold the pipe
/// open indefinitely; past this grace period its output is dropped.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Executes command lines. The dispatcher talks to this seam so tests can
/// substitute a scripted runner.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `command` to completion (or until `options.timeout`).
    ///
    /// Non-zero exits and timeouts are reported in the returned
    /// [`ExecResult`]; `Err` means no exit status could be obtained.
    async fn run(&self, command: &str, options: &ExecOptions) -> Result<ExecResult>;
}

/// Runs commands as `<shell> -c <command>`.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: String,
}

impl ShellRunner {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new("sh")
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, command: &str, options: &ExecOptions) -> Result<ExecResult> {
        debug!(shell = %self.shell, "exec: {command}");

        let mut cmd = AsyncCommand::new(&self.shell);
        cmd.arg("-c")
            .arg(command)
            .envs(&options.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &options.working_dir {
            cmd.current_dir(dir);
        }
        // Own process group, so a timeout kill reaches everything the shell
        // started and not just the shell itself.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| ExecError::Spawn(format!("spawn failed: {e}")))?;

        let pid = child.id();
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = match options.timeout {
            Some(limit) => {
                let waited = tokio::time::timeout(limit, child.wait()).await;
                match waited {
                    Ok(status) => Some(status?),
                    Err(_elapsed) => {
                        warn!(?pid, timeout_ms = limit.as_millis() as u64, "command timed out, killing");
                        if let Some(raw_pid) = pid {
                            kill_process_group(raw_pid);
                        }
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                        None
                    }
                }
            }
            None => Some(child.wait().await?),
        };

        let stdout = strip_text(&collect(stdout).await);
        let mut stderr = strip_text(&collect(stderr).await);

        let (exit_code, timed_out) = match status {
            Some(status) => (exit_code(status), false),
            None => {
                if let Some(limit) = options.timeout {
                    if !stderr.is_empty() && !stderr.ends_with('\n') {
                        stderr.push('\n');
                    }
                    stderr.push_str(&format!(
                        "command timed out after {:.1}s",
                        limit.as_secs_f64()
                    ));
                }
                (TIMED_OUT_EXIT_CODE, true)
            }
        };

        Ok(ExecResult {
            exit_code,
            stdout: truncate::truncate_output(&stdout, options.max_output_chars),
            stderr: truncate::truncate_output(&stderr, options.max_output_chars),
            timed_out,
        })
    }
}

/// Read a child pipe to EOF on its own task.
fn drain<R>(reader: Option<R>) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut reader) = reader {
            if let Err(e) = reader.read_to_end(&mut buf).await {
                debug!("pipe read error: {e}");
            }
        }
        buf
    })
}

async fn collect(handle: JoinHandle<Vec<u8>>) -> Vec<u8> {
    let abort = handle.abort_handle();
    match tokio::time::timeout(OUTPUT_DRAIN_GRACE, handle).await {
        Ok(Ok(buf)) => buf,
        Ok(Err(_join_err)) => Vec::new(),
        Err(_elapsed) => {
            abort.abort();
            Vec::new()
        }
    }
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    // Safety: the child was spawned with process_group(0), so its pid is also
    // the id of a process group that only contains our descendants.
    unsafe {
        libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}

/// Strip ANSI escape codes and convert bytes to a UTF-8 string.
fn strip_text(raw: &[u8]) -> String {
    let clean = strip_ansi_escapes::strip(raw);
    String::from_utf8_lossy(&clean).into_owned()
}
