//! Execution dispatcher: runs one attempt, records it, drives retries.
//!
//! Per attempt: `Starting → Running → {Succeeded, Failed, TimedOut}`. A failed
//! or timed-out attempt with attempts left becomes a retry stored in the
//! task's [`crate::types::SchedulingState`]; a detached timer re-submits it
//! after the delay, after re-claiming it from the registry. Removing the task
//! makes that claim fail, which ends the chain. When a run ends, the task's
//! completion webhook (if any) is sent in the background.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cronkeeper_exec::{CommandRunner, ExecOptions, ExecResult, SPAWN_FAILED_EXIT_CODE};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    ledger::HistoryLedger,
    notify::{CompletionEvent, Notifier},
    registry::{Claim, TaskRegistry, Transition},
    types::{ExecutionRecord, Outcome, RetryState, Task},
};

struct Inner {
    registry: Arc<TaskRegistry>,
    ledger: Arc<HistoryLedger>,
    runner: Arc<dyn CommandRunner>,
    notifier: Arc<dyn Notifier>,
    max_output_chars: usize,
    tracker: TaskTracker,
    /// Cancelled on shutdown; stops pending retry timers, never running commands.
    shutdown: CancellationToken,
    run_count: AtomicU64,
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<TaskRegistry>,
        ledger: Arc<HistoryLedger>,
        runner: Arc<dyn CommandRunner>,
        notifier: Arc<dyn Notifier>,
        max_output_chars: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                ledger,
                runner,
                notifier,
                max_output_chars,
                tracker: TaskTracker::new(),
                shutdown: CancellationToken::new(),
                run_count: AtomicU64::new(0),
            }),
        }
    }

    /// Run `attempt` of a claimed task in the background. The claim comes
    /// from the registry, which has already set `running`.
    pub fn submit(&self, claim: Claim, attempt: u32) {
        let this = self.clone();
        self.inner.tracker.spawn(async move {
            this.dispatch(claim, attempt).await;
        });
    }

    /// Run one attempt to completion, append its record and apply the
    /// resulting transition. Execution failures end up in the record, never
    /// as an error.
    pub async fn dispatch(&self, claim: Claim, attempt: u32) -> ExecutionRecord {
        let Claim { task, generation } = claim;
        info!(task = %task.name, attempt, "dispatching");

        let options = ExecOptions {
            timeout: task.timeout_limit(),
            working_dir: task.working_dir.clone(),
            env: task.environment.clone(),
            max_output_chars: self.inner.max_output_chars,
        };

        let started_at = Utc::now();
        let result = match self.inner.runner.run(&task.command, &options).await {
            Ok(result) => result,
            Err(e) => ExecResult {
                exit_code: SPAWN_FAILED_EXIT_CODE,
                stdout: String::new(),
                stderr: format!("failed to start command: {e}"),
                timed_out: false,
            },
        };
        let finished_at = Utc::now();
        self.inner.run_count.fetch_add(1, Ordering::Relaxed);

        let outcome = if result.timed_out {
            Outcome::TimedOut
        } else if result.exit_code == 0 {
            Outcome::Succeeded
        } else {
            Outcome::Failed
        };

        let record = ExecutionRecord {
            id: Uuid::new_v4().to_string(),
            task_name: task.name.clone(),
            attempt,
            started_at,
            finished_at,
            exit_code: result.exit_code,
            outcome,
            stdout: result.stdout,
            stderr: result.stderr,
        };

        match outcome {
            Outcome::Succeeded => info!(
                task = %task.name,
                attempt,
                duration_ms = record.duration_ms(),
                "attempt succeeded"
            ),
            _ => warn!(
                task = %task.name,
                attempt,
                exit_code = record.exit_code,
                %outcome,
                "attempt failed"
            ),
        }

        if let Err(e) = self.inner.ledger.append(record.clone()) {
            error!(task = %task.name, attempt, "failed to append execution record: {e}");
        }

        match self.inner.registry.record_outcome(
            &task.name,
            generation,
            attempt,
            outcome,
            finished_at,
        ) {
            Transition::RetryScheduled(retry) => {
                self.schedule_retry(task.name.clone(), generation, retry)
            }
            Transition::Finished => {
                if outcome.is_failure() && attempt > 1 {
                    warn!(task = %task.name, attempts = attempt, "retries exhausted");
                }
                self.notify_completion(&task, &record);
            }
            Transition::Removed => debug!(task = %task.name, "task removed during execution"),
        }

        record
    }

    /// Arm the timer for a pending retry. Fires immediately when
    /// `next_attempt_at` has already passed (e.g. after a restart).
    pub fn schedule_retry(&self, name: String, generation: u64, retry: RetryState) {
        let delay = (retry.next_attempt_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        info!(
            task = %name,
            attempt = retry.attempt,
            delay_ms = delay.as_millis() as u64,
            "retry scheduled"
        );

        let this = self.clone();
        self.inner.tracker.spawn(async move {
            tokio::select! {
                biased;
                _ = this.inner.shutdown.cancelled() => {
                    debug!(task = %name, attempt = retry.attempt, "retry timer cancelled by shutdown");
                }
                _ = tokio::time::sleep(delay) => {
                    // The timer runs on the monotonic clock; records use wall time.
                    if let Ok(lag) = (retry.next_attempt_at - Utc::now()).to_std() {
                        tokio::time::sleep(lag).await;
                    }
                    match this.inner.registry.begin_retry(&name, generation, retry.attempt) {
                        Some(claim) => {
                            this.dispatch(claim, retry.attempt).await;
                        }
                        None => debug!(task = %name, attempt = retry.attempt, "retry dropped"),
                    }
                }
            }
        });
    }

    /// Send the task's completion webhook without holding up the attempt.
    fn notify_completion(&self, task: &Task, record: &ExecutionRecord) {
        let Some(policy) = task.notify.clone().filter(|p| p.wants(record.outcome)) else {
            return;
        };
        let event = CompletionEvent::new(task, record);
        let notifier = self.inner.notifier.clone();
        self.inner.tracker.spawn(async move {
            match notifier.notify(&policy, &event).await {
                Ok(()) => debug!(task = %event.task, url = %policy.url, "webhook delivered"),
                Err(e) => warn!(task = %event.task, url = %policy.url, "webhook failed: {e}"),
            }
        });
    }

    /// Attempts completed since this dispatcher was created.
    pub fn run_count(&self) -> u64 {
        self.inner.run_count.load(Ordering::Relaxed)
    }

    /// Cancel pending retry timers and wait up to `grace` for running
    /// attempts. Returns `false` if some were still running at the deadline.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        let drained = tokio::time::timeout(grace, self.inner.tracker.wait())
            .await
            .is_ok();
        if !drained {
            warn!(
                remaining = self.inner.tracker.len(),
                "shutdown grace elapsed with attempts still running"
            );
        }
        drained
    }
}
