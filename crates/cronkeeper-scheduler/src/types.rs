use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cron::Trigger;
use crate::error::{Result, SchedulerError};

pub const DEFAULT_PRIORITY: u8 = 5;
pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 10;

/// Characters rejected in task names (they break file-based stores and shells).
const FORBIDDEN_NAME_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// How a failed attempt is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RetryPolicy {
    /// Total attempts including the first. `0` and `1` both mean "no retry".
    pub max_attempts: u32,
    /// Wait between a failed attempt finishing and the next one starting.
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// The retry to schedule after `attempt` failed at `failed_at`, if any.
    pub fn next_retry(&self, attempt: u32, failed_at: DateTime<Utc>) -> Option<RetryState> {
        if attempt >= self.max_attempts {
            return None;
        }
        let delay = chrono::Duration::from_std(self.delay).unwrap_or(chrono::Duration::MAX);
        Some(RetryState {
            attempt: attempt + 1,
            next_attempt_at: failed_at.checked_add_signed(delay).unwrap_or(failed_at),
        })
    }
}

/// Completion webhook: a JSON `POST` sent once a run's last attempt is
/// recorded, when the final outcome matches the `on_*` flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyPolicy {
    pub url: String,
    /// Sent as `Authorization: Bearer <token>` when set.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub on_success: bool,
    #[serde(default = "default_true")]
    pub on_failure: bool,
}

impl NotifyPolicy {
    /// Failure-only webhook to `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            on_success: false,
            on_failure: true,
        }
    }

    pub fn wants(&self, outcome: Outcome) -> bool {
        if outcome.is_failure() {
            self.on_failure
        } else {
            self.on_success
        }
    }
}

fn default_true() -> bool {
    true
}

/// Caller-supplied definition for a new task (`add_task` input).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSpec {
    pub name: String,
    pub trigger: String,
    pub command: String,
    pub enabled: bool,
    /// `Duration::ZERO` means no timeout.
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub priority: u8,
    pub working_dir: Option<PathBuf>,
    /// Plain-text values; any storage-level encoding is undone before this point.
    pub environment: BTreeMap<String, String>,
    pub description: String,
    pub tags: Vec<String>,
    pub owner: String,
    pub notify: Option<NotifyPolicy>,
}

impl Default for TaskSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            trigger: String::new(),
            command: String::new(),
            enabled: true,
            timeout: Duration::ZERO,
            retry: RetryPolicy::default(),
            priority: DEFAULT_PRIORITY,
            working_dir: None,
            environment: BTreeMap::new(),
            description: String::new(),
            tags: Vec::new(),
            owner: String::new(),
            notify: None,
        }
    }
}

impl TaskSpec {
    pub fn new(
        name: impl Into<String>,
        trigger: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            trigger: trigger.into(),
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, max_attempts: u32, delay: Duration) -> Self {
        self.retry = RetryPolicy::new(max_attempts, delay);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn with_notify(mut self, notify: NotifyPolicy) -> Self {
        self.notify = Some(notify);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Validate every field and build the task plus its parsed trigger.
    pub fn build(self, now: DateTime<Utc>) -> Result<(Task, Trigger)> {
        let task = Task {
            name: self.name.trim().to_string(),
            trigger: self.trigger.trim().to_string(),
            command: self.command,
            enabled: self.enabled,
            timeout: self.timeout,
            retry: self.retry,
            priority: self.priority,
            working_dir: self.working_dir,
            environment: self.environment,
            description: self.description,
            tags: self.tags,
            owner: self.owner,
            notify: self.notify,
            created_at: now,
            updated_at: now,
        };
        let trigger = task.validate()?;
        Ok((task, trigger))
    }
}

/// A registered task definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique registry key; immutable once created.
    pub name: String,
    /// Cron expression or `@` shortcut.
    pub trigger: String,
    /// Shell command line.
    pub command: String,
    pub enabled: bool,
    /// `Duration::ZERO` means no timeout.
    pub timeout: Duration,
    pub retry: RetryPolicy,
    /// 1–10; higher dispatches first when several tasks are due in one tick.
    pub priority: u8,
    pub working_dir: Option<PathBuf>,
    pub environment: BTreeMap<String, String>,
    pub description: String,
    pub tags: Vec<String>,
    pub owner: String,
    pub notify: Option<NotifyPolicy>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Check field constraints and parse the trigger.
    pub fn validate(&self) -> Result<Trigger> {
        if self.name.trim().is_empty() {
            return Err(SchedulerError::InvalidTask(
                "task name cannot be empty".to_string(),
            ));
        }
        if self.name.contains(FORBIDDEN_NAME_CHARS) {
            return Err(SchedulerError::InvalidTask(format!(
                "task name `{}` contains invalid characters",
                self.name
            )));
        }
        if self.command.trim().is_empty() {
            return Err(SchedulerError::InvalidTask(format!(
                "task `{}` has an empty command",
                self.name
            )));
        }
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&self.priority) {
            return Err(SchedulerError::InvalidTask(format!(
                "priority {} is outside {MIN_PRIORITY}-{MAX_PRIORITY}",
                self.priority
            )));
        }
        if let Some(key) = self.environment.keys().find(|k| !is_env_key(k)) {
            return Err(SchedulerError::InvalidTask(format!(
                "invalid environment variable name `{key}`"
            )));
        }
        if let Some(notify) = &self.notify {
            if !notify.url.starts_with("http://") && !notify.url.starts_with("https://") {
                return Err(SchedulerError::InvalidTask(format!(
                    "webhook url `{}` must be http or https",
                    notify.url
                )));
            }
        }
        Ok(Trigger::parse(&self.trigger)?)
    }

    /// `None` when the task has no timeout.
    pub fn timeout_limit(&self) -> Option<Duration> {
        (!self.timeout.is_zero()).then_some(self.timeout)
    }
}

fn is_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// A retry waiting for its delay to elapse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryState {
    /// Number of the attempt that will run next (2 for the first retry).
    pub attempt: u32,
    pub next_attempt_at: DateTime<Utc>,
}

/// Live per-task scheduling state, owned by the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulingState {
    /// Start of the last calendar minute this task was dispatched for.
    pub last_fired_at: Option<DateTime<Utc>>,
    /// True from dispatch until the last attempt of the chain is recorded.
    /// Not persisted: nothing is running after a restart.
    #[serde(skip)]
    pub running: bool,
    pub retry: Option<RetryState>,
    #[serde(default)]
    pub stats: RunStats,
}

/// Per-task attempt counters. Every attempt counts, retries included.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub run_count: u64,
    pub fail_count: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_outcome: Option<Outcome>,
}

impl RunStats {
    pub fn record(&mut self, outcome: Outcome, finished_at: DateTime<Utc>) {
        self.run_count += 1;
        if outcome.is_failure() {
            self.fail_count += 1;
        }
        self.last_run_at = Some(finished_at);
        self.last_outcome = Some(outcome);
    }
}

/// A task together with its live state and next natural firing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task: Task,
    pub state: SchedulingState,
    /// `None` for disabled tasks, `@reboot` and expressions that never match.
    pub next_run: Option<DateTime<Utc>>,
}

/// How one attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    Failed,
    TimedOut,
}

impl Outcome {
    pub fn is_failure(self) -> bool {
        !matches!(self, Outcome::Succeeded)
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Outcome::Succeeded => "succeeded",
            Outcome::Failed => "failed",
            Outcome::TimedOut => "timed_out",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(Outcome::Succeeded),
            "failed" => Ok(Outcome::Failed),
            "timed_out" => Ok(Outcome::TimedOut),
            other => Err(format!("unknown outcome: {other}")),
        }
    }
}

/// One attempt's result. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// UUID v4 string, primary key.
    pub id: String,
    pub task_name: String,
    /// 1 for the cron/manual firing, 2.. for retries.
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Real exit code, or a sentinel from `cronkeeper_exec` (timeout / spawn failure).
    pub exit_code: i32,
    pub outcome: Outcome,
    pub stdout: String,
    pub stderr: String,
}

impl ExecutionRecord {
    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }

    /// History order: latest start first, later attempt first on ties.
    pub fn newest_first(a: &Self, b: &Self) -> std::cmp::Ordering {
        b.started_at
            .cmp(&a.started_at)
            .then(b.attempt.cmp(&a.attempt))
    }
}

/// Snapshot returned by `get_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStatus {
    /// The trigger loop is started (paused or not).
    pub running: bool,
    pub paused: bool,
    /// Number of registered tasks, running or not.
    pub tasks_count: usize,
    /// Tasks whose `running` flag is set.
    pub in_flight: usize,
    /// Attempts completed since this scheduler was created.
    pub run_count: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_secs: i64,
    pub tick_secs: u64,
}
