//! `cronkeeper-scheduler` — cron-style task scheduler with SQLite persistence.
//!
//! # Overview
//!
//! Tasks pair a shell command with a trigger expression. The
//! [`engine::Scheduler`] wakes on a fixed, wall-clock-aligned tick, asks the
//! [`registry::TaskRegistry`] which tasks are due in the current minute and
//! hands them to the [`dispatcher::Dispatcher`], which runs each attempt
//! concurrently, enforces its timeout, retries failures after a delay and
//! appends every attempt to the [`ledger::HistoryLedger`]. A task may carry a
//! completion webhook, sent through a [`notify::Notifier`] when its run ends.
//!
//! # Triggers
//!
//! | Form                | Meaning                                         |
//! |---------------------|-------------------------------------------------|
//! | `m h dom mon dow`   | Five-field cron, `*`, lists, ranges and steps   |
//! | `@hourly`           | `0 * * * *`                                     |
//! | `@daily`, `@midnight` | `0 0 * * *`                                   |
//! | `@weekly`           | `0 0 * * 0`                                     |
//! | `@monthly`          | `0 0 1 * *`                                     |
//! | `@yearly`, `@annually` | `0 0 1 1 *`                                  |
//! | `@reboot`           | Once, when the trigger loop starts              |
//!
//! All evaluation is in UTC at minute granularity.

pub mod cron;
pub mod db;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod notify;
pub mod registry;
pub mod store;
pub mod types;

pub use cron::{CronError, CronField, Trigger};
pub use db::SqliteStore;
pub use engine::{ControlState, Scheduler};
pub use error::{Result, SchedulerError};
pub use notify::{CompletionEvent, Notifier, WebhookNotifier};
pub use store::{DefinitionStore, HistoryStore, MemoryStore};
pub use types::{
    ExecutionRecord, NotifyPolicy, Outcome, RetryPolicy, RetryState, RunStats, SchedulerStatus,
    SchedulingState, Task, TaskSpec, TaskSummary,
};
