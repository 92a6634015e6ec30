use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use cronkeeper_core::SchedulerConfig;
use cronkeeper_exec::{CommandRunner, ShellRunner};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::{
    cron::floor_minute,
    dispatcher::Dispatcher,
    error::{Result, SchedulerError},
    ledger::HistoryLedger,
    notify::{Notifier, WebhookNotifier},
    registry::TaskRegistry,
    store::{DefinitionStore, HistoryStore},
    types::{ExecutionRecord, SchedulerStatus, SchedulingState, Task, TaskSpec, TaskSummary},
};

/// Process-wide control state, owned by the [`Scheduler`] and changed only
/// through its control operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlState {
    /// The trigger loop is between start-up and shutdown.
    pub running: bool,
    pub paused: bool,
    pub started_at: Option<DateTime<Utc>>,
}

/// The scheduling engine: registry, trigger loop, dispatcher and ledger, plus
/// the control surface used by the daemon and protocol layers.
pub struct Scheduler {
    registry: Arc<TaskRegistry>,
    ledger: Arc<HistoryLedger>,
    dispatcher: Dispatcher,
    control: watch::Sender<ControlState>,
    tick: Duration,
    shutdown_grace: Duration,
}

impl Scheduler {
    /// Build a scheduler running commands through `config.shell`, loading
    /// tasks, scheduling state and history from the stores.
    pub fn new(
        config: &SchedulerConfig,
        definitions: Arc<dyn DefinitionStore>,
        history: Arc<dyn HistoryStore>,
    ) -> Result<Self> {
        let runner = Arc::new(ShellRunner::new(config.shell.clone()));
        Self::with_runner(config, definitions, history, runner)
    }

    pub fn with_runner(
        config: &SchedulerConfig,
        definitions: Arc<dyn DefinitionStore>,
        history: Arc<dyn HistoryStore>,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self> {
        let notifier = Arc::new(WebhookNotifier::new(config.webhook_timeout())?);
        Self::with_parts(config, definitions, history, runner, notifier)
    }

    /// Build from explicit collaborators.
    pub fn with_parts(
        config: &SchedulerConfig,
        definitions: Arc<dyn DefinitionStore>,
        history: Arc<dyn HistoryStore>,
        runner: Arc<dyn CommandRunner>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let registry = Arc::new(TaskRegistry::new(definitions));
        registry.load()?;
        let ledger = Arc::new(HistoryLedger::new(history, config.history_per_task));
        ledger.load()?;

        let dispatcher = Dispatcher::new(
            registry.clone(),
            ledger.clone(),
            runner,
            notifier,
            config.max_output_chars,
        );
        let (control, _) = watch::channel(ControlState::default());

        Ok(Self {
            registry,
            ledger,
            dispatcher,
            control,
            tick: config.tick(),
            shutdown_grace: config.shutdown_grace(),
        })
    }

    /// Main event loop. Wakes on wall-clock-aligned ticks until `shutdown`
    /// broadcasts `true` (or its sender is dropped), then drains.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        self.control.send_modify(|c| {
            c.running = true;
            c.started_at = Some(Utc::now());
        });
        info!(
            tasks = self.registry.len(),
            tick_secs = self.tick.as_secs(),
            "scheduler started"
        );

        for pending in self.registry.pending_retries() {
            self.dispatcher
                .schedule_retry(pending.name, pending.generation, pending.retry);
        }
        self.fire_reboot_tasks();

        loop {
            let (boundary, wait) = next_tick(Utc::now(), self.tick);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    // Never evaluate a minute earlier than the boundary we slept for.
                    let now = Utc::now().max(boundary);
                    self.tick_at(now);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("scheduler shutting down");
                        break;
                    }
                }
            }
        }

        self.control.send_modify(|c| c.running = false);
        let drained = self.dispatcher.shutdown(self.shutdown_grace).await;
        info!(drained, "scheduler stopped");
    }

    /// Evaluate triggers for the minute containing `now` and dispatch every
    /// due task, highest priority first. Returns the names dispatched.
    ///
    /// Calling this more than once for the same minute dispatches nothing new.
    /// Must be called from within a Tokio runtime.
    pub fn tick_at(&self, now: DateTime<Utc>) -> Vec<String> {
        if self.control.borrow().paused {
            debug!("scheduler paused, tick skipped");
            return Vec::new();
        }

        let minute = floor_minute(now);
        let mut dispatched = Vec::new();
        for task in self.registry.due_at(now) {
            if let Some(claim) = self.registry.mark_fired(&task.name, minute) {
                dispatched.push(task.name);
                self.dispatcher.submit(claim, 1);
            }
        }
        debug!(%minute, dispatched = dispatched.len(), "tick");
        dispatched
    }

    fn fire_reboot_tasks(&self) {
        if self.control.borrow().paused {
            info!("scheduler paused at start-up, @reboot tasks skipped");
            return;
        }
        for task in self.registry.reboot_tasks() {
            if let Ok(Some(claim)) = self.registry.mark_started(&task.name) {
                self.dispatcher.submit(claim, 1);
            }
        }
    }

    // --- control surface ---------------------------------------------------

    pub fn add_task(&self, spec: TaskSpec) -> Result<Task> {
        self.registry.add(spec)
    }

    /// Remove a task. Pending retries for it never fire; an attempt already
    /// running finishes and is still recorded.
    pub fn remove_task(&self, name: &str) -> Result<()> {
        self.registry.remove(name)
    }

    pub fn list_tasks(&self) -> Vec<Task> {
        self.registry.list_all()
    }

    pub fn get_task(&self, name: &str) -> Result<Task> {
        self.registry
            .get(name)
            .ok_or_else(|| SchedulerError::TaskNotFound {
                name: name.to_string(),
            })
    }

    pub fn task_state(&self, name: &str) -> Option<SchedulingState> {
        self.registry.state(name)
    }

    /// Every task with its live state, run counters and next firing.
    pub fn task_summaries(&self) -> Vec<TaskSummary> {
        self.registry.summaries(Utc::now())
    }

    pub fn task_summary(&self, name: &str) -> Result<TaskSummary> {
        self.registry
            .summary(name, Utc::now())
            .ok_or_else(|| SchedulerError::TaskNotFound {
                name: name.to_string(),
            })
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<Task> {
        self.registry.set_enabled(name, enabled)
    }

    /// Dispatch a task immediately, outside its trigger. Returns `false` when
    /// the task is already running (overlap suppression).
    pub fn run_task_now(&self, name: &str) -> Result<bool> {
        match self.registry.mark_started(name)? {
            Some(claim) => {
                info!(task = %name, "manual run");
                self.dispatcher.submit(claim, 1);
                Ok(true)
            }
            None => {
                debug!(task = %name, "manual run skipped, already running");
                Ok(false)
            }
        }
    }

    /// Recent history, most recent first: up to `history_per_task` records
    /// per task. Older records stay in the history store.
    pub fn get_history(&self, name: Option<&str>) -> Vec<ExecutionRecord> {
        self.ledger.query(name)
    }

    /// Stop dispatching on ticks. Running attempts and retry chains continue.
    pub fn pause(&self) {
        if self.control.send_if_modified(|c| !std::mem::replace(&mut c.paused, true)) {
            info!("scheduler paused");
        }
    }

    /// Resume dispatching. Instants missed while paused are not made up.
    pub fn resume(&self) {
        if self.control.send_if_modified(|c| std::mem::replace(&mut c.paused, false)) {
            info!("scheduler resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.control.borrow().paused
    }

    pub fn get_status(&self) -> SchedulerStatus {
        let control = *self.control.borrow();
        let uptime_secs = control
            .started_at
            .filter(|_| control.running)
            .map(|t| (Utc::now() - t).num_seconds().max(0))
            .unwrap_or(0);
        SchedulerStatus {
            running: control.running,
            paused: control.paused,
            tasks_count: self.registry.len(),
            in_flight: self.registry.in_flight(),
            run_count: self.dispatcher.run_count(),
            started_at: control.started_at,
            uptime_secs,
            tick_secs: self.tick.as_secs(),
        }
    }
}

/// The next wall-clock multiple of `tick` after `now`, and how long until it.
fn next_tick(now: DateTime<Utc>, tick: Duration) -> (DateTime<Utc>, Duration) {
    let tick_ms = tick.as_millis().max(1) as i64;
    let now_ms = now.timestamp_millis();
    let boundary_ms = (now_ms.div_euclid(tick_ms) + 1) * tick_ms;
    let boundary = Utc.timestamp_millis_opt(boundary_ms).single().unwrap_or(now);
    let wait = Duration::from_millis((boundary_ms - now_ms).max(0) as u64);
    (boundary, wait)
}
