//! Task registry: name → definition + live [`SchedulingState`].
//!
//! Each entry carries its own mutex; every read-then-write of `running`,
//! `last_fired_at` or `retry` happens under it, so the trigger loop and
//! concurrently finishing attempts never lose each other's updates.
//! Definition mutations are written to the [`DefinitionStore`] first and only
//! applied in memory once the store accepted them.
//!
//! Every registration gets a fresh generation number. Claims carry it, and
//! outcomes or retries for an older generation of a re-added name are
//! treated as belonging to a removed task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry as MapEntry, DashMap};
use tracing::{debug, info, warn};

use crate::{
    cron::{floor_minute, Trigger},
    error::{Result, SchedulerError},
    store::DefinitionStore,
    types::{Outcome, RetryState, SchedulingState, Task, TaskSpec, TaskSummary},
};

struct Entry {
    generation: u64,
    trigger: Trigger,
    slot: Mutex<Slot>,
}

struct Slot {
    task: Task,
    state: SchedulingState,
}

impl Entry {
    fn new(generation: u64, trigger: Trigger, task: Task, state: SchedulingState) -> Arc<Self> {
        Arc::new(Self {
            generation,
            trigger,
            slot: Mutex::new(Slot { task, state }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn claim(&self, slot: &Slot) -> Claim {
        Claim {
            task: slot.task.clone(),
            generation: self.generation,
        }
    }
}

/// A task claimed for dispatch, tied to the registration it was claimed from.
#[derive(Debug, Clone, PartialEq)]
pub struct Claim {
    pub task: Task,
    pub generation: u64,
}

/// A persisted retry to re-arm after a restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRetry {
    pub name: String,
    pub generation: u64,
    pub retry: RetryState,
}

/// What `record_outcome` decided for the attempt that just finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Another attempt is due at `next_attempt_at`; the task stays `running`.
    RetryScheduled(RetryState),
    /// The chain is over (success or retries exhausted); `running` is cleared.
    Finished,
    /// The task was removed (or removed and re-added) while the attempt ran.
    Removed,
}

pub struct TaskRegistry {
    entries: DashMap<String, Arc<Entry>>,
    store: Arc<dyn DefinitionStore>,
    next_generation: AtomicU64,
}

impl TaskRegistry {
    pub fn new(store: Arc<dyn DefinitionStore>) -> Self {
        Self {
            entries: DashMap::new(),
            store,
            next_generation: AtomicU64::new(1),
        }
    }

    fn generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    /// Populate from the store. Definitions whose trigger no longer parses are
    /// skipped with a warning. A task with a persisted pending retry comes
    /// back as `running` so the trigger loop leaves it alone until the chain
    /// is resumed.
    pub fn load(&self) -> Result<usize> {
        let mut states: HashMap<String, SchedulingState> =
            self.store.load_states()?.into_iter().collect();

        for task in self.store.load_all()? {
            let trigger = match task.validate() {
                Ok(trigger) => trigger,
                Err(e) => {
                    warn!(task = %task.name, "skipping stored task: {e}");
                    continue;
                }
            };
            let mut state = states.remove(&task.name).unwrap_or_default();
            state.running = state.retry.is_some();
            self.entries.insert(
                task.name.clone(),
                Entry::new(self.generation(), trigger, task, state),
            );
        }

        let count = self.entries.len();
        info!(count, "task registry loaded");
        Ok(count)
    }

    /// Validate and register a new task. The definition is persisted before
    /// it becomes visible; on any error nothing changes.
    pub fn add(&self, spec: TaskSpec) -> Result<Task> {
        let (task, trigger) = spec.build(Utc::now())?;
        match self.entries.entry(task.name.clone()) {
            MapEntry::Occupied(_) => Err(SchedulerError::DuplicateTask { name: task.name }),
            MapEntry::Vacant(vacant) => {
                self.store.save(&task)?;
                vacant.insert(Entry::new(
                    self.generation(),
                    trigger,
                    task.clone(),
                    SchedulingState::default(),
                ));
                info!(task = %task.name, trigger = %task.trigger, "task added");
                Ok(task)
            }
        }
    }

    /// Delete a task. Persisted first; history is kept.
    pub fn remove(&self, name: &str) -> Result<()> {
        match self.entries.entry(name.to_string()) {
            MapEntry::Vacant(_) => Err(SchedulerError::TaskNotFound {
                name: name.to_string(),
            }),
            MapEntry::Occupied(occupied) => {
                self.store.delete(name)?;
                occupied.remove();
                info!(task = %name, "task removed");
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Task> {
        self.entry(name).map(|e| e.lock().task.clone())
    }

    pub fn state(&self, name: &str) -> Option<SchedulingState> {
        self.entry(name).map(|e| e.lock().state.clone())
    }

    /// All tasks, oldest first.
    pub fn list_all(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.snapshot().iter().map(|e| e.lock().task.clone()).collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name)));
        tasks
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every task with its state and next natural firing after `now`,
    /// oldest first.
    pub fn summaries(&self, now: DateTime<Utc>) -> Vec<TaskSummary> {
        let mut summaries: Vec<TaskSummary> = self
            .snapshot()
            .iter()
            .map(|entry| summarize(entry, now))
            .collect();
        summaries.sort_by(|a, b| {
            a.task
                .created_at
                .cmp(&b.task.created_at)
                .then_with(|| a.task.name.cmp(&b.task.name))
        });
        summaries
    }

    pub fn summary(&self, name: &str, now: DateTime<Utc>) -> Option<TaskSummary> {
        self.entry(name).map(|entry| summarize(&entry, now))
    }

    /// Number of tasks whose `running` flag is set.
    pub fn in_flight(&self) -> usize {
        self.snapshot()
            .iter()
            .filter(|e| e.lock().state.running)
            .count()
    }

    /// Enable or disable a task, persisting the change first.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<Task> {
        let entry = self.entry(name).ok_or_else(|| SchedulerError::TaskNotFound {
            name: name.to_string(),
        })?;
        let mut slot = entry.lock();
        let mut updated = slot.task.clone();
        updated.enabled = enabled;
        updated.updated_at = Utc::now();
        self.store.save(&updated)?;
        slot.task = updated.clone();
        info!(task = %name, enabled, "task updated");
        Ok(updated)
    }

    /// Tasks due in the minute containing `now`, highest priority first and
    /// then by name. Disabled, running and already-fired tasks are excluded.
    pub fn due_at(&self, now: DateTime<Utc>) -> Vec<Task> {
        let minute = floor_minute(now);
        let mut due: Vec<Task> = self
            .snapshot()
            .iter()
            .filter_map(|entry| {
                let slot = entry.lock();
                let eligible = slot.task.enabled
                    && !slot.state.running
                    && slot.state.last_fired_at != Some(minute)
                    && entry.trigger.is_due(minute);
                eligible.then(|| slot.task.clone())
            })
            .collect();
        sort_for_dispatch(&mut due);
        due
    }

    /// Enabled `@reboot` tasks that are not already running, in dispatch order.
    pub fn reboot_tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .snapshot()
            .iter()
            .filter(|entry| entry.trigger.is_reboot())
            .filter_map(|entry| {
                let slot = entry.lock();
                (slot.task.enabled && !slot.state.running).then(|| slot.task.clone())
            })
            .collect();
        sort_for_dispatch(&mut tasks);
        tasks
    }

    /// Claim a due task for dispatch in `minute`: re-checks eligibility and
    /// sets `running` + `last_fired_at` atomically. `None` if it is no longer
    /// eligible (removed, disabled, already running or already fired).
    pub fn mark_fired(&self, name: &str, minute: DateTime<Utc>) -> Option<Claim> {
        let entry = self.entry(name)?;
        let mut slot = entry.lock();
        if !slot.task.enabled || slot.state.running || slot.state.last_fired_at == Some(minute) {
            return None;
        }
        slot.state.running = true;
        slot.state.last_fired_at = Some(minute);
        self.persist_state(name, &slot.state);
        Some(entry.claim(&slot))
    }

    /// Claim a task for a dispatch outside the clock (`@reboot`, manual run).
    /// `last_fired_at` is untouched. `Ok(None)` if the task is already running.
    pub fn mark_started(&self, name: &str) -> Result<Option<Claim>> {
        let entry = self.entry(name).ok_or_else(|| SchedulerError::TaskNotFound {
            name: name.to_string(),
        })?;
        let mut slot = entry.lock();
        if slot.state.running {
            return Ok(None);
        }
        slot.state.running = true;
        Ok(Some(entry.claim(&slot)))
    }

    /// Apply the result of `attempt` of the registration `generation`. A
    /// failure with attempts left schedules a retry and keeps the task
    /// `running`; anything else ends the chain.
    pub fn record_outcome(
        &self,
        name: &str,
        generation: u64,
        attempt: u32,
        outcome: Outcome,
        finished_at: DateTime<Utc>,
    ) -> Transition {
        let Some(entry) = self.entry_of(name, generation) else {
            debug!(task = %name, attempt, "outcome for removed task ignored");
            return Transition::Removed;
        };
        let mut slot = entry.lock();
        let retry = if outcome.is_failure() {
            slot.task.retry.next_retry(attempt, finished_at)
        } else {
            None
        };
        slot.state.stats.record(outcome, finished_at);
        slot.state.retry = retry;
        slot.state.running = retry.is_some();
        self.persist_state(name, &slot.state);
        match retry {
            Some(r) => Transition::RetryScheduled(r),
            None => Transition::Finished,
        }
    }

    /// Claim the pending retry numbered `attempt` right before it runs.
    /// `None` if the task was removed or the retry is no longer pending.
    pub fn begin_retry(&self, name: &str, generation: u64, attempt: u32) -> Option<Claim> {
        let entry = self.entry_of(name, generation)?;
        let mut slot = entry.lock();
        match slot.state.retry {
            Some(r) if r.attempt == attempt => {
                slot.state.retry = None;
                slot.state.running = true;
                self.persist_state(name, &slot.state);
                Some(entry.claim(&slot))
            }
            _ => None,
        }
    }

    /// Persisted retries to resume after a restart.
    pub fn pending_retries(&self) -> Vec<PendingRetry> {
        self.snapshot()
            .iter()
            .filter_map(|e| {
                let slot = e.lock();
                slot.state.retry.map(|retry| PendingRetry {
                    name: slot.task.name.clone(),
                    generation: e.generation,
                    retry,
                })
            })
            .collect()
    }

    fn entry(&self, name: &str) -> Option<Arc<Entry>> {
        self.entries.get(name).map(|e| Arc::clone(e.value()))
    }

    fn entry_of(&self, name: &str, generation: u64) -> Option<Arc<Entry>> {
        self.entry(name).filter(|e| e.generation == generation)
    }

    /// Clone the entry handles so no map shard stays locked while entry
    /// mutexes are taken.
    fn snapshot(&self) -> Vec<Arc<Entry>> {
        self.entries.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Scheduling-state writes are best effort: memory stays authoritative
    /// for the running process.
    fn persist_state(&self, name: &str, state: &SchedulingState) {
        if let Err(e) = self.store.save_state(name, state) {
            warn!(task = %name, "failed to persist scheduling state: {e}");
        }
    }
}

fn summarize(entry: &Entry, now: DateTime<Utc>) -> TaskSummary {
    let slot = entry.lock();
    let next_run = if slot.task.enabled {
        entry.trigger.next_after(now)
    } else {
        None
    };
    TaskSummary {
        task: slot.task.clone(),
        state: slot.state.clone(),
        next_run,
    }
}

fn sort_for_dispatch(tasks: &mut [Task]) {
    tasks.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
}
