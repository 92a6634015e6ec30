//! Persistence seams for task definitions, scheduling state and history.
//!
//! The engine mirrors every registry mutation through a [`DefinitionStore`]
//! before acknowledging it, and appends every attempt through a
//! [`HistoryStore`]. [`crate::db::SqliteStore`] is the durable implementation;
//! [`MemoryStore`] backs tests and ephemeral schedulers.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::{
    error::{Result, SchedulerError},
    types::{ExecutionRecord, SchedulingState, Task},
};

/// Authoritative store of task definitions and their scheduling state.
pub trait DefinitionStore: Send + Sync {
    fn load_all(&self) -> Result<Vec<Task>>;
    /// Insert or replace the definition keyed by `task.name`.
    fn save(&self, task: &Task) -> Result<()>;
    /// Delete the definition and its scheduling state. Missing names are not an error.
    fn delete(&self, name: &str) -> Result<()>;
    fn load_states(&self) -> Result<Vec<(String, SchedulingState)>>;
    fn save_state(&self, name: &str, state: &SchedulingState) -> Result<()>;
}

/// Append-only execution history.
pub trait HistoryStore: Send + Sync {
    fn append(&self, record: &ExecutionRecord) -> Result<()>;
    /// Records for `task_name` (or all tasks), most recent first.
    fn query(&self, task_name: Option<&str>) -> Result<Vec<ExecutionRecord>>;
    /// The newest `per_task` records of every task, most recent first.
    fn recent(&self, per_task: usize) -> Result<Vec<ExecutionRecord>>;
}

#[derive(Default)]
struct MemoryInner {
    tasks: BTreeMap<String, Task>,
    states: BTreeMap<String, SchedulingState>,
    history: Vec<ExecutionRecord>,
}

/// Process-local store. `set_fail_writes(true)` makes every write fail, which
/// lets tests exercise the "store unavailable" paths.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SchedulerError::Storage("store unavailable".to_string()));
        }
        Ok(())
    }
}

impl DefinitionStore for MemoryStore {
    fn load_all(&self) -> Result<Vec<Task>> {
        Ok(self.lock().tasks.values().cloned().collect())
    }

    fn save(&self, task: &Task) -> Result<()> {
        self.check_writable()?;
        self.lock().tasks.insert(task.name.clone(), task.clone());
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<()> {
        self.check_writable()?;
        let mut inner = self.lock();
        inner.tasks.remove(name);
        inner.states.remove(name);
        Ok(())
    }

    fn load_states(&self) -> Result<Vec<(String, SchedulingState)>> {
        Ok(self
            .lock()
            .states
            .iter()
            .map(|(name, state)| (name.clone(), state.clone()))
            .collect())
    }

    fn save_state(&self, name: &str, state: &SchedulingState) -> Result<()> {
        self.check_writable()?;
        self.lock().states.insert(name.to_string(), state.clone());
        Ok(())
    }
}

impl HistoryStore for MemoryStore {
    fn append(&self, record: &ExecutionRecord) -> Result<()> {
        self.check_writable()?;
        self.lock().history.push(record.clone());
        Ok(())
    }

    fn query(&self, task_name: Option<&str>) -> Result<Vec<ExecutionRecord>> {
        let mut records: Vec<ExecutionRecord> = self
            .lock()
            .history
            .iter()
            .filter(|r| task_name.map_or(true, |name| r.task_name == name))
            .cloned()
            .collect();
        records.sort_by(ExecutionRecord::newest_first);
        Ok(records)
    }

    fn recent(&self, per_task: usize) -> Result<Vec<ExecutionRecord>> {
        let mut seen: HashMap<String, usize> = HashMap::new();
        let records = self
            .query(None)?
            .into_iter()
            .filter(|r| {
                let count = seen.entry(r.task_name.clone()).or_default();
                *count += 1;
                *count <= per_task
            })
            .collect();
        Ok(records)
    }
}
