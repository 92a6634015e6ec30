use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::info;

use crate::{error::Result, store::HistoryStore, types::ExecutionRecord};

/// Append-only history of attempts, mirrored to a [`HistoryStore`].
///
/// Memory holds the newest `per_task` records of each task; the store keeps
/// everything. A record only becomes visible here after the store accepted
/// it, so every record returned by `query` is durable.
pub struct HistoryLedger {
    store: Arc<dyn HistoryStore>,
    per_task: usize,
    recent: RwLock<HashMap<String, VecDeque<ExecutionRecord>>>,
}

impl HistoryLedger {
    /// `per_task` is clamped to at least one record.
    pub fn new(store: Arc<dyn HistoryStore>, per_task: usize) -> Self {
        Self {
            store,
            per_task: per_task.max(1),
            recent: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the in-memory window with the newest records in the store.
    pub fn load(&self) -> Result<usize> {
        let records = self.store.recent(self.per_task)?;
        let count = records.len();
        let mut recent: HashMap<String, VecDeque<ExecutionRecord>> = HashMap::new();
        // Oldest first so each window's front is its oldest record.
        for record in records.into_iter().rev() {
            recent
                .entry(record.task_name.clone())
                .or_default()
                .push_back(record);
        }
        *self.recent.write().unwrap_or_else(PoisonError::into_inner) = recent;
        info!(count, per_task = self.per_task, "execution history loaded");
        Ok(count)
    }

    pub fn append(&self, record: ExecutionRecord) -> Result<()> {
        self.store.append(&record)?;
        let mut recent = self.recent.write().unwrap_or_else(PoisonError::into_inner);
        let window = recent.entry(record.task_name.clone()).or_default();
        window.push_back(record);
        while window.len() > self.per_task {
            window.pop_front();
        }
        Ok(())
    }

    /// Records for one task, or for all tasks, most recent first. Attempts
    /// that started in the same instant are ordered by attempt number.
    pub fn query(&self, task_name: Option<&str>) -> Vec<ExecutionRecord> {
        let recent = self.recent.read().unwrap_or_else(PoisonError::into_inner);
        let mut records: Vec<ExecutionRecord> = match task_name {
            Some(name) => recent
                .get(name)
                .map(|w| w.iter().cloned().collect())
                .unwrap_or_default(),
            None => recent.values().flatten().cloned().collect(),
        };
        records.sort_by(ExecutionRecord::newest_first);
        records
    }

    pub fn len(&self) -> usize {
        self.recent
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(VecDeque::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
