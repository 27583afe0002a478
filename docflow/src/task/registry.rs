//! Process-wide table of tasks used to route cancellation and status reads.

use super::{Task, TaskSnapshot};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// What a cancellation request found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The signal was set; the task will settle as cancelled.
    Requested,
    /// No task with that id is known.
    NotFound,
    /// The task already reached a terminal status.
    AlreadyFinished,
}

impl CancelOutcome {
    /// Returns true if a task with the id exists.
    #[must_use]
    pub fn found(&self) -> bool {
        !matches!(self, Self::NotFound)
    }
}

#[derive(Debug, Default)]
struct Tables {
    active: HashMap<String, Weak<Task>>,
    finished: HashMap<String, (TaskSnapshot, Instant)>,
}

/// Active tasks by id, plus recently finished snapshots.
///
/// Only weak references to running tasks are held; the driver owns the
/// task. Every mutation happens behind one lock.
#[derive(Debug)]
pub struct TaskRegistry {
    tables: Mutex<Tables>,
    retention: Duration,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

impl TaskRegistry {
    /// Creates a registry keeping finished snapshots for `retention`.
    #[must_use]
    pub fn new(retention: Duration) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            retention,
        }
    }

    /// Registers a task. Expired snapshots are dropped on the way.
    pub fn register(&self, task: &Arc<Task>) {
        let mut tables = self.tables.lock();
        self.purge(&mut tables);
        tables.active.insert(task.id().to_string(), Arc::downgrade(task));
    }

    /// Looks up a live task.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Task>> {
        self.tables.lock().active.get(id).and_then(Weak::upgrade)
    }

    /// Moves a settled task out of the active table.
    ///
    /// Its final snapshot stays readable until the retention window passes
    /// or it is acknowledged.
    pub fn complete(&self, task: &Task) {
        let snapshot = task.snapshot();
        let mut tables = self.tables.lock();
        tables.active.remove(task.id());
        self.purge(&mut tables);
        info!(task_id = %task.id(), status = %snapshot.status, "Task settled");
        tables
            .finished
            .insert(task.id().to_string(), (snapshot, Instant::now()));
    }

    /// Reads a task's current or final state.
    #[must_use]
    pub fn snapshot(&self, id: &str) -> Option<TaskSnapshot> {
        let mut tables = self.tables.lock();
        self.purge(&mut tables);
        if let Some(task) = tables.active.get(id).and_then(Weak::upgrade) {
            return Some(task.snapshot());
        }
        tables.finished.get(id).map(|(snapshot, _)| snapshot.clone())
    }

    /// Sets the task's cancellation signal and returns immediately.
    pub fn request_cancel(&self, id: &str, reason: &str) -> CancelOutcome {
        let mut tables = self.tables.lock();
        match tables.active.get(id).map(Weak::upgrade) {
            Some(Some(task)) if task.status().is_terminal() => return CancelOutcome::AlreadyFinished,
            Some(Some(task)) => {
                task.token().cancel(reason);
                debug!(task_id = %id, reason, "Cancellation requested");
                return CancelOutcome::Requested;
            }
            Some(None) => {
                tables.active.remove(id);
            }
            None => {}
        }
        self.purge(&mut tables);
        if tables.finished.contains_key(id) {
            CancelOutcome::AlreadyFinished
        } else {
            CancelOutcome::NotFound
        }
    }

    /// Drops a finished snapshot early. Returns true if one was dropped.
    pub fn acknowledge(&self, id: &str) -> bool {
        self.tables.lock().finished.remove(id).is_some()
    }

    /// All known snapshots, newest first.
    #[must_use]
    pub fn list(&self) -> Vec<TaskSnapshot> {
        let mut tables = self.tables.lock();
        self.purge(&mut tables);
        let mut all: Vec<TaskSnapshot> = tables
            .active
            .values()
            .filter_map(Weak::upgrade)
            .map(|task| task.snapshot())
            .chain(tables.finished.values().map(|(snapshot, _)| snapshot.clone()))
            .collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all
    }

    /// Number of running or pending tasks.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.tables
            .lock()
            .active
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Number of finished snapshots still held.
    #[must_use]
    pub fn retained_count(&self) -> usize {
        self.tables.lock().finished.len()
    }

    fn purge(&self, tables: &mut Tables) {
        let retention = self.retention;
        tables.finished.retain(|_, (_, at)| at.elapsed() < retention);
        tables.active.retain(|_, weak| weak.strong_count() > 0);
    }
}
