//! A single pipeline invocation and its observable state.

use crate::cancellation::CancellationToken;
use crate::core::{ArtifactKind, TaskStatus};
use crate::pipeline::{LineKind, LogLine, RunOutcome};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

const EVENT_CAPACITY: usize = 256;

/// What subscribers of a task receive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    /// The task moved to a new status.
    Status {
        /// The new status.
        status: TaskStatus,
        /// Progress at the time of the move.
        progress: u8,
    },
    /// A line was relayed from the pipeline.
    Line {
        /// The rendered line.
        text: String,
        /// Progress after the line.
        progress: u8,
    },
}

/// A point-in-time copy of a task's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    /// The task id.
    pub id: String,
    /// The pipeline the task runs.
    pub pipeline: String,
    /// Current status.
    pub status: TaskStatus,
    /// When the task was accepted.
    pub created_at: DateTime<Utc>,
    /// When the pipeline started draining.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// Why the task failed. Never set for cancellation.
    pub error_detail: Option<String>,
    /// 0 to 100.
    pub progress: u8,
    /// Source files the caller asked for.
    pub files: Vec<String>,
    /// Files written to the destination.
    pub result_files: Vec<String>,
    /// Every relayed line, in order.
    pub log: Vec<String>,
}

#[derive(Debug)]
struct TaskState {
    status: TaskStatus,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    error_detail: Option<String>,
    progress: u8,
    files: Vec<String>,
    result_files: Vec<String>,
    log: Vec<String>,
}

/// One invocation of a pipeline bound to an id, a status and its own
/// cancellation token.
#[derive(Debug)]
pub struct Task {
    id: String,
    pipeline: String,
    token: Arc<CancellationToken>,
    state: RwLock<TaskState>,
    status_tx: watch::Sender<TaskStatus>,
    events: broadcast::Sender<TaskEvent>,
}

impl Task {
    /// Creates a pending task with a fresh token.
    #[must_use]
    pub fn new(pipeline: impl Into<String>, files: Vec<String>) -> Self {
        let (status_tx, _) = watch::channel(TaskStatus::Pending);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            pipeline: pipeline.into(),
            token: Arc::new(CancellationToken::new()),
            state: RwLock::new(TaskState {
                status: TaskStatus::Pending,
                created_at: Utc::now(),
                started_at: None,
                completed_at: None,
                error_detail: None,
                progress: 0,
                files,
                result_files: Vec::new(),
                log: Vec::new(),
            }),
            status_tx,
            events,
        }
    }

    /// The task id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The task's cancellation token.
    #[must_use]
    pub fn token(&self) -> &Arc<CancellationToken> {
        &self.token
    }

    /// The current status.
    #[must_use]
    pub fn status(&self) -> TaskStatus {
        self.state.read().status
    }

    /// Copies the current state.
    #[must_use]
    pub fn snapshot(&self) -> TaskSnapshot {
        let state = self.state.read();
        TaskSnapshot {
            id: self.id.clone(),
            pipeline: self.pipeline.clone(),
            status: state.status,
            created_at: state.created_at,
            started_at: state.started_at,
            completed_at: state.completed_at,
            error_detail: state.error_detail.clone(),
            progress: state.progress,
            files: state.files.clone(),
            result_files: state.result_files.clone(),
            log: state.log.clone(),
        }
    }

    /// Receives every later status change and relayed line.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Waits until the task reaches a terminal status.
    pub async fn wait(&self) -> TaskStatus {
        let mut rx = self.status_tx.subscribe();
        // The sender lives as long as `self`, so the wait cannot fail.
        let settled = rx.wait_for(TaskStatus::is_terminal).await.map(|status| *status);
        settled.unwrap_or_else(|_| self.status())
    }

    /// Moves to `next` if the lifecycle allows it.
    ///
    /// Returns false, leaving the task untouched, for a disallowed move.
    /// Terminal statuses never change.
    pub(crate) fn transition(&self, next: TaskStatus, detail: Option<String>) -> bool {
        let progress = {
            let mut state = self.state.write();
            if !state.status.can_transition_to(next) {
                warn!(task_id = %self.id, from = %state.status, to = %next, "Rejected status change");
                return false;
            }
            state.status = next;
            let now = Utc::now();
            match next {
                TaskStatus::Running => state.started_at = Some(now),
                TaskStatus::Completed => {
                    state.completed_at = Some(now);
                    state.progress = 100;
                }
                TaskStatus::Failed => {
                    state.completed_at = Some(now);
                    state.error_detail = detail;
                }
                TaskStatus::Cancelled => state.completed_at = Some(now),
                TaskStatus::Pending => {}
            }
            state.progress
        };
        debug!(task_id = %self.id, status = %next, "Task status changed");
        self.status_tx.send_replace(next);
        let _ = self.events.send(TaskEvent::Status { status: next, progress });
        true
    }

    /// Appends a relayed line and advances progress by a tenth of what remains.
    pub(crate) fn record_line(&self, line: &LogLine) {
        let progress = {
            let mut state = self.state.write();
            state.progress += (100 - state.progress) / 10;
            state.log.push(line.text.clone());
            if line.kind == LineKind::Artifact {
                if let Some(artifact) = line.artifact.as_ref().filter(|a| a.kind == ArtifactKind::Export) {
                    state.result_files.push(artifact.name.clone());
                }
            }
            state.progress
        };
        let _ = self.events.send(TaskEvent::Line {
            text: line.text.clone(),
            progress,
        });
    }

    /// Settles a started task from how its run ended.
    ///
    /// The signal being set now does not matter: a run that drained before
    /// the cancel arrived completes. Cancellation is never recorded as an
    /// error.
    pub(crate) fn finish(&self, ended: RunOutcome, fatal: Option<String>) -> TaskStatus {
        match ended {
            RunOutcome::Completed => self.transition(TaskStatus::Completed, None),
            RunOutcome::Cancelled => self.transition(TaskStatus::Cancelled, None),
            RunOutcome::Failed => {
                let detail = fatal.unwrap_or_else(|| "pipeline stopped unexpectedly".to_string());
                self.transition(TaskStatus::Failed, Some(detail))
            }
        };
        self.status()
    }
}
