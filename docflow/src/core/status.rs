//! Task status and stage kind enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The role a stage plays in an extraction pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Reads source documents into the processing area.
    Reader,
    /// Turns staged documents into structured records.
    Extractor,
    /// Materializes records as output files.
    Exporter,
}

impl Default for StageKind {
    fn default() -> Self {
        Self::Extractor
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reader => write!(f, "reader"),
            Self::Extractor => write!(f, "extractor"),
            Self::Exporter => write!(f, "exporter"),
        }
    }
}

/// Lifecycle status of a task.
///
/// `pending -> running -> {completed, failed, cancelled}`. Terminal
/// states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Accepted, not yet draining the pipeline.
    Pending,
    /// Draining the pipeline.
    Running,
    /// Pipeline drained without a fatal error or cancellation.
    Completed,
    /// Pipeline yielded a fatal error.
    Failed,
    /// Cancellation was requested before completion.
    Cancelled,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl TaskStatus {
    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns true if the state machine allows moving to `next`.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Running | Self::Cancelled | Self::Failed),
            Self::Running => next.is_terminal(),
            Self::Completed | Self::Failed | Self::Cancelled => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_kind_display() {
        assert_eq!(StageKind::Reader.to_string(), "reader");
        assert_eq!(StageKind::Extractor.to_string(), "extractor");
        assert_eq!(StageKind::Exporter.to_string(), "exporter");
    }

    #[test]
    fn test_task_status_display() {
        assert_eq!(TaskStatus::Pending.to_string(), "pending");
        assert_eq!(TaskStatus::Cancelled.to_string(), "cancelled");
    }

    #[test]
    fn test_task_status_is_terminal() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }

    #[test]
    fn test_terminal_states_are_absorbing() {
        let all = [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ];
        for terminal in all.iter().filter(|s| s.is_terminal()) {
            for next in all {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Running.can_transition_to(TaskStatus::Pending));
    }

    #[test]
    fn test_task_status_serialize() {
        let json = serde_json::to_string(&TaskStatus::Completed).unwrap();
        assert_eq!(json, r#""completed""#);

        let deserialized: TaskStatus = serde_json::from_str(r#""cancelled""#).unwrap();
        assert_eq!(deserialized, TaskStatus::Cancelled);
    }
}
