//! The unit a stage emits.

use super::Artifact;
use crate::errors::StageError;
use serde::{Deserialize, Serialize};

/// One element of a stage's result sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "lowercase")]
pub enum StageResult {
    /// A human-readable status line.
    Progress(String),
    /// A produced file or record.
    Artifact(Artifact),
    /// A per-item or fatal failure.
    Error(StageError),
}

impl StageResult {
    /// Creates a progress result.
    #[must_use]
    pub fn progress(line: impl Into<String>) -> Self {
        Self::Progress(line.into())
    }

    /// Returns true for a fatal error.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Error(err) if err.is_fatal())
    }

    /// Returns the artifact, if this is one.
    #[must_use]
    pub fn artifact(&self) -> Option<&Artifact> {
        match self {
            Self::Artifact(artifact) => Some(artifact),
            _ => None,
        }
    }

    /// Renders the result as a log line.
    #[must_use]
    pub fn to_line(&self) -> String {
        match self {
            Self::Progress(line) => line.clone(),
            Self::Artifact(artifact) => match artifact.count {
                Some(count) => format!("[{}] produced {} ({count})", artifact.stage, artifact.name),
                None => format!("[{}] produced {}", artifact.stage, artifact.name),
            },
            Self::Error(err) => {
                let label = if err.is_fatal() { "fatal" } else { "error" };
                match &err.subject {
                    Some(subject) => format!("[{}] {label}: {subject}: {}", err.stage, err.message),
                    None => format!("[{}] {label}: {}", err.stage, err.message),
                }
            }
        }
    }
}

impl From<Artifact> for StageResult {
    fn from(artifact: Artifact) -> Self {
        Self::Artifact(artifact)
    }
}

impl From<StageError> for StageResult {
    fn from(err: StageError) -> Self {
        Self::Error(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ArtifactKind;

    #[test]
    fn test_lines() {
        let artifact = Artifact::file(ArtifactKind::Text, "mail", "p/a.txt").with_count(3);
        assert_eq!(StageResult::from(artifact).to_line(), "[mail] produced a.txt (3)");

        let err = StageError::item("mail", "unreadable").with_subject("b.eml");
        assert_eq!(StageResult::from(err).to_line(), "[mail] error: b.eml: unreadable");

        let fatal = StageResult::from(StageError::fatal("mail", "no dir"));
        assert!(fatal.is_fatal());
        assert_eq!(fatal.to_line(), "[mail] fatal: no dir");
    }

    #[test]
    fn test_tagged_serialization() {
        let json = serde_json::to_value(StageResult::progress("reading")).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "progress", "payload": "reading"}));
    }
}
