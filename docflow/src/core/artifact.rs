//! Artifacts produced by stages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// What an artifact holds, so later stages can pick what they understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Plain text extracted from a document (e.g. a mail body).
    Text,
    /// A table with a header row, staged as JSON.
    Table,
    /// Structured records keyed by information-item label.
    Records,
    /// A materialized output file in the destination area.
    Export,
    /// Anything else.
    Other,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Table => write!(f, "table"),
            Self::Records => write!(f, "records"),
            Self::Export => write!(f, "export"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// A reference to a file or structured record produced by a stage.
///
/// Artifacts are immutable once emitted; ownership passes to whoever
/// consumes the result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// What the artifact holds.
    pub kind: ArtifactKind,

    /// A unique identifier for the artifact.
    pub id: String,

    /// The stage that produced it.
    pub stage: String,

    /// Display name, usually the file name.
    pub name: String,

    /// The file backing the artifact, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// Inline payload for record artifacts.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,

    /// Number of records or rows, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,

    /// Additional metadata about the artifact.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,

    /// When the artifact was created.
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    /// Creates an artifact backed by a file.
    #[must_use]
    pub fn file(kind: ArtifactKind, stage: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
        Self {
            kind,
            id: Uuid::new_v4().to_string(),
            stage: stage.into(),
            name,
            path: Some(path),
            data: serde_json::Value::Null,
            count: None,
            metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Creates an in-memory record artifact.
    #[must_use]
    pub fn record(stage: impl Into<String>, name: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            kind: ArtifactKind::Records,
            id: Uuid::new_v4().to_string(),
            stage: stage.into(),
            name: name.into(),
            path: None,
            data,
            count: None,
            metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Sets the record count.
    #[must_use]
    pub fn with_count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }

    /// Adds metadata to the artifact.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Returns the backing file path, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Returns the file stem with any secondary suffix (`.table`, `.records`) removed.
    #[must_use]
    pub fn stem(&self) -> String {
        let stem = self
            .path()
            .and_then(Path::file_stem)
            .map_or_else(|| self.name.clone(), |s| s.to_string_lossy().into_owned());
        match stem.rsplit_once('.') {
            Some((base, "table" | "records")) => base.to_string(),
            _ => stem,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_artifact_name_from_path() {
        let artifact = Artifact::file(ArtifactKind::Text, "mail_reader", "/tmp/work/processing/a.txt");

        assert_eq!(artifact.kind, ArtifactKind::Text);
        assert_eq!(artifact.name, "a.txt");
        assert_eq!(artifact.stage, "mail_reader");
        assert_eq!(artifact.stem(), "a");
    }

    #[test]
    fn test_stem_strips_staging_suffix() {
        let table = Artifact::file(ArtifactKind::Table, "t", "p/book_Sheet1.table.json");
        let records = Artifact::file(ArtifactKind::Records, "m", "p/book_Sheet1.records.json");

        assert_eq!(table.stem(), "book_Sheet1");
        assert_eq!(records.stem(), "book_Sheet1");
    }

    #[test]
    fn test_record_artifact() {
        let artifact = Artifact::record("extract", "row-1", serde_json::json!({"name": "Ann"}))
            .with_count(1)
            .with_metadata("source", serde_json::json!("a.eml"));

        assert!(artifact.path().is_none());
        assert_eq!(artifact.count, Some(1));
        assert_eq!(artifact.metadata.len(), 1);
    }

    #[test]
    fn test_artifact_serialization_skips_empty_fields() {
        let artifact = Artifact::file(ArtifactKind::Export, "export", "d/out.csv");
        let json = serde_json::to_value(&artifact).unwrap();

        assert_eq!(json["kind"], "export");
        assert!(json.get("data").is_none());
        assert!(json.get("metadata").is_none());
    }
}
