//! Error types for the docflow engine.
//!
//! Errors are split by concern: stage failures distinguish per-item from
//! fatal, cache faults are always recoverable, and pipeline validation
//! errors carry a contract code for diagnostics.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for docflow operations.
#[derive(Debug, Error)]
pub enum DocflowError {
    /// A pipeline validation error occurred.
    #[error("{0}")]
    Validation(#[from] PipelineValidationError),

    /// A stage failed.
    #[error("{0}")]
    Stage(#[from] StageError),

    /// The mapping cache failed.
    #[error("{0}")]
    Cache(#[from] CacheError),

    /// The profile store rejected an operation.
    #[error("{0}")]
    Profile(#[from] ProfileError),

    /// A mapping could not be parsed or applied.
    #[error("{0}")]
    Mapping(#[from] MappingError),

    /// Configuration could not be loaded.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// A model endpoint failed.
    #[error("{0}")]
    Model(#[from] ModelError),

    /// A task could not be found.
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How far a stage failure reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Only the current unit of work is lost; the stage continues.
    Item,
    /// The stage cannot continue; the pipeline aborts.
    Fatal,
}

/// Error raised by a stage body.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("Stage {stage} failed: {message}")]
pub struct StageError {
    /// Stage that failed.
    pub stage: String,
    /// Failure message.
    pub message: String,
    /// The input the failure is attributed to, if any.
    pub subject: Option<String>,
    /// Whether the failure is per-item or fatal.
    pub severity: Severity,
}

impl StageError {
    /// Creates a per-item error.
    #[must_use]
    pub fn item(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            message: message.into(),
            subject: None,
            severity: Severity::Item,
        }
    }

    /// Creates a fatal error.
    #[must_use]
    pub fn fatal(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            message: message.into(),
            subject: None,
            severity: Severity::Fatal,
        }
    }

    /// Attributes the error to an input.
    #[must_use]
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Returns true if the error aborts the pipeline.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.severity == Severity::Fatal
    }
}

/// Errors from a mapping cache backend.
///
/// These never abort a run: callers degrade them to a cache miss.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The backend is unavailable.
    #[error("Mapping cache unavailable: {0}")]
    Unavailable(String),

    /// The backend returned data that could not be decoded.
    #[error("Mapping cache corrupt entry for {fingerprint}: {reason}")]
    Corrupt {
        /// The fingerprint whose entry was unreadable.
        fingerprint: String,
        /// Why it was unreadable.
        reason: String,
    },
}

/// Errors parsing or applying a mapping.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MappingError {
    /// The mapping is not a supported projection.
    #[error("Invalid mapping at offset {offset}: {reason}")]
    Syntax {
        /// Byte offset of the problem.
        offset: usize,
        /// What was wrong.
        reason: String,
    },

    /// The mapping references a column the table does not have.
    #[error("Unknown column '{0}'")]
    UnknownColumn(String),

    /// The generator could not produce a mapping.
    #[error("Mapping generation failed: {0}")]
    Generation(String),
}

/// Errors from a model endpoint.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ModelError {
    /// No endpoint is configured.
    #[error("Model endpoint not configured")]
    NotConfigured,

    /// The endpoint could not be reached.
    #[error("Cannot reach model endpoint {0}")]
    Connection(String),

    /// The request exceeded its timeout.
    #[error("Model request timed out after {0:.1}s")]
    Timeout(f64),

    /// The endpoint answered with an error status.
    #[error("Model endpoint returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// The response could not be understood.
    #[error("Unexpected model response: {0}")]
    Response(String),

    /// The model configuration is unusable.
    #[error("Invalid model configuration: {0}")]
    InvalidConfig(String),
}

/// Errors from the profile store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProfileError {
    /// No profile with this id exists.
    #[error("Profile not found: {0}")]
    NotFound(i64),

    /// A profile with this name already exists.
    #[error("Profile with name '{0}' already exists")]
    DuplicateName(String),
}

/// Errors while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("Cannot read config {path}: {source}")]
    Read {
        /// Path of the file.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid.
    #[error("Invalid config {path}: {source}")]
    Parse {
        /// Path of the file.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },

    /// An environment override had an invalid value.
    #[error("Invalid value for {var}: {value}")]
    Env {
        /// Variable name.
        var: String,
        /// Offending value.
        value: String,
    },

    /// A setting is out of range.
    #[error("Invalid {field}: {reason}")]
    Invalid {
        /// Setting name.
        field: String,
        /// What is wrong with it.
        reason: String,
    },
}

/// Metadata about a contract error for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContractErrorInfo {
    /// Error code (e.g., "CONTRACT-004-EMPTY").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ContractErrorInfo {
    /// Creates a new contract error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Error raised when pipeline validation fails.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PipelineValidationError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
    /// Optional contract error info.
    pub error_info: Option<ContractErrorInfo>,
}

impl PipelineValidationError {
    /// Creates a new pipeline validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
            error_info: None,
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }

    /// Sets the contract error info.
    #[must_use]
    pub fn with_error_info(mut self, info: ContractErrorInfo) -> Self {
        self.error_info = Some(info);
        self
    }

    /// Returns the contract code, if any.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.error_info.as_ref().map(|info| info.code.as_str())
    }
}
