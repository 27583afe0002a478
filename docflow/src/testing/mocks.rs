//! Mock stages for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::core::{Artifact, ArtifactKind, StageKind, StageResult};
use crate::errors::StageError;
use crate::stages::{Emitter, Stage, StageContext, StageOutcome};

/// One step of a [`ScriptedStage`].
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Emit an artifact with this name.
    Artifact(String),
    /// Emit a progress line.
    Progress(String),
    /// Emit a per-item error.
    ItemError {
        /// The failing input.
        subject: String,
        /// What went wrong.
        message: String,
    },
    /// Stop with a fatal error.
    Fatal(String),
    /// Wait before the next step.
    Sleep(Duration),
    /// Panic inside the stage body.
    Panic(String),
}

/// A stage that plays back a fixed script of results.
///
/// The cancellation signal is checked before every step.
#[derive(Debug)]
pub struct ScriptedStage {
    name: String,
    kind: StageKind,
    script: Vec<Step>,
    runs: AtomicUsize,
}

impl ScriptedStage {
    /// Creates a stage with an empty script.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: StageKind::Reader,
            script: Vec::new(),
            runs: AtomicUsize::new(0),
        }
    }

    /// Sets the stage kind.
    #[must_use]
    pub fn with_kind(mut self, kind: StageKind) -> Self {
        self.kind = kind;
        self
    }

    /// Appends an artifact step.
    #[must_use]
    pub fn emits(mut self, name: impl Into<String>) -> Self {
        self.script.push(Step::Artifact(name.into()));
        self
    }

    /// Appends a progress step.
    #[must_use]
    pub fn progress(mut self, line: impl Into<String>) -> Self {
        self.script.push(Step::Progress(line.into()));
        self
    }

    /// Appends a per-item error step.
    #[must_use]
    pub fn item_error(mut self, subject: impl Into<String>, message: impl Into<String>) -> Self {
        self.script.push(Step::ItemError {
            subject: subject.into(),
            message: message.into(),
        });
        self
    }

    /// Appends a fatal step.
    #[must_use]
    pub fn fatal(mut self, message: impl Into<String>) -> Self {
        self.script.push(Step::Fatal(message.into()));
        self
    }

    /// Appends a panic.
    #[must_use]
    pub fn panics(mut self, message: impl Into<String>) -> Self {
        self.script.push(Step::Panic(message.into()));
        self
    }

    /// Appends a pause.
    #[must_use]
    pub fn sleeps(mut self, delay: Duration) -> Self {
        self.script.push(Step::Sleep(delay));
        self
    }

    /// Returns how many times the stage body started.
    #[must_use]
    pub fn run_count(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Stage for ScriptedStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        self.kind
    }

    async fn produce(&self, ctx: &StageContext, out: &Emitter) -> StageOutcome {
        self.runs.fetch_add(1, Ordering::SeqCst);
        for step in &self.script {
            ctx.checkpoint()?;
            match step {
                Step::Artifact(name) => {
                    out.emit(Artifact::file(ArtifactKind::Other, &self.name, name)).await?;
                }
                Step::Progress(line) => out.progress(line.clone()).await?,
                Step::ItemError { subject, message } => {
                    out.emit(StageError::item(&self.name, message).with_subject(subject))
                        .await?;
                }
                Step::Fatal(message) => return Err(StageError::fatal(&self.name, message).into()),
                Step::Sleep(delay) => tokio::time::sleep(*delay).await,
                Step::Panic(message) => panic!("{message}"),
            }
        }
        Ok(())
    }
}

/// A stage whose setup always fails.
#[derive(Debug)]
pub struct FailingStage {
    name: String,
    error: String,
}

impl FailingStage {
    /// Creates a new failing stage.
    #[must_use]
    pub fn new(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            error: error.into(),
        }
    }
}

#[async_trait]
impl Stage for FailingStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Extractor
    }

    async fn produce(&self, _ctx: &StageContext, _out: &Emitter) -> StageOutcome {
        Err(StageError::fatal(&self.name, &self.error).into())
    }
}

/// A stage that accepts every artifact and records what it was given.
///
/// Each input is passed through as a progress line `saw <name>`.
#[derive(Debug)]
pub struct RecordingStage {
    name: String,
    observed: Mutex<Vec<String>>,
}

impl RecordingStage {
    /// Creates a new recording stage.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            observed: Mutex::new(Vec::new()),
        }
    }

    /// Names of the artifacts seen, in order.
    #[must_use]
    pub fn observed(&self) -> Vec<String> {
        self.observed.lock().clone()
    }
}

#[async_trait]
impl Stage for RecordingStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Exporter
    }

    fn accepts(&self, _artifact: &Artifact) -> bool {
        true
    }

    async fn produce(&self, ctx: &StageContext, out: &Emitter) -> StageOutcome {
        for artifact in ctx.inputs() {
            ctx.checkpoint()?;
            self.observed.lock().push(artifact.name.clone());
            out.emit(StageResult::progress(format!("saw {}", artifact.name))).await?;
        }
        Ok(())
    }
}
