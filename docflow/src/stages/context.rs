//! Runtime context handed to a stage body.

use crate::cancellation::CancellationToken;
use crate::core::Artifact;
use crate::events::{EventSink, NoOpEventSink};
use crate::profile::ProfileSnapshot;
use crate::stages::StageStop;
use std::sync::Arc;

/// What a stage sees while it runs.
///
/// Cloning is cheap; every field is shared.
#[derive(Clone)]
pub struct StageContext {
    task_id: String,
    token: Arc<CancellationToken>,
    profile: Arc<ProfileSnapshot>,
    inputs: Arc<[Artifact]>,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for StageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageContext")
            .field("task_id", &self.task_id)
            .field("profile_id", &self.profile.profile_id())
            .field("inputs", &self.inputs.len())
            .field("cancelled", &self.token.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl StageContext {
    /// Creates a context with no inputs and a no-op event sink.
    #[must_use]
    pub fn new(task_id: impl Into<String>, token: Arc<CancellationToken>, profile: Arc<ProfileSnapshot>) -> Self {
        Self {
            task_id: task_id.into(),
            token,
            profile,
            inputs: Arc::from(Vec::new()),
            events: Arc::new(NoOpEventSink),
        }
    }

    /// Sets the artifacts of earlier stages this stage accepts.
    #[must_use]
    pub fn with_inputs(mut self, inputs: Vec<Artifact>) -> Self {
        self.inputs = Arc::from(inputs);
        self
    }

    /// Sets the shared event sink.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// The owning task.
    #[must_use]
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// The run's cancellation signal.
    #[must_use]
    pub fn token(&self) -> &Arc<CancellationToken> {
        &self.token
    }

    /// The profile captured when the task started.
    #[must_use]
    pub fn profile(&self) -> &Arc<ProfileSnapshot> {
        &self.profile
    }

    /// Artifacts of earlier stages, in emission order.
    #[must_use]
    pub fn inputs(&self) -> &[Artifact] {
        &self.inputs
    }

    /// The shared event sink.
    #[must_use]
    pub fn events(&self) -> &dyn EventSink {
        self.events.as_ref()
    }

    /// Returns true once the run is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Stops the stage if the run was cancelled. Call once per unit of work.
    pub fn checkpoint(&self) -> Result<(), StageStop> {
        if self.token.is_cancelled() {
            Err(StageStop::Stopped)
        } else {
            Ok(())
        }
    }
}
