//! Test fixtures for stage and pipeline testing.

use std::sync::Arc;

use crate::cancellation::CancellationToken;
use crate::core::Artifact;
use crate::events::{EventSink, NoOpEventSink};
use crate::profile::{InfoItem, ProfileInfo, ProfileSnapshot};
use crate::stages::StageContext;

/// A profile with `name` and `amount` items, `姓名` a synonym of `name`.
#[must_use]
pub fn sample_profile(id: i64) -> Arc<ProfileSnapshot> {
    Arc::new(ProfileSnapshot::new(
        ProfileInfo {
            id,
            name: format!("profile-{id}"),
            description: None,
            is_default: id == 1,
        },
        vec![
            InfoItem::new("name", 1).with_describe("同义词：\"姓名\""),
            InfoItem::new("amount", 2),
        ],
        Vec::new(),
    ))
}

/// A stage context builder.
pub struct TestContext {
    task_id: String,
    token: Arc<CancellationToken>,
    profile: Arc<ProfileSnapshot>,
    inputs: Vec<Artifact>,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for TestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestContext")
            .field("task_id", &self.task_id)
            .field("profile_id", &self.profile.profile_id())
            .field("inputs", &self.inputs.len())
            .finish_non_exhaustive()
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self {
            task_id: "test-task".to_string(),
            token: Arc::new(CancellationToken::new()),
            profile: sample_profile(1),
            inputs: Vec::new(),
            events: Arc::new(NoOpEventSink),
        }
    }
}

impl TestContext {
    /// Creates a new test context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the task id.
    #[must_use]
    pub fn with_task_id(mut self, id: impl Into<String>) -> Self {
        self.task_id = id.into();
        self
    }

    /// Shares a cancellation token.
    #[must_use]
    pub fn with_token(mut self, token: Arc<CancellationToken>) -> Self {
        self.token = token;
        self
    }

    /// Sets the profile snapshot.
    #[must_use]
    pub fn with_profile(mut self, profile: Arc<ProfileSnapshot>) -> Self {
        self.profile = profile;
        self
    }

    /// Adds an input artifact.
    #[must_use]
    pub fn with_input(mut self, artifact: Artifact) -> Self {
        self.inputs.push(artifact);
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Builds a [`StageContext`].
    #[must_use]
    pub fn build(self) -> StageContext {
        StageContext::new(self.task_id, self.token, self.profile)
            .with_inputs(self.inputs)
            .with_events(self.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ArtifactKind;

    #[test]
    fn test_context_builder() {
        let token = Arc::new(CancellationToken::new());
        let ctx = TestContext::new()
            .with_task_id("t9")
            .with_token(token.clone())
            .with_profile(sample_profile(2))
            .with_input(Artifact::file(ArtifactKind::Text, "s", "a.txt"))
            .build();

        assert_eq!(ctx.task_id(), "t9");
        assert_eq!(ctx.profile().profile_id(), 2);
        assert_eq!(ctx.inputs().len(), 1);
        token.cancel("stop");
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn test_sample_profile_synonyms() {
        let profile = sample_profile(1);
        assert_eq!(profile.labels(), vec!["name", "amount"]);
        assert_eq!(profile.info_items[0].synonyms(), vec!["姓名"]);
    }
}
