//! The task control surface: submit, status, cancel.

use super::{CancelOutcome, Task, TaskEvent, TaskRegistry, TaskSnapshot};
use crate::config::{EngineConfig, WorkingArea};
use crate::core::TaskStatus;
use crate::errors::DocflowError;
use crate::events::{names, EventSink, NoOpEventSink};
use crate::pipeline::{LineKind, Pipeline, PipelineDefinition, RunOutcome};
use crate::profile::ProfileStore;
use crate::stages::{StageContext, StageFactory};
use futures::StreamExt;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, Instrument};

/// Accepts pipeline definitions and drives each one as a [`Task`] on its
/// own tokio task.
///
/// The profile is snapshotted when a task starts; switching profiles
/// mid-run does not affect running tasks.
pub struct TaskManager {
    registry: Arc<TaskRegistry>,
    factory: StageFactory,
    profiles: Arc<dyn ProfileStore>,
    area: WorkingArea,
    capacity: usize,
    events: Arc<dyn EventSink>,
    clean_processing: bool,
}

impl fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskManager")
            .field("registry", &self.registry)
            .field("factory", &self.factory)
            .field("area", &self.area)
            .field("capacity", &self.capacity)
            .field("clean_processing", &self.clean_processing)
            .finish_non_exhaustive()
    }
}

impl TaskManager {
    /// Creates a manager over the configured working area.
    #[must_use]
    pub fn new(config: &EngineConfig, factory: StageFactory, profiles: Arc<dyn ProfileStore>) -> Self {
        Self {
            registry: Arc::new(TaskRegistry::new(config.task_retention())),
            factory,
            profiles,
            area: config.working_area(),
            capacity: config.channel_capacity.max(1),
            events: Arc::new(NoOpEventSink),
            clean_processing: true,
        }
    }

    /// Sets the event sink shared by every stage of every task.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Whether `processing/` is emptied before each run. On by default.
    ///
    /// Turn it off when tasks run concurrently over one working area.
    #[must_use]
    pub fn with_clean_processing(mut self, clean: bool) -> Self {
        self.clean_processing = clean;
        self
    }

    /// The working area tasks run in.
    #[must_use]
    pub fn area(&self) -> &WorkingArea {
        &self.area
    }

    /// The stage factory.
    #[must_use]
    pub fn factory(&self) -> &StageFactory {
        &self.factory
    }

    /// The task registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Validates and starts a pipeline definition; returns the task id.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit(&self, definition: &PipelineDefinition) -> Result<String, DocflowError> {
        let pipeline = definition.build(&self.factory, &self.area, self.capacity)?;
        Ok(self.submit_pipeline(pipeline, definition.files.clone().unwrap_or_default()))
    }

    /// Starts an already built pipeline; returns the task id.
    pub fn submit_pipeline(&self, pipeline: Pipeline, files: Vec<String>) -> String {
        let task = Arc::new(Task::new(pipeline.name(), files));
        self.registry.register(&task);
        let id = task.id().to_string();
        info!(task_id = %id, pipeline = %pipeline.name(), "Task submitted");

        let driver = Driver {
            registry: Arc::clone(&self.registry),
            profiles: Arc::clone(&self.profiles),
            area: self.area.clone(),
            events: Arc::clone(&self.events),
            clean_processing: self.clean_processing,
        };
        let span = tracing::info_span!("task", task_id = %id);
        tokio::spawn(driver.drive(task, pipeline).instrument(span));
        id
    }

    /// Reads a task's state.
    pub fn get_status(&self, id: &str) -> Result<TaskSnapshot, DocflowError> {
        self.registry
            .snapshot(id)
            .ok_or_else(|| DocflowError::TaskNotFound(id.to_string()))
    }

    /// Sets the task's cancellation signal and returns immediately.
    ///
    /// Unknown and finished ids are reported, never raised.
    pub fn request_cancel(&self, id: &str) -> CancelOutcome {
        self.registry.request_cancel(id, "cancel requested")
    }

    /// Receives the later events of a live task.
    #[must_use]
    pub fn subscribe(&self, id: &str) -> Option<broadcast::Receiver<TaskEvent>> {
        self.registry.get(id).map(|task| task.subscribe())
    }

    /// Waits for a task to settle and returns its final state.
    pub async fn wait(&self, id: &str) -> Result<TaskSnapshot, DocflowError> {
        if let Some(task) = self.registry.get(id) {
            task.wait().await;
        }
        self.get_status(id)
    }

    /// Drops a finished task's snapshot early.
    pub fn acknowledge(&self, id: &str) -> bool {
        self.registry.acknowledge(id)
    }

    /// All known tasks, newest first.
    #[must_use]
    pub fn list(&self) -> Vec<TaskSnapshot> {
        self.registry.list()
    }
}

struct Driver {
    registry: Arc<TaskRegistry>,
    profiles: Arc<dyn ProfileStore>,
    area: WorkingArea,
    events: Arc<dyn EventSink>,
    clean_processing: bool,
}

impl Driver {
    async fn drive(self, task: Arc<Task>, pipeline: Pipeline) {
        let profile = self.profiles.snapshot();

        if task.token().is_cancelled() {
            task.transition(TaskStatus::Cancelled, None);
            return self.settle(&task);
        }
        if let Err(err) = self.prepare().await {
            error!(task_id = %task.id(), error = %err, "Working area unavailable");
            task.transition(TaskStatus::Failed, Some(format!("working area unavailable: {err}")));
            return self.settle(&task);
        }

        task.transition(TaskStatus::Running, None);
        self.emit_status(&task);
        let ctx = StageContext::new(task.id(), Arc::clone(task.token()), profile)
            .with_events(Arc::clone(&self.events));

        let mut lines = pipeline.run(ctx);
        let mut fatal = None;
        while let Some(line) = lines.next().await {
            if line.kind == LineKind::Fatal {
                fatal = Some(line.text.clone());
            }
            task.record_line(&line);
        }
        let ended = lines.outcome().unwrap_or(RunOutcome::Cancelled);
        task.finish(ended, fatal);
        self.settle(&task);
    }

    async fn prepare(&self) -> std::io::Result<()> {
        self.area.prepare().await?;
        if self.clean_processing {
            self.area.clean_processing().await?;
        }
        Ok(())
    }

    fn settle(&self, task: &Task) {
        self.emit_status(task);
        self.registry.complete(task);
    }

    fn emit_status(&self, task: &Task) {
        self.events.try_emit(
            names::TASK_STATUS,
            Some(serde_json::json!({"task_id": task.id(), "status": task.status()})),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use crate::pipeline::PipelineBuilder;
    use crate::profile::{InMemoryProfileStore, InfoItem, ProfileDocument};
    use crate::stages::Stage;
    use crate::testing::{FailingStage, RecordingStage, ScriptedStage};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn manager(dir: &tempfile::TempDir) -> TaskManager {
        let config = EngineConfig::new().with_work_dir(dir.path());
        TaskManager::new(&config, StageFactory::default(), Arc::new(InMemoryProfileStore::new()))
    }

    fn pipeline(stages: Vec<Arc<dyn Stage>>) -> Pipeline {
        let mut builder = PipelineBuilder::new("test");
        for stage in stages {
            builder.add_stage(stage).unwrap();
        }
        builder.build().unwrap()
    }

    fn slow_stage(name: &str) -> ScriptedStage {
        let mut stage = ScriptedStage::new(name);
        for i in 0..40 {
            stage = stage.sleeps(Duration::from_millis(5)).emits(format!("f{i}"));
        }
        stage
    }

    #[tokio::test]
    async fn test_two_stage_run_completes_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);
        let recorder = Arc::new(RecordingStage::new("b"));
        let id = manager.submit_pipeline(
            pipeline(vec![
                Arc::new(ScriptedStage::new("a").emits("f1").emits("f2").emits("f3")),
                recorder.clone(),
            ]),
            Vec::new(),
        );

        let snapshot = manager.wait(&id).await.unwrap();
        assert_eq!(snapshot.status, TaskStatus::Completed);
        assert_eq!(recorder.observed(), vec!["f1", "f2", "f3"]);
        assert_eq!(snapshot.progress, 100);
        assert_eq!(snapshot.log.len(), 6);
        assert!(snapshot.started_at.is_some());
        assert!(snapshot.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_cancel_right_after_submit() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);
        let export = Arc::new(RecordingStage::new("export"));
        let id = manager.submit_pipeline(pipeline(vec![Arc::new(slow_stage("a")), export.clone()]), Vec::new());

        assert_eq!(manager.request_cancel(&id), CancelOutcome::Requested);
        let snapshot = manager.wait(&id).await.unwrap();

        assert_eq!(snapshot.status, TaskStatus::Cancelled);
        assert_eq!(snapshot.error_detail, None);
        assert!(export.observed().is_empty());
    }

    #[tokio::test]
    async fn test_mid_run_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);
        let next = Arc::new(ScriptedStage::new("next").emits("never"));
        let id = manager.submit_pipeline(pipeline(vec![Arc::new(slow_stage("a")), next.clone()]), Vec::new());

        let mut events = manager.subscribe(&id).unwrap();
        loop {
            if let TaskEvent::Line { .. } = events.recv().await.unwrap() {
                break;
            }
        }
        assert_eq!(manager.request_cancel(&id), CancelOutcome::Requested);
        let snapshot = manager.wait(&id).await.unwrap();

        assert_eq!(snapshot.status, TaskStatus::Cancelled);
        assert!(snapshot.log.len() < 40);
        assert_eq!(next.run_count(), 0);

        let settled = snapshot.log.len();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(manager.get_status(&id).unwrap().log.len(), settled);
    }

    #[tokio::test]
    async fn test_item_failure_still_completes() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);
        let recorder = Arc::new(RecordingStage::new("b"));
        let id = manager.submit_pipeline(
            pipeline(vec![
                Arc::new(ScriptedStage::new("a").emits("f1").emits("f2").item_error("f3", "unreadable")),
                recorder.clone(),
            ]),
            Vec::new(),
        );

        let snapshot = manager.wait(&id).await.unwrap();
        assert_eq!(snapshot.status, TaskStatus::Completed);
        assert_eq!(recorder.observed(), vec!["f1", "f2"]);
        let errors: Vec<&String> = snapshot.log.iter().filter(|l| l.contains("error")).collect();
        assert_eq!(errors, vec!["[a] error: f3: unreadable"]);
    }

    #[tokio::test]
    async fn test_fatal_stage_fails_task() {
        let dir = tempfile::tempdir().unwrap();
        let events = Arc::new(CollectingEventSink::new());
        let manager = manager(&dir).with_events(events.clone());
        let id = manager.submit_pipeline(
            pipeline(vec![Arc::new(FailingStage::new("a", "model unreachable"))]),
            Vec::new(),
        );

        let snapshot = manager.wait(&id).await.unwrap();
        assert_eq!(snapshot.status, TaskStatus::Failed);
        assert!(snapshot.error_detail.unwrap().contains("model unreachable"));
        assert_eq!(events.count(names::TASK_STATUS), 2);

        // Terminal statuses are absorbing.
        assert_eq!(manager.request_cancel(&id), CancelOutcome::AlreadyFinished);
        assert_eq!(manager.get_status(&id).unwrap().status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_panicking_stage_fails_task() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);
        let after = Arc::new(ScriptedStage::new("after").emits("never"));
        let id = manager.submit_pipeline(
            pipeline(vec![
                Arc::new(ScriptedStage::new("a").emits("f1").panics("index out of bounds")),
                after.clone(),
            ]),
            Vec::new(),
        );

        let snapshot = manager.wait(&id).await.unwrap();
        assert_eq!(snapshot.status, TaskStatus::Failed);
        let detail = snapshot.error_detail.unwrap();
        assert!(detail.contains("stage panicked: index out of bounds"), "{detail}");
        assert_eq!(after.run_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_task() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);
        assert_eq!(manager.request_cancel("missing"), CancelOutcome::NotFound);
        assert!(matches!(manager.get_status("missing"), Err(DocflowError::TaskNotFound(_))));
        assert!(manager.subscribe("missing").is_none());
    }

    #[tokio::test]
    async fn test_invalid_definition_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);
        let err = manager.submit(&PipelineDefinition::new("empty", Vec::new())).unwrap_err();
        assert!(matches!(err, DocflowError::Validation(_)));
        assert!(manager.list().is_empty());
    }

    #[tokio::test]
    async fn test_standard_pipeline_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let profiles = Arc::new(InMemoryProfileStore::with_default(ProfileDocument {
            name: "staff".to_string(),
            info_items: vec![InfoItem::new("name", 1), InfoItem::new("amount", 2)],
            ..Default::default()
        }));
        let config = EngineConfig::new().with_work_dir(dir.path());
        let manager = TaskManager::new(&config, StageFactory::default(), profiles.clone());
        manager.area().prepare().await.unwrap();
        std::fs::write(
            manager.area().source().join("staff.csv"),
            "name,amount\r\nAlice,10\r\nBob,20\r\n",
        )
        .unwrap();

        let id = manager.submit(&PipelineDefinition::standard()).unwrap();
        let snapshot = manager.wait(&id).await.unwrap();

        assert_eq!(snapshot.status, TaskStatus::Completed);
        assert_eq!(snapshot.result_files, vec!["staff_formatted.csv"]);
        let exported =
            std::fs::read_to_string(manager.area().destination().join("staff_formatted.csv")).unwrap();
        assert!(exported.starts_with("name,amount"));
        assert!(exported.contains("Alice,10"));
        assert!(exported.contains("Bob,20"));
    }

    #[tokio::test]
    async fn test_profile_switch_misses_cache() {
        let dir = tempfile::tempdir().unwrap();
        let doc = |name: &str| ProfileDocument {
            name: name.to_string(),
            info_items: vec![InfoItem::new("name", 1), InfoItem::new("amount", 2)],
            ..Default::default()
        };
        let profiles = Arc::new(InMemoryProfileStore::with_default(doc("one")));
        let second = profiles.import(doc("two")).unwrap();
        let config = EngineConfig::new().with_work_dir(dir.path());
        let manager = TaskManager::new(&config, StageFactory::default(), profiles.clone());
        manager.area().prepare().await.unwrap();
        std::fs::write(manager.area().source().join("t.csv"), "name,amount\nA,1\n").unwrap();

        let first = manager.submit(&PipelineDefinition::standard()).unwrap();
        manager.wait(&first).await.unwrap();
        let again = manager.submit(&PipelineDefinition::standard()).unwrap();
        manager.wait(&again).await.unwrap();
        assert_eq!(manager.factory().resolver().stats().derivations, 1);
        assert_eq!(manager.factory().resolver().stats().hits, 1);

        profiles.switch_profile(second.id).unwrap();
        let other = manager.submit(&PipelineDefinition::standard()).unwrap();
        assert_eq!(manager.wait(&other).await.unwrap().status, TaskStatus::Completed);
        assert_eq!(manager.factory().resolver().stats().derivations, 2);
    }

    #[tokio::test]
    async fn test_list_and_acknowledge() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);
        let id = manager.submit_pipeline(pipeline(vec![Arc::new(ScriptedStage::new("a"))]), vec!["x".into()]);
        manager.wait(&id).await.unwrap();

        let listed = manager.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].files, vec!["x"]);
        assert!(manager.acknowledge(&id));
        assert!(manager.list().is_empty());
    }
}
