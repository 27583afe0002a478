//! Sequential pipeline execution.

use crate::core::{Artifact, StageResult};
use crate::errors::StageError;
use crate::events::names;
use crate::observability::{SpanTimer, StageSpanAttributes};
use crate::stages::{stage_stream, Stage, StageContext};
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What a relayed line reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineKind {
    /// A status line.
    Progress,
    /// A produced artifact.
    Artifact,
    /// A per-item error.
    Error,
    /// The fatal error that ended the run.
    Fatal,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    /// Every stage drained.
    Completed,
    /// A stage yielded a fatal error.
    Failed,
    /// The cancellation signal stopped the run.
    Cancelled,
}

/// One line of a run's log, with the result it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    /// What the line reports.
    pub kind: LineKind,
    /// The stage that produced it.
    pub stage: String,
    /// The rendered text.
    pub text: String,
    /// The artifact, for artifact lines.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Artifact>,
    /// The error, for error and fatal lines.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StageError>,
}

impl LogLine {
    pub(crate) fn from_result(stage: &str, result: StageResult) -> Self {
        let text = result.to_line();
        match result {
            StageResult::Progress(_) => Self {
                kind: LineKind::Progress,
                stage: stage.to_string(),
                text,
                artifact: None,
                error: None,
            },
            StageResult::Artifact(artifact) => Self {
                kind: LineKind::Artifact,
                stage: stage.to_string(),
                text,
                artifact: Some(artifact),
                error: None,
            },
            StageResult::Error(err) => Self {
                kind: if err.is_fatal() { LineKind::Fatal } else { LineKind::Error },
                stage: stage.to_string(),
                text,
                artifact: None,
                error: Some(err),
            },
        }
    }
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// An ordered list of stages run one after another.
///
/// Stage *i + 1* starts only after stage *i* is fully drained and sees the
/// artifacts of every earlier stage that it accepts.
#[derive(Debug, Clone)]
pub struct Pipeline {
    name: String,
    stages: Vec<Arc<dyn Stage>>,
    capacity: usize,
}

impl Pipeline {
    pub(super) fn new(name: String, stages: Vec<Arc<dyn Stage>>, capacity: usize) -> Self {
        Self { name, stages, capacity }
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the stage names in run order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Starts the run and returns its lazy line sequence.
    ///
    /// `ctx` supplies the task id, cancellation token, profile snapshot and
    /// event sink shared by every stage. The token is tested before each
    /// stage; once set the sequence ends without an error. A fatal stage
    /// error is yielded as a [`LineKind::Fatal`] line and ends the run.
    /// Dropping the sequence stops the run.
    #[must_use]
    pub fn run(&self, ctx: StageContext) -> LineStream {
        let (tx, rx) = mpsc::channel(self.capacity);
        let token = Arc::clone(ctx.token());
        let stages = self.stages.clone();
        let capacity = self.capacity;
        let name = self.name.clone();
        let ended = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&ended);

        let handle = tokio::spawn(async move {
            // The sender outlives the store so a closed channel always
            // finds the outcome recorded.
            let outcome = drive(name, stages, ctx, capacity, &tx).await;
            *slot.lock() = Some(outcome);
            drop(tx);
        });

        LineStream {
            rx,
            token,
            handle: Some(handle),
            ended,
            done: false,
            cut_short: false,
        }
    }
}

async fn drive(
    name: String,
    stages: Vec<Arc<dyn Stage>>,
    ctx: StageContext,
    capacity: usize,
    tx: &mpsc::Sender<LogLine>,
) -> RunOutcome {
    let task_id = ctx.task_id().to_string();
    let mut produced: Vec<Artifact> = Vec::new();
    info!(task_id = %task_id, pipeline = %name, stages = stages.len(), "Pipeline started");

    for stage in stages {
        if ctx.is_cancelled() {
            debug!(task_id = %task_id, stage = %stage.name(), "Cancelled before stage");
            return RunOutcome::Cancelled;
        }

        let stage_name = stage.name().to_string();
        let inputs: Vec<Artifact> = produced.iter().filter(|a| stage.accepts(a)).cloned().collect();
        ctx.events().try_emit(
            names::STAGE_STARTED,
            Some(serde_json::json!({"task_id": task_id, "stage": stage_name, "inputs": inputs.len()})),
        );

        let timer = SpanTimer::start(&stage_name);
        let kind = stage.kind();
        let mut stream = stage_stream(stage, ctx.clone().with_inputs(inputs), capacity);
        let mut emitted = 0;
        let mut failed = false;

        while let Some(result) = stream.next().await {
            emitted += 1;
            failed |= result.is_fatal();
            if let StageResult::Artifact(artifact) = &result {
                produced.push(artifact.clone());
            }
            if tx.send(LogLine::from_result(&stage_name, result)).await.is_err() {
                debug!(task_id = %task_id, stage = %stage_name, "Log consumer gone, stopping");
                return RunOutcome::Cancelled;
            }
        }

        let status = if failed {
            "failed"
        } else if ctx.is_cancelled() {
            "cancelled"
        } else {
            "completed"
        };
        let attributes = StageSpanAttributes::new(&stage_name)
            .with_kind(kind)
            .with_task_id(&task_id)
            .with_status(status)
            .with_duration_ms(timer.finish())
            .with_emitted(emitted);
        let event = match status {
            "failed" => names::STAGE_FAILED,
            "cancelled" => names::STAGE_CANCELLED,
            _ => names::STAGE_COMPLETED,
        };
        ctx.events().try_emit(event, Some(attributes.to_json()));

        match status {
            "failed" => {
                warn!(task_id = %task_id, stage = %stage_name, "Pipeline aborted by fatal stage error");
                return RunOutcome::Failed;
            }
            "cancelled" => return RunOutcome::Cancelled,
            _ => debug!(task_id = %task_id, stage = %stage_name, emitted, "Stage drained"),
        }
    }
    info!(task_id = %task_id, pipeline = %name, artifacts = produced.len(), "Pipeline finished");
    RunOutcome::Completed
}

/// The line sequence of a run.
///
/// Ends once the run finishes, aborts or is cancelled. While the run is
/// in progress nothing is yielded after the cancellation signal is set;
/// a run that already finished is drained in full. Dropping it stops
/// the run.
#[derive(Debug)]
pub struct LineStream {
    rx: mpsc::Receiver<LogLine>,
    token: Arc<crate::cancellation::CancellationToken>,
    handle: Option<JoinHandle<()>>,
    ended: Arc<Mutex<Option<RunOutcome>>>,
    done: bool,
    cut_short: bool,
}

impl LineStream {
    /// How the run ended, once the sequence has ended.
    ///
    /// A run whose driver died without recording an outcome counts as
    /// failed.
    #[must_use]
    pub fn outcome(&self) -> Option<RunOutcome> {
        if !self.done {
            return None;
        }
        if self.cut_short {
            return Some(RunOutcome::Cancelled);
        }
        Some(self.ended.lock().unwrap_or(RunOutcome::Failed))
    }

    fn finished_before_cancel(&self) -> bool {
        matches!(*self.ended.lock(), Some(RunOutcome::Completed | RunOutcome::Failed))
    }
}

impl Stream for LineStream {
    type Item = LogLine;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        if self.token.is_cancelled() && !self.finished_before_cancel() {
            self.done = true;
            self.cut_short = true;
            self.rx.close();
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

impl futures::stream::FusedStream for LineStream {
    fn is_terminated(&self) -> bool {
        self.done
    }
}

impl Drop for LineStream {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::CancellationToken;
    use crate::events::CollectingEventSink;
    use crate::pipeline::PipelineBuilder;
    use crate::testing::{FailingStage, RecordingStage, ScriptedStage, TestContext};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[tokio::test]
    async fn test_later_stage_sees_earlier_artifacts_in_order() {
        let recorder = Arc::new(RecordingStage::new("b"));
        let pipeline = PipelineBuilder::new("p")
            .stage(Arc::new(ScriptedStage::new("a").emits("f1").emits("f2").emits("f3")))
            .unwrap()
            .stage(recorder.clone())
            .unwrap()
            .build()
            .unwrap();

        let lines: Vec<String> = pipeline
            .run(TestContext::new().build())
            .map(|l| l.text)
            .collect()
            .await;

        assert_eq!(recorder.observed(), vec!["f1", "f2", "f3"]);
        assert_eq!(
            lines,
            vec![
                "[a] produced f1",
                "[a] produced f2",
                "[a] produced f3",
                "saw f1",
                "saw f2",
                "saw f3",
            ]
        );
    }

    #[tokio::test]
    async fn test_fatal_error_aborts_remaining_stages() {
        let after = Arc::new(ScriptedStage::new("after").emits("x"));
        let events = Arc::new(CollectingEventSink::new());
        let pipeline = PipelineBuilder::new("p")
            .stage(Arc::new(ScriptedStage::new("a").emits("f1")))
            .unwrap()
            .stage(Arc::new(FailingStage::new("bad", "model unreachable")))
            .unwrap()
            .stage(after.clone())
            .unwrap()
            .build()
            .unwrap();

        let lines: Vec<LogLine> = pipeline
            .run(TestContext::new().with_events(events.clone()).build())
            .collect()
            .await;

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].kind, LineKind::Fatal);
        assert_eq!(lines[1].error.as_ref().unwrap().message, "model unreachable");
        assert_eq!(after.run_count(), 0);
        assert_eq!(events.count(names::STAGE_FAILED), 1);
        assert_eq!(events.count(names::STAGE_STARTED), 2);
    }

    #[tokio::test]
    async fn test_item_errors_do_not_abort() {
        let pipeline = PipelineBuilder::new("p")
            .stage(Arc::new(ScriptedStage::new("a").emits("f1").item_error("f2", "bad").emits("f3")))
            .unwrap()
            .stage(Arc::new(ScriptedStage::new("b").emits("out")))
            .unwrap()
            .build()
            .unwrap();

        let kinds: Vec<LineKind> = pipeline
            .run(TestContext::new().build())
            .map(|l| l.kind)
            .collect()
            .await;
        assert_eq!(
            kinds,
            vec![LineKind::Artifact, LineKind::Error, LineKind::Artifact, LineKind::Artifact]
        );
    }

    #[tokio::test]
    async fn test_cancel_before_first_poll_runs_nothing() {
        let token = Arc::new(CancellationToken::new());
        let stage = Arc::new(ScriptedStage::new("a").emits("f1"));
        let pipeline = PipelineBuilder::new("p").stage(stage.clone()).unwrap().build().unwrap();

        let mut lines = pipeline.run(TestContext::new().with_token(token.clone()).build());
        token.cancel("user");

        assert!(lines.next().await.is_none());
    }

    #[tokio::test]
    async fn test_mid_run_cancel_stops_emissions() {
        let token = Arc::new(CancellationToken::new());
        let mut script = ScriptedStage::new("slow");
        for i in 0..50 {
            script = script.emits(format!("f{i}")).sleeps(Duration::from_millis(5));
        }
        let next = Arc::new(ScriptedStage::new("next").emits("never"));
        let pipeline = PipelineBuilder::new("p")
            .stage(Arc::new(script))
            .unwrap()
            .stage(next.clone())
            .unwrap()
            .build()
            .unwrap();

        let mut lines = pipeline.run(TestContext::new().with_token(token.clone()).build());
        assert_eq!(lines.next().await.unwrap().text, "[slow] produced f0");
        token.cancel("user");

        assert!(lines.next().await.is_none());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(next.run_count(), 0);
    }

    #[tokio::test]
    async fn test_outcome_reports_how_the_run_ended() {
        let pipeline = PipelineBuilder::new("p")
            .stage(Arc::new(ScriptedStage::new("a").emits("f1")))
            .unwrap()
            .build()
            .unwrap();
        let mut lines = pipeline.run(TestContext::new().build());
        assert_eq!(lines.outcome(), None);
        while lines.next().await.is_some() {}
        assert_eq!(lines.outcome(), Some(RunOutcome::Completed));

        let pipeline = PipelineBuilder::new("p")
            .stage(Arc::new(FailingStage::new("bad", "model unreachable")))
            .unwrap()
            .build()
            .unwrap();
        let mut lines = pipeline.run(TestContext::new().build());
        while lines.next().await.is_some() {}
        assert_eq!(lines.outcome(), Some(RunOutcome::Failed));
    }

    #[tokio::test]
    async fn test_cancel_after_run_finished_drains_everything() {
        let token = Arc::new(CancellationToken::new());
        let pipeline = PipelineBuilder::new("p")
            .stage(Arc::new(ScriptedStage::new("a").emits("f1").emits("f2")))
            .unwrap()
            .build()
            .unwrap();

        let mut lines = pipeline.run(TestContext::new().with_token(token.clone()).build());
        // Let the driver finish every stage before the signal arrives.
        while lines.ended.lock().is_none() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        token.cancel("user");

        let texts: Vec<String> = (&mut lines).map(|l| l.text).collect().await;
        assert_eq!(texts, vec!["[a] produced f1", "[a] produced f2"]);
        assert_eq!(lines.outcome(), Some(RunOutcome::Completed));
    }

    #[tokio::test]
    async fn test_mid_run_cancel_reports_cancelled() {
        let token = Arc::new(CancellationToken::new());
        let pipeline = PipelineBuilder::new("p")
            .stage(Arc::new(
                ScriptedStage::new("slow").emits("f0").sleeps(Duration::from_millis(200)).emits("f1"),
            ))
            .unwrap()
            .build()
            .unwrap();

        let mut lines = pipeline.run(TestContext::new().with_token(token.clone()).build());
        assert!(lines.next().await.is_some());
        token.cancel("user");
        assert!(lines.next().await.is_none());
        assert_eq!(lines.outcome(), Some(RunOutcome::Cancelled));
    }
}
