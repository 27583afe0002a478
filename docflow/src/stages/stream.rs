//! Lazy result sequences backed by a bounded channel.

use super::{Stage, StageContext, StageStop};
use crate::cancellation::CancellationToken;
use crate::core::StageResult;
use crate::errors::StageError;
use futures::{FutureExt, Stream};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// The producer half handed to a stage body.
///
/// `emit` waits while the consumer is behind (backpressure) and fails
/// with [`StageStop::Stopped`] once the run is cancelled or the consumer
/// is gone.
#[derive(Debug, Clone)]
pub struct Emitter {
    tx: mpsc::Sender<StageResult>,
    token: Arc<CancellationToken>,
}

impl Emitter {
    /// Sends one result downstream.
    pub async fn emit(&self, result: impl Into<StageResult> + Send) -> Result<(), StageStop> {
        if self.token.is_cancelled() {
            return Err(StageStop::Stopped);
        }
        let result = result.into();
        tokio::select! {
            biased;
            () = self.token.cancelled() => Err(StageStop::Stopped),
            sent = self.tx.send(result) => sent.map_err(|_| StageStop::Stopped),
        }
    }

    /// Sends a progress line.
    pub async fn progress(&self, line: impl Into<String> + Send) -> Result<(), StageStop> {
        self.emit(StageResult::progress(line)).await
    }
}

/// The consumer half: a fused, cancellation-aware stream of results.
///
/// Once the token is set the stream yields `None` without polling the
/// channel again, so nothing emitted after cancellation is observed.
/// Dropping the stream aborts the stage body.
#[derive(Debug)]
pub struct ResultStream {
    rx: mpsc::Receiver<StageResult>,
    token: Arc<CancellationToken>,
    handle: Option<JoinHandle<()>>,
    done: bool,
}

impl ResultStream {
    /// Returns true once the stream has ended.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.done
    }
}

impl Stream for ResultStream {
    type Item = StageResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        if self.token.is_cancelled() {
            self.done = true;
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

impl futures::stream::FusedStream for ResultStream {
    fn is_terminated(&self) -> bool {
        self.done
    }
}

impl Drop for ResultStream {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Starts a stage body and returns its lazy result sequence.
///
/// The body runs on its own task, writing into a channel of `capacity`
/// slots. A fatal error or a panic becomes exactly one `Error` result,
/// then the sequence ends. Cancellation drops the body at its next await point.
#[must_use]
pub fn stage_stream(stage: Arc<dyn Stage>, ctx: StageContext, capacity: usize) -> ResultStream {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let token = Arc::clone(ctx.token());
    let emitter = Emitter {
        tx: tx.clone(),
        token: Arc::clone(&token),
    };

    let body_token = Arc::clone(&token);
    let handle = tokio::spawn(async move {
        let name = stage.name().to_string();
        let body = AssertUnwindSafe(stage.produce(&ctx, &emitter)).catch_unwind();
        let outcome = tokio::select! {
            biased;
            () = body_token.cancelled() => Err(StageStop::Stopped),
            caught = body => caught.unwrap_or_else(|payload| {
                Err(StageError::fatal(&name, format!("stage panicked: {}", panic_message(&*payload))).into())
            }),
        };
        match outcome {
            Ok(()) => debug!(stage = %name, task_id = %ctx.task_id(), "Stage body finished"),
            Err(StageStop::Stopped) => {
                debug!(stage = %name, task_id = %ctx.task_id(), "Stage body stopped");
            }
            Err(StageStop::Fatal(mut err)) => {
                warn!(stage = %name, task_id = %ctx.task_id(), error = %err, "Stage failed");
                err.severity = crate::errors::Severity::Fatal;
                if !body_token.is_cancelled() {
                    let _ = tx.send(StageResult::Error(err)).await;
                }
            }
        }
    });

    ResultStream {
        rx,
        token,
        handle: Some(handle),
        done: false,
    }
}
