//! Subscriber setup and span helpers.

use crate::config::LoggingConfig;
use crate::core::StageKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

/// Installs the global `tracing` subscriber.
///
/// Output goes to stderr so stdout stays free for relayed log lines.
/// Returns false when a subscriber was already installed or the filter is
/// invalid; the fallback filter `docflow=info` is used in the latter case.
pub fn init_tracing(config: &LoggingConfig) -> bool {
    let (filter, valid) = match EnvFilter::try_new(&config.filter) {
        Ok(filter) => (filter, true),
        Err(_) => (EnvFilter::new("docflow=info"), false),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    let installed = if config.json {
        builder.json().try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    };

    if !valid {
        tracing::warn!(filter = %config.filter, "Invalid log filter, using default");
    }
    installed && valid
}

/// Span attributes for one stage run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageSpanAttributes {
    /// Stage name.
    pub stage_name: String,
    /// Stage kind.
    pub stage_kind: Option<StageKind>,
    /// Owning task.
    pub task_id: Option<String>,
    /// Final status.
    pub status: Option<String>,
    /// Duration in milliseconds.
    pub duration_ms: Option<f64>,
    /// Number of results emitted.
    pub emitted: usize,
}

impl StageSpanAttributes {
    /// Creates attributes for a stage.
    #[must_use]
    pub fn new(stage_name: impl Into<String>) -> Self {
        Self {
            stage_name: stage_name.into(),
            ..Default::default()
        }
    }

    /// Sets the stage kind.
    #[must_use]
    pub fn with_kind(mut self, kind: StageKind) -> Self {
        self.stage_kind = Some(kind);
        self
    }

    /// Sets the owning task.
    #[must_use]
    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    /// Sets the final status.
    #[must_use]
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    /// Sets the duration.
    #[must_use]
    pub fn with_duration_ms(mut self, duration_ms: f64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Sets the emitted result count.
    #[must_use]
    pub fn with_emitted(mut self, emitted: usize) -> Self {
        self.emitted = emitted;
        self
    }

    /// Flattens the attributes into dotted keys.
    #[must_use]
    pub fn to_attributes(&self) -> HashMap<String, String> {
        let mut attrs = HashMap::new();
        attrs.insert("stage.name".to_string(), self.stage_name.clone());
        attrs.insert("stage.emitted".to_string(), self.emitted.to_string());
        if let Some(kind) = self.stage_kind {
            attrs.insert("stage.kind".to_string(), kind.to_string());
        }
        if let Some(ref v) = self.task_id {
            attrs.insert("task.id".to_string(), v.clone());
        }
        if let Some(ref v) = self.status {
            attrs.insert("stage.status".to_string(), v.clone());
        }
        if let Some(v) = self.duration_ms {
            attrs.insert("stage.duration_ms".to_string(), format!("{v:.2}"));
        }
        attrs
    }

    /// Converts to an event payload.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Simple span timing helper.
#[derive(Debug)]
pub struct SpanTimer {
    start: Instant,
    name: String,
}

impl SpanTimer {
    /// Starts a new span timer.
    #[must_use]
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            name: name.into(),
        }
    }

    /// Returns the elapsed time in milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    /// Returns the span name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Finishes the span and returns the duration.
    #[must_use]
    pub fn finish(self) -> f64 {
        self.elapsed_ms()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_span_attributes() {
        let attrs = StageSpanAttributes::new("table_reader")
            .with_kind(StageKind::Reader)
            .with_task_id("t-1")
            .with_status("completed")
            .with_duration_ms(123.456)
            .with_emitted(4);

        let flat = attrs.to_attributes();
        assert_eq!(flat.get("stage.name"), Some(&"table_reader".to_string()));
        assert_eq!(flat.get("stage.kind"), Some(&"reader".to_string()));
        assert_eq!(flat.get("stage.duration_ms"), Some(&"123.46".to_string()));
        assert_eq!(flat.get("stage.emitted"), Some(&"4".to_string()));
        assert_eq!(attrs.to_json()["stage_kind"], "reader");
    }

    #[test]
    fn test_span_timer() {
        let timer = SpanTimer::start("test_span");
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert_eq!(timer.name(), "test_span");
        let duration = timer.finish();
        assert!(duration >= 10.0);
    }

    #[test]
    fn test_init_tracing_twice() {
        let config = LoggingConfig::default();
        let _ = init_tracing(&config);
        assert!(!init_tracing(&config));
    }
}
