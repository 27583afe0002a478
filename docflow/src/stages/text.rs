//! Text extraction: plain text to records.

use super::{item_error, write_records, Emitter, Record, Stage, StageContext, StageOutcome, StageStop};
use crate::config::WorkingArea;
use crate::core::{Artifact, ArtifactKind, StageKind};
use crate::errors::ModelError;
use crate::mapping::canonicalize_header;
use crate::profile::ProfileSnapshot;
use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Pulls information-item records out of free text.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TextExtractor: Send + Sync + std::fmt::Debug {
    /// Returns the records found in `text`, keyed by item label.
    async fn extract(&self, profile: &ProfileSnapshot, text: &str) -> Result<Vec<Record>, ModelError>;
}

/// Reads `label: value` lines.
///
/// A line matches an information item when its key equals the item's
/// label or one of its synonyms after header canonicalization. Seeing an
/// item a second time starts a new record.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyValueTextExtractor;

impl KeyValueTextExtractor {
    /// Creates the extractor.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn keys(profile: &ProfileSnapshot) -> Vec<(String, String)> {
        let mut keys = Vec::new();
        for item in &profile.info_items {
            keys.push((canonicalize_header(&item.label), item.label.clone()));
            for synonym in item.synonyms() {
                keys.push((canonicalize_header(&synonym), item.label.clone()));
            }
        }
        keys
    }
}

#[async_trait]
impl TextExtractor for KeyValueTextExtractor {
    async fn extract(&self, profile: &ProfileSnapshot, text: &str) -> Result<Vec<Record>, ModelError> {
        let keys = Self::keys(profile);
        let mut records = Vec::new();
        let mut current = Record::new();

        for line in text.lines() {
            let Some((key, value)) = line.split_once([':', '：']) else {
                continue;
            };
            let key = canonicalize_header(key);
            let value = value.trim();
            let Some((_, label)) = keys.iter().find(|(k, _)| *k == key) else {
                continue;
            };
            if value.is_empty() {
                continue;
            }
            if current.contains_key(label) {
                records.push(std::mem::take(&mut current));
            }
            current.insert(label.clone(), Value::String(value.to_string()));
        }
        if !current.is_empty() {
            records.push(current);
        }
        Ok(records)
    }
}

#[cfg(feature = "llm")]
pub use chat::ChatTextExtractor;

#[cfg(feature = "llm")]
mod chat {
    use super::{Record, TextExtractor};
    use crate::errors::ModelError;
    use crate::llm::ChatClient;
    use crate::mapping::sql::strip_code_fence;
    use crate::profile::ProfileSnapshot;
    use async_trait::async_trait;
    use serde_json::Value;

    const INSTRUCTIONS: &str = "Extract the requested information items from the document. \
        Reply with a JSON array of objects keyed by item name, one object per person or entity. \
        Use exact text from the document. Omit items that are not present.";

    /// Asks a chat model for the records.
    #[derive(Debug, Clone)]
    pub struct ChatTextExtractor {
        client: ChatClient,
    }

    impl ChatTextExtractor {
        /// Creates an extractor over a chat client.
        #[must_use]
        pub fn new(client: ChatClient) -> Self {
            Self { client }
        }

        fn prompt(profile: &ProfileSnapshot, text: &str) -> String {
            let mut prompt = profile.item_prompt();
            if !profile.examples.is_empty() {
                prompt.push_str("\n\n# Examples:\n");
                for example in &profile.examples {
                    prompt.push_str(&example.fragment);
                    prompt.push('\n');
                }
            }
            prompt.push_str("\n# Document:\n");
            prompt.push_str(text);
            prompt
        }
    }

    #[async_trait]
    impl TextExtractor for ChatTextExtractor {
        async fn extract(&self, profile: &ProfileSnapshot, text: &str) -> Result<Vec<Record>, ModelError> {
            let reply = self.client.complete(INSTRUCTIONS, &Self::prompt(profile, text)).await?;
            let value: Value = serde_json::from_str(strip_code_fence(&reply))
                .map_err(|e| ModelError::Response(format!("reply is not JSON: {e}")))?;
            match value {
                Value::Array(items) => Ok(items
                    .into_iter()
                    .filter_map(|item| match item {
                        Value::Object(map) => Some(map),
                        _ => None,
                    })
                    .collect()),
                Value::Object(map) => Ok(vec![map]),
                _ => Err(ModelError::Response("reply is not an array of objects".to_string())),
            }
        }
    }
}

/// Runs a [`TextExtractor`] over the text artifacts of earlier stages and
/// writes `processing/<stem>.records.json`.
#[derive(Debug, Clone)]
pub struct TextExtractStage {
    name: String,
    area: WorkingArea,
    extractor: Arc<dyn TextExtractor>,
    timeout: Duration,
}

impl TextExtractStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(area: WorkingArea, extractor: Arc<dyn TextExtractor>, timeout: Duration) -> Self {
        Self {
            name: "text_extract".to_string(),
            area,
            extractor,
            timeout,
        }
    }
}

#[async_trait]
impl Stage for TextExtractStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Extractor
    }

    fn accepts(&self, artifact: &Artifact) -> bool {
        artifact.kind == ArtifactKind::Text
    }

    async fn produce(&self, ctx: &StageContext, out: &Emitter) -> StageOutcome {
        let inputs: Vec<&Artifact> = ctx.inputs().iter().filter(|a| self.accepts(a)).collect();
        info!(task_id = %ctx.task_id(), count = inputs.len(), "Extracting from text");

        for artifact in inputs {
            ctx.checkpoint()?;
            let Some(path) = artifact.path() else { continue };
            let text = match tokio::fs::read_to_string(path).await {
                Ok(text) => text,
                Err(e) => {
                    item_error(out, &self.name, &artifact.name, e).await?;
                    continue;
                }
            };

            let call = tokio::time::timeout(self.timeout, self.extractor.extract(ctx.profile(), &text));
            let records = tokio::select! {
                biased;
                // A reply that lands after cancellation is dropped with the call.
                () = ctx.token().cancelled() => return Err(StageStop::Stopped),
                result = call => result,
            };
            let records = match records {
                Ok(Ok(records)) => records,
                Ok(Err(e)) => {
                    warn!(file = %artifact.name, error = %e, "Extraction failed");
                    item_error(out, &self.name, &artifact.name, e).await?;
                    continue;
                }
                Err(_) => {
                    let e = ModelError::Timeout(self.timeout.as_secs_f64());
                    warn!(file = %artifact.name, error = %e, "Extraction timed out");
                    item_error(out, &self.name, &artifact.name, e).await?;
                    continue;
                }
            };

            let target = self.area.processing().join(format!("{}.records.json", artifact.stem()));
            if let Err(e) = write_records(&target, &records).await {
                item_error(out, &self.name, &artifact.name, e).await?;
                continue;
            }
            debug!(file = %artifact.name, records = records.len(), "Extracted records");
            out.emit(
                Artifact::file(ArtifactKind::Records, &self.name, target)
                    .with_count(records.len())
                    .with_metadata("source", Value::String(source_name(path))),
            )
            .await?;
        }
        Ok(())
    }
}

fn source_name(path: &Path) -> String {
    path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
}
