//! Stage trait and implementations.
//!
//! A stage is one step of an extraction run: it reads files from the
//! working area or the artifacts of earlier stages, does its work one
//! item at a time and emits a lazy sequence of [`StageResult`]s. Working
//! area locations are fixed when a stage is constructed; the per-run
//! pieces (cancellation, profile snapshot, inputs) arrive through the
//! [`StageContext`].

mod context;
mod export;
mod factory;
mod inputs;
mod mail;
mod mapping;
mod stream;
mod table;
mod text;

pub use context::StageContext;
pub use export::TabularExportStage;
pub use factory::{
    ExportConfig, MailReaderConfig, MappingExtractConfig, StageConfig, StageFactory,
    TableReaderConfig, TextExtractConfig,
};
pub use inputs::select_sources;
pub use mail::MailReaderStage;
pub use mapping::MappingExtractStage;
pub use stream::{stage_stream, Emitter, ResultStream};
pub use table::TableReaderStage;
#[cfg(feature = "llm")]
pub use text::ChatTextExtractor;
pub use text::{KeyValueTextExtractor, TextExtractStage, TextExtractor};

use crate::core::{Artifact, StageKind, StageResult};
use crate::errors::StageError;
use async_trait::async_trait;
use std::fmt::Debug;
use std::path::Path;

/// Why a stage body ended early.
#[derive(Debug, Clone, PartialEq)]
pub enum StageStop {
    /// Cancellation was observed or the consumer went away. Not an error.
    Stopped,
    /// A setup failure. Reported as exactly one `Error` result.
    Fatal(StageError),
}

impl From<StageError> for StageStop {
    fn from(err: StageError) -> Self {
        Self::Fatal(err)
    }
}

/// What a stage body returns.
pub type StageOutcome = Result<(), StageStop>;

/// Trait for pipeline stages.
///
/// Bodies emit through the [`Emitter`] as each unit of work completes and
/// call [`StageContext::checkpoint`] at least once per unit. A per-item
/// failure is emitted as an item `Error` and the body carries on; a setup
/// failure is returned as [`StageStop::Fatal`].
#[async_trait]
pub trait Stage: Send + Sync + Debug {
    /// Returns the name of the stage.
    fn name(&self) -> &str;

    /// Returns what role the stage plays.
    fn kind(&self) -> StageKind;

    /// Returns true if the stage wants this artifact of an earlier stage.
    fn accepts(&self, artifact: &Artifact) -> bool {
        let _ = artifact;
        false
    }

    /// Runs the stage body.
    async fn produce(&self, ctx: &StageContext, out: &Emitter) -> StageOutcome;
}

/// One extracted record: information-item label to value.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Writes records as a JSON array, replacing any previous file.
pub async fn write_records(path: &Path, records: &[Record]) -> std::io::Result<()> {
    let raw = serde_json::to_vec_pretty(records)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    tokio::fs::write(path, raw).await
}

/// Reads records written by [`write_records`].
pub async fn read_records(path: &Path) -> std::io::Result<Vec<Record>> {
    let raw = tokio::fs::read(path).await?;
    serde_json::from_slice(&raw).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Sends an item error and keeps going.
pub(crate) async fn item_error(
    out: &Emitter,
    stage: &str,
    subject: impl Into<String> + Send,
    message: impl std::fmt::Display + Send,
) -> StageOutcome {
    out.emit(StageResult::Error(
        StageError::item(stage, message.to_string()).with_subject(subject),
    ))
    .await
}
