//! Serializable pipeline definitions.

use super::{Pipeline, PipelineBuilder};
use crate::config::WorkingArea;
use crate::errors::PipelineValidationError;
use crate::stages::{
    ExportConfig, MailReaderConfig, MappingExtractConfig, StageConfig, StageFactory, TableReaderConfig,
    TextExtractConfig,
};
use serde::{Deserialize, Serialize};

/// What a task runs: a named list of configured stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// The pipeline name.
    pub name: String,
    /// Stages in run order.
    pub stages: Vec<StageConfig>,
    /// Source files chosen by the caller; readers without their own list use these.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<String>>,
}

impl PipelineDefinition {
    /// Creates a definition.
    #[must_use]
    pub fn new(name: impl Into<String>, stages: Vec<StageConfig>) -> Self {
        Self {
            name: name.into(),
            stages,
            files: None,
        }
    }

    /// The default chain: mail and spreadsheet readers, both extractors,
    /// then the tabular export.
    #[must_use]
    pub fn standard() -> Self {
        Self::new(
            "standard",
            vec![
                StageConfig::MailReader(MailReaderConfig::default()),
                StageConfig::TableReader(TableReaderConfig::default()),
                StageConfig::TextExtract(TextExtractConfig::default()),
                StageConfig::MappingExtract(MappingExtractConfig::default()),
                StageConfig::TabularExport(ExportConfig::default()),
            ],
        )
    }

    /// Restricts the readers to these source files.
    #[must_use]
    pub fn with_files(mut self, files: Vec<String>) -> Self {
        self.files = Some(files);
        self
    }

    /// Builds the runnable pipeline.
    pub fn build(
        &self,
        factory: &StageFactory,
        area: &WorkingArea,
        capacity: usize,
    ) -> Result<Pipeline, PipelineValidationError> {
        let mut builder = PipelineBuilder::new(&self.name).with_capacity(capacity);
        for config in &self.stages {
            let config = config.clone().with_default_files(self.files.as_deref());
            builder.add_stage(factory.build(&config, area)?)?;
        }
        builder.build()
    }
}
