//! Stage registry: typed per-stage configuration and a factory.

use super::{
    KeyValueTextExtractor, MailReaderStage, MappingExtractStage, Stage, TableReaderStage,
    TabularExportStage, TextExtractStage, TextExtractor,
};
use crate::config::{timeout_from_secs, WorkingArea};
use crate::errors::{ContractErrorInfo, PipelineValidationError};
use crate::mapping::{HeaderMatchGenerator, InMemoryMappingCache, MappingResolver};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

fn default_timeout_seconds() -> f64 {
    60.0
}

/// Options for the mail reader.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MailReaderConfig {
    /// Source files to read instead of every `.eml` in `source/`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<String>>,
}

/// Options for the table reader.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableReaderConfig {
    /// Source files to read instead of every `.csv` in `source/`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<String>>,
    /// Words the header row must contain.
    #[serde(default)]
    pub header_candidates: Vec<String>,
}

/// Options for text extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextExtractConfig {
    /// Per-document request timeout.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: f64,
}

impl Default for TextExtractConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

/// Options for mapping extraction. The resolver is shared by the factory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingExtractConfig {}

/// Options for the tabular export.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportConfig {}

/// One configured stage of a pipeline definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageConfig {
    /// `.eml` files to text.
    MailReader(MailReaderConfig),
    /// `.csv` files to staged tables.
    TableReader(TableReaderConfig),
    /// Text to records.
    TextExtract(TextExtractConfig),
    /// Tables to records through the mapping cache.
    MappingExtract(MappingExtractConfig),
    /// Records to CSV files in `destination/`.
    TabularExport(ExportConfig),
}

impl StageConfig {
    /// The name the built stage reports.
    #[must_use]
    pub fn stage_name(&self) -> &'static str {
        match self {
            Self::MailReader(_) => "mail_reader",
            Self::TableReader(_) => "table_reader",
            Self::TextExtract(_) => "text_extract",
            Self::MappingExtract(_) => "mapping_extract",
            Self::TabularExport(_) => "tabular_export",
        }
    }

    /// Restricts a reader to `files` unless it already names its own.
    #[must_use]
    pub fn with_default_files(self, files: Option<&[String]>) -> Self {
        let Some(files) = files else { return self };
        match self {
            Self::MailReader(mut c) => {
                c.files.get_or_insert_with(|| files.to_vec());
                Self::MailReader(c)
            }
            Self::TableReader(mut c) => {
                c.files.get_or_insert_with(|| files.to_vec());
                Self::TableReader(c)
            }
            other => other,
        }
    }
}

/// Builds stages from their configuration, handing each the shared
/// collaborators.
#[derive(Debug, Clone)]
pub struct StageFactory {
    resolver: MappingResolver,
    text_extractor: Arc<dyn TextExtractor>,
}

impl Default for StageFactory {
    fn default() -> Self {
        Self::new(
            MappingResolver::new(
                Arc::new(InMemoryMappingCache::new()),
                Arc::new(HeaderMatchGenerator::new()),
                Duration::from_secs(60),
            ),
            Arc::new(KeyValueTextExtractor::new()),
        )
    }
}

impl StageFactory {
    /// Creates a factory over the shared mapping resolver and text extractor.
    #[must_use]
    pub fn new(resolver: MappingResolver, text_extractor: Arc<dyn TextExtractor>) -> Self {
        Self {
            resolver,
            text_extractor,
        }
    }

    /// The shared mapping resolver.
    #[must_use]
    pub fn resolver(&self) -> &MappingResolver {
        &self.resolver
    }

    /// Builds one stage over `area`.
    ///
    /// Fails when a setting is out of range, such as an unusable timeout.
    pub fn build(
        &self,
        config: &StageConfig,
        area: &WorkingArea,
    ) -> Result<Arc<dyn Stage>, PipelineValidationError> {
        Ok(match config {
            StageConfig::MailReader(c) => {
                Arc::new(MailReaderStage::new(area.clone()).with_files(c.files.clone()))
            }
            StageConfig::TableReader(c) => Arc::new(
                TableReaderStage::new(area.clone())
                    .with_files(c.files.clone())
                    .with_header_candidates(c.header_candidates.clone()),
            ),
            StageConfig::TextExtract(c) => {
                let timeout = timeout_from_secs("timeout_seconds", c.timeout_seconds).map_err(|e| {
                    PipelineValidationError::new(format!("{}: {e}", config.stage_name()))
                        .with_stages(vec![config.stage_name().to_string()])
                        .with_error_info(ContractErrorInfo::new(
                            "CONTRACT-004-STAGE-CONFIG",
                            "Stage setting out of range",
                        ))
                })?;
                Arc::new(TextExtractStage::new(
                    area.clone(),
                    Arc::clone(&self.text_extractor),
                    timeout,
                ))
            }
            StageConfig::MappingExtract(_) => {
                Arc::new(MappingExtractStage::new(area.clone(), self.resolver.clone()))
            }
            StageConfig::TabularExport(_) => Arc::new(TabularExportStage::new(area.clone())),
        })
    }
}
