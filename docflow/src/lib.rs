//! # Docflow
//!
//! A cancellable, streaming pipeline engine for extracting structured
//! records from business documents.
//!
//! Docflow provides:
//!
//! - **Stages**: mail and spreadsheet readers, model-backed extractors and
//!   a tabular exporter, each yielding a lazy sequence of results
//! - **Pipelines**: stages run strictly in order, later stages seeing the
//!   artifacts of earlier ones
//! - **Tasks**: one run bound to an id, a status and its own cancellation
//!   token, controllable while it runs
//! - **Mapping cache**: column mappings keyed by a fingerprint of the
//!   active profile and a document's header shape
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use docflow::prelude::*;
//!
//! let config = EngineConfig::from_file("docflow.json")?.with_env_overrides()?;
//! let manager = TaskManager::new(
//!     &config,
//!     StageFactory::default(),
//!     Arc::new(InMemoryProfileStore::new()),
//! );
//!
//! let id = manager.submit(&PipelineDefinition::standard())?;
//! let snapshot = manager.wait(&id).await?;
//! println!("{} -> {:?}", snapshot.status, snapshot.result_files);
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
#[cfg(feature = "llm")]
pub mod llm;
pub mod mapping;
pub mod observability;
pub mod pipeline;
pub mod profile;
pub mod stages;
pub mod task;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{EngineConfig, LoggingConfig, ModelConfig, WorkingArea};
    pub use crate::core::{Artifact, ArtifactKind, StageKind, StageResult, Table, TaskStatus};
    pub use crate::errors::{
        ContractErrorInfo, DocflowError, MappingError, ModelError, PipelineValidationError, StageError,
    };
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::mapping::{
        Fingerprint, HeaderMatchGenerator, InMemoryMappingCache, MappingCache, MappingGenerator,
        MappingResolver,
    };
    pub use crate::observability::init_tracing;
    pub use crate::pipeline::{LineKind, LogLine, Pipeline, PipelineBuilder, PipelineDefinition};
    pub use crate::profile::{InMemoryProfileStore, InfoItem, ProfileSnapshot, ProfileStore};
    pub use crate::stages::{Emitter, Stage, StageConfig, StageContext, StageFactory, StageOutcome, StageStop};
    pub use crate::task::{CancelOutcome, TaskManager, TaskSnapshot};
    pub use std::sync::Arc;
}
