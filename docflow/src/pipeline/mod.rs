//! Pipeline building and execution.
//!
//! This module provides:
//! - A validating builder
//! - The sequential runner and its line sequence
//! - Serializable pipeline definitions

mod builder;
mod definition;
mod runner;

pub use builder::PipelineBuilder;
pub use definition::PipelineDefinition;
pub use runner::{LineKind, LineStream, LogLine, Pipeline, RunOutcome};
