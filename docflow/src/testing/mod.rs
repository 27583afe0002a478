//! Testing utilities for docflow pipelines.
//!
//! This module provides:
//! - Scripted, failing and recording stages
//! - A stage context builder and a sample profile

mod fixtures;
mod mocks;

pub use fixtures::{sample_profile, TestContext};
pub use mocks::{FailingStage, RecordingStage, ScriptedStage, Step};
