//! Core domain model types.
//!
//! - Artifacts produced by stages
//! - The `StageResult` union a stage emits
//! - Task status and stage kind enums
//! - The staged table format

mod artifact;
mod result;
mod status;
mod table;

pub use artifact::{Artifact, ArtifactKind};
pub use result::StageResult;
pub use status::{StageKind, TaskStatus};
pub use table::Table;
