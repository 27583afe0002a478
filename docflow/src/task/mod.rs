//! Task lifecycle and cancellation routing.
//!
//! A [`Task`] is one run of a pipeline. The [`TaskManager`] accepts
//! definitions, drives each task and answers status and cancellation
//! requests through the [`TaskRegistry`].

mod lifecycle;
mod manager;
mod registry;

pub use lifecycle::{Task, TaskEvent, TaskSnapshot};
pub use manager::TaskManager;
pub use registry::{CancelOutcome, TaskRegistry};
