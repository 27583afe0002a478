//! Pipeline builder with validation.

use super::Pipeline;
use crate::errors::{ContractErrorInfo, PipelineValidationError};
use crate::stages::Stage;
use std::sync::Arc;

const DEFAULT_CAPACITY: usize = 32;

/// Builder for creating validated pipelines.
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    /// The pipeline name.
    name: String,
    /// Stages in execution order.
    stages: Vec<Arc<dyn Stage>>,
    /// Channel slots between a stage and its consumer.
    capacity: usize,
}

impl PipelineBuilder {
    /// Creates a new pipeline builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            capacity: DEFAULT_CAPACITY,
        }
    }

    /// Appends a stage.
    ///
    /// # Errors
    ///
    /// Returns an error if a stage with the same name was already added.
    pub fn stage(mut self, stage: Arc<dyn Stage>) -> Result<Self, PipelineValidationError> {
        self.add_stage(stage)?;
        Ok(self)
    }

    /// Appends a stage in place.
    ///
    /// # Errors
    ///
    /// Returns an error if a stage with the same name was already added.
    pub fn add_stage(&mut self, stage: Arc<dyn Stage>) -> Result<(), PipelineValidationError> {
        let name = stage.name().to_string();
        if self.stages.iter().any(|s| s.name() == name) {
            return Err(PipelineValidationError::new(format!("Duplicate stage '{name}'"))
                .with_stages(vec![name.clone()])
                .with_error_info(
                    ContractErrorInfo::new(
                        "CONTRACT-004-DUPLICATE",
                        format!("Stage '{name}' appears more than once"),
                    )
                    .with_fix_hint("Each stage may appear once per pipeline; give repeated stages distinct names."),
                ));
        }
        self.stages.push(stage);
        Ok(())
    }

    /// Sets the number of results buffered between a stage and the runner.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Builds the pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if the builder has no stages.
    pub fn build(self) -> Result<Pipeline, PipelineValidationError> {
        if self.stages.is_empty() {
            return Err(PipelineValidationError::new("Pipeline has no stages")
                .with_error_info(
                    ContractErrorInfo::new("CONTRACT-004-EMPTY", "Cannot build an empty pipeline")
                        .with_fix_hint("Add at least one stage to the pipeline before building."),
                ));
        }
        Ok(Pipeline::new(self.name, self.stages, self.capacity))
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }
}
