//! Pipeline builder with validation.

use super::graph::StageGraph;
use super::spec::{ArtifactSpec, StageSpec};
use crate::errors::{codes, DiagnosticInfo, PipelineValidationError};
use std::collections::HashMap;

/// Builder for creating validated stage graphs.
///
/// Stages may be added in any order; references are resolved by
/// [`build`](Self::build).
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    name: String,
    stages: HashMap<String, StageSpec>,
    stage_order: Vec<String>,
    artifacts: Vec<ArtifactSpec>,
}

impl PipelineBuilder {
    /// Creates a new pipeline builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: HashMap::new(),
            stage_order: Vec::new(),
            artifacts: Vec::new(),
        }
    }

    /// Adds a stage.
    ///
    /// # Errors
    ///
    /// Returns an error if the stage is invalid on its own or its id is taken.
    pub fn stage(mut self, spec: StageSpec) -> Result<Self, PipelineValidationError> {
        self.add_stage(spec)?;
        Ok(self)
    }

    /// Adds a stage in place.
    ///
    /// # Errors
    ///
    /// See [`stage`](Self::stage).
    pub fn add_stage(&mut self, spec: StageSpec) -> Result<(), PipelineValidationError> {
        spec.validate()?;

        if self.stages.contains_key(&spec.id) {
            return Err(PipelineValidationError::new(format!(
                "Stage '{}' is declared more than once",
                spec.id
            ))
            .with_stages(vec![spec.id.clone()])
            .with_error_info(
                DiagnosticInfo::new(codes::DUPLICATE, format!("Duplicate stage id '{}'", spec.id))
                    .with_fix_hint("Stage ids must be unique within a pipeline."),
            ));
        }

        self.stage_order.push(spec.id.clone());
        self.stages.insert(spec.id.clone(), spec);
        Ok(())
    }

    /// Declares an artifact.
    #[must_use]
    pub fn artifact(mut self, spec: ArtifactSpec) -> Self {
        self.artifacts.push(spec);
        self
    }

    /// Declares an artifact in place.
    pub fn add_artifact(&mut self, spec: ArtifactSpec) {
        self.artifacts.push(spec);
    }

    /// Builds the graph.
    ///
    /// # Errors
    ///
    /// Returns an error if the builder has no stages, a dependency is
    /// unknown, the graph has a cycle or an artifact reference is invalid.
    pub fn build(self) -> Result<StageGraph, PipelineValidationError> {
        StageGraph::new(self.name, self.stages, self.stage_order, self.artifacts)
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StageKind;
    use crate::pipeline::spec::CommandSpec;

    fn stage(id: &str) -> StageSpec {
        StageSpec::new(id, StageKind::Lint).with_command(CommandSpec::new("cargo", ["clippy"]))
    }

    #[test]
    fn test_builder_accepts_forward_references() {
        let graph = PipelineBuilder::new("contract")
            .stage(stage("lint").depends_on("fmt"))
            .unwrap()
            .stage(stage("fmt"))
            .unwrap()
            .build()
            .unwrap();

        assert_eq!(graph.name(), "contract");
        assert_eq!(graph.stage_count(), 2);
    }

    #[test]
    fn test_builder_duplicate_rejected() {
        let err = PipelineBuilder::new("p")
            .stage(stage("fmt"))
            .unwrap()
            .stage(stage("fmt"))
            .unwrap_err();
        assert_eq!(err.code(), Some(codes::DUPLICATE));
    }

    #[test]
    fn test_builder_empty_id_rejected() {
        let err = PipelineBuilder::new("p").stage(stage("  ")).unwrap_err();
        assert_eq!(err.code(), Some(codes::INVALID_STAGE));
    }

    #[test]
    fn test_builder_missing_dependency() {
        let err = PipelineBuilder::new("p")
            .stage(stage("lint").depends_on("fmt"))
            .unwrap()
            .build()
            .unwrap_err();
        assert_eq!(err.code(), Some(codes::MISSING_DEP));
        assert_eq!(err.stages, vec!["lint".to_string(), "fmt".to_string()]);
    }

    #[test]
    fn test_builder_empty_build() {
        let err = PipelineBuilder::new("p").build().unwrap_err();
        assert_eq!(err.code(), Some(codes::EMPTY));
    }

    #[test]
    fn test_builder_cycle_detection() {
        let err = PipelineBuilder::new("p")
            .stage(stage("a").depends_on("b"))
            .unwrap()
            .stage(stage("b").depends_on("a"))
            .unwrap()
            .build()
            .unwrap_err();
        assert_eq!(err.code(), Some(codes::CYCLE));
        assert!(err.message.contains("a -> b -> a"));
    }
}
