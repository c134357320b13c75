//! YAML pipeline definitions.

use crate::cache::CacheBinding;
use crate::core::{ArtifactKind, FailurePolicy, StageKind};
use crate::errors::GateflowError;
use crate::pipeline::{
    ArtifactSpec, CommandSpec, EntrySource, OutputSpec, PipelineBuilder, StageGraph, StageSpec,
};
use crate::trigger::TriggerRule;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// The built-in contract pipeline.
pub const CONTRACT_PIPELINE: &str = include_str!("../../pipelines/contract.yaml");

/// A whole pipeline file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Pipeline name.
    pub name: String,
    /// Primary branch; the CLI flag overrides it.
    #[serde(default)]
    pub primary_branch: Option<String>,
    /// Stages in declaration order.
    pub stages: Vec<StageConfig>,
    /// Artifacts in declaration order.
    #[serde(default)]
    pub artifacts: Vec<ArtifactConfig>,
}

/// One stage as written in YAML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    /// Stage id.
    pub id: String,
    /// Stage kind.
    pub kind: StageKind,
    /// Commands in order.
    pub commands: Vec<CommandSpec>,
    /// Hard dependencies.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Ordering-only dependencies.
    #[serde(default)]
    pub after: Vec<String>,
    /// Shared resources written.
    #[serde(default)]
    pub writes: Vec<String>,
    /// Cache bindings.
    #[serde(default)]
    pub caches: Vec<CacheBinding>,
    /// Failure policy.
    #[serde(default)]
    pub policy: FailurePolicy,
    /// Trigger rule.
    #[serde(default)]
    pub trigger: Option<TriggerRule>,
    /// Stage time budget in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Declared outputs.
    #[serde(default)]
    pub outputs: Vec<OutputSpec>,
}

/// One artifact as written in YAML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArtifactConfig {
    /// Artifact name.
    pub name: String,
    /// Artifact kind.
    pub kind: ArtifactKind,
    /// Producing stage.
    pub stage: String,
    /// Entries.
    pub entries: Vec<EntryConfig>,
    /// Retention in days.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Publish rule.
    #[serde(default)]
    pub publish: TriggerRule,
    /// Publish even if the stage failed.
    #[serde(default)]
    pub on_failure: bool,
}

/// One artifact entry: exactly one of `output`, `path` or `captured`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntryConfig {
    /// Entry name inside the artifact.
    pub name: String,
    /// A declared output of the producing stage.
    #[serde(default)]
    pub output: Option<String>,
    /// A workdir-relative path.
    #[serde(default)]
    pub path: Option<String>,
    /// The producing stage's captured output.
    #[serde(default)]
    pub captured: bool,
}

const fn default_retention_days() -> u32 {
    30
}

impl EntryConfig {
    fn source(&self, artifact: &str) -> Result<EntrySource, GateflowError> {
        match (&self.output, &self.path, self.captured) {
            (Some(output), None, false) => Ok(EntrySource::Output(output.clone())),
            (None, Some(path), false) => Ok(EntrySource::Path(path.clone())),
            (None, None, true) => Ok(EntrySource::Captured),
            _ => Err(GateflowError::Definition(format!(
                "artifact '{artifact}' entry '{}' must set exactly one of output, path or captured",
                self.name
            ))),
        }
    }
}

impl StageConfig {
    fn into_spec(self) -> StageSpec {
        StageSpec {
            id: self.id,
            kind: self.kind,
            commands: self.commands,
            depends_on: self.depends_on,
            after: self.after,
            writes: self.writes,
            caches: self.caches,
            policy: self.policy,
            trigger: self.trigger,
            timeout: self.timeout_secs.map(Duration::from_secs),
            outputs: self.outputs,
        }
    }
}

impl ArtifactConfig {
    fn into_spec(self) -> Result<ArtifactSpec, GateflowError> {
        let mut spec = ArtifactSpec::new(&self.name, self.kind, &self.stage)
            .with_retention_days(self.retention_days)
            .with_publish(self.publish);
        if self.on_failure {
            spec = spec.on_failure();
        }
        for entry in &self.entries {
            spec = spec.with_entry(&entry.name, entry.source(&self.name)?);
        }
        Ok(spec)
    }
}

impl PipelineConfig {
    /// Parses a YAML definition.
    pub fn from_yaml(text: &str) -> Result<Self, GateflowError> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Reads and parses a YAML file.
    pub fn load(path: &Path) -> Result<Self, GateflowError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            GateflowError::Definition(format!("cannot read {}: {e}", path.display()))
        })?;
        let config = Self::from_yaml(&text)?;
        debug!(path = %path.display(), stages = config.stages.len(), "Loaded pipeline definition");
        Ok(config)
    }

    /// The built-in contract pipeline.
    pub fn builtin() -> Result<Self, GateflowError> {
        Self::from_yaml(CONTRACT_PIPELINE)
    }

    /// Validates the definition into a stage graph.
    pub fn into_graph(self) -> Result<StageGraph, GateflowError> {
        let mut builder = PipelineBuilder::new(self.name);
        for stage in self.stages {
            builder.add_stage(stage.into_spec())?;
        }
        for artifact in self.artifacts {
            builder.add_artifact(artifact.into_spec()?);
        }
        Ok(builder.build()?)
    }
}
