//! Stage, command, output and artifact declarations.

use crate::cache::CacheBinding;
use crate::core::{ArtifactKind, CommandPhase, FailurePolicy, StageKind};
use crate::errors::{codes, DiagnosticInfo, PipelineValidationError};
use crate::trigger::TriggerRule;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// One external command of a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Program name or path.
    pub program: String,
    /// Arguments; may reference `${outputs.<stage>.<name>}`.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Secrets injected as environment variables of the same name.
    #[serde(default)]
    pub secrets: Vec<String>,
    /// Setup commands are skipped when every cache binding hits exactly.
    #[serde(default)]
    pub phase: CommandPhase,
    /// Writes redacted stdout to this path (relative to the workdir).
    #[serde(default)]
    pub stdout_to: Option<String>,
    /// Alternative tried once if this command exits non-zero.
    #[serde(default)]
    pub fallback: Option<Box<CommandSpec>>,
}

impl CommandSpec {
    /// Creates a verify-phase command.
    #[must_use]
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            env: BTreeMap::new(),
            secrets: Vec::new(),
            phase: CommandPhase::Verify,
            stdout_to: None,
            fallback: None,
        }
    }

    /// Creates a setup-phase command.
    #[must_use]
    pub fn setup<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(program, args).with_phase(CommandPhase::Setup)
    }

    /// Sets the phase.
    #[must_use]
    pub fn with_phase(mut self, phase: CommandPhase) -> Self {
        self.phase = phase;
        self
    }

    /// Sets an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Requests a secret.
    #[must_use]
    pub fn with_secret(mut self, name: impl Into<String>) -> Self {
        self.secrets.push(name.into());
        self
    }

    /// Redirects redacted stdout to a file.
    #[must_use]
    pub fn with_stdout_to(mut self, path: impl Into<String>) -> Self {
        self.stdout_to = Some(path.into());
        self
    }

    /// Sets the fallback command.
    #[must_use]
    pub fn with_fallback(mut self, fallback: CommandSpec) -> Self {
        self.fallback = Some(Box::new(fallback));
        self
    }
}

/// A declared output path, with alternates checked in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpec {
    /// Output name, referenced by artifacts and `${outputs...}`.
    pub name: String,
    /// Primary path, relative to the workdir.
    pub path: String,
    /// Alternate paths (e.g. per compilation target).
    #[serde(default)]
    pub alternates: Vec<String>,
}

impl OutputSpec {
    /// Creates an output with no alternates.
    #[must_use]
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            alternates: Vec::new(),
        }
    }

    /// Adds an alternate path.
    #[must_use]
    pub fn with_alternate(mut self, path: impl Into<String>) -> Self {
        self.alternates.push(path.into());
        self
    }

    /// All candidate paths in lookup order.
    pub fn candidates(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.path.as_str()).chain(self.alternates.iter().map(String::as_str))
    }
}

/// Declaration of one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSpec {
    /// Unique stage id.
    pub id: String,
    /// What the stage does.
    pub kind: StageKind,
    /// Commands run in order; the first failure stops the stage.
    pub commands: Vec<CommandSpec>,
    /// Hard dependencies: failure propagates.
    pub depends_on: Vec<String>,
    /// Ordering-only dependencies: never propagate failure.
    pub after: Vec<String>,
    /// Shared resources the stage mutates.
    pub writes: Vec<String>,
    /// Cache bindings; non-empty means cacheable.
    pub caches: Vec<CacheBinding>,
    /// Failure policy.
    pub policy: FailurePolicy,
    /// Trigger rule; `None` means every triggered run.
    pub trigger: Option<TriggerRule>,
    /// Maximum duration of the whole stage.
    pub timeout: Option<Duration>,
    /// Declared outputs.
    pub outputs: Vec<OutputSpec>,
}

impl StageSpec {
    /// Creates a fatal stage with no commands or edges.
    #[must_use]
    pub fn new(id: impl Into<String>, kind: StageKind) -> Self {
        Self {
            id: id.into(),
            kind,
            commands: Vec::new(),
            depends_on: Vec::new(),
            after: Vec::new(),
            writes: Vec::new(),
            caches: Vec::new(),
            policy: FailurePolicy::Fatal,
            trigger: None,
            timeout: None,
            outputs: Vec::new(),
        }
    }

    /// Appends a command.
    #[must_use]
    pub fn with_command(mut self, command: CommandSpec) -> Self {
        self.commands.push(command);
        self
    }

    /// Adds a hard dependency.
    #[must_use]
    pub fn depends_on(mut self, stage: impl Into<String>) -> Self {
        self.depends_on.push(stage.into());
        self
    }

    /// Adds an ordering-only dependency.
    #[must_use]
    pub fn after(mut self, stage: impl Into<String>) -> Self {
        self.after.push(stage.into());
        self
    }

    /// Declares a shared resource the stage writes.
    #[must_use]
    pub fn writes(mut self, resource: impl Into<String>) -> Self {
        self.writes.push(resource.into());
        self
    }

    /// Adds a cache binding.
    #[must_use]
    pub fn with_cache(mut self, binding: CacheBinding) -> Self {
        self.caches.push(binding);
        self
    }

    /// Sets the failure policy.
    #[must_use]
    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the trigger rule.
    #[must_use]
    pub fn with_trigger(mut self, trigger: TriggerRule) -> Self {
        self.trigger = Some(trigger);
        self
    }

    /// Sets the stage timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Declares an output.
    #[must_use]
    pub fn with_output(mut self, output: OutputSpec) -> Self {
        self.outputs.push(output);
        self
    }

    /// Returns true if the stage has cache bindings.
    #[must_use]
    pub fn is_cacheable(&self) -> bool {
        !self.caches.is_empty()
    }

    /// Looks up a declared output.
    #[must_use]
    pub fn output(&self, name: &str) -> Option<&OutputSpec> {
        self.outputs.iter().find(|o| o.name == name)
    }

    /// Hard and ordering edges together.
    pub fn all_upstreams(&self) -> impl Iterator<Item = &str> {
        self.depends_on
            .iter()
            .chain(self.after.iter())
            .map(String::as_str)
    }

    /// Validates the stage in isolation.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty id, a self-dependency or a stage
    /// without commands.
    pub fn validate(&self) -> Result<(), PipelineValidationError> {
        if self.id.trim().is_empty() {
            return Err(PipelineValidationError::new("Stage id cannot be empty")
                .with_error_info(DiagnosticInfo::new(
                    codes::INVALID_STAGE,
                    "Empty stage id",
                )));
        }
        if self.all_upstreams().any(|dep| dep == self.id) {
            return Err(PipelineValidationError::new(format!(
                "Stage '{}' cannot depend on itself",
                self.id
            ))
            .with_stages(vec![self.id.clone()])
            .with_error_info(
                DiagnosticInfo::new(codes::SELF_DEP, "Stage depends on itself")
                    .with_fix_hint("Remove the stage from its own depends_on/after list"),
            ));
        }
        if self.commands.is_empty() {
            return Err(PipelineValidationError::new(format!(
                "Stage '{}' has no commands",
                self.id
            ))
            .with_stages(vec![self.id.clone()])
            .with_error_info(DiagnosticInfo::new(
                codes::INVALID_STAGE,
                "Stage without commands",
            )));
        }
        Ok(())
    }
}

/// Where one entry of an artifact comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntrySource {
    /// A declared output of the producing stage.
    Output(String),
    /// A path relative to the workdir.
    Path(String),
    /// The producing stage's redacted captured output.
    Captured,
}

/// Declaration of one artifact entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactEntrySpec {
    /// Entry name inside the artifact.
    pub name: String,
    /// Content source.
    pub source: EntrySource,
}

/// Declaration of an artifact produced by a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSpec {
    /// Artifact name.
    pub name: String,
    /// Artifact kind.
    pub kind: ArtifactKind,
    /// Producing stage.
    pub stage: String,
    /// Entries.
    pub entries: Vec<ArtifactEntrySpec>,
    /// Retention period in days.
    pub retention_days: u32,
    /// Publish rule.
    pub publish: TriggerRule,
    /// Produce the artifact even if the stage failed (it must have run).
    pub on_failure: bool,
}

impl ArtifactSpec {
    /// Creates an artifact published on every triggered run.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: ArtifactKind, stage: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            stage: stage.into(),
            entries: Vec::new(),
            retention_days: 30,
            publish: TriggerRule::Always,
            on_failure: false,
        }
    }

    /// Adds an entry.
    #[must_use]
    pub fn with_entry(mut self, name: impl Into<String>, source: EntrySource) -> Self {
        self.entries.push(ArtifactEntrySpec {
            name: name.into(),
            source,
        });
        self
    }

    /// Sets the retention period.
    #[must_use]
    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention_days = days;
        self
    }

    /// Sets the publish rule.
    #[must_use]
    pub fn with_publish(mut self, rule: TriggerRule) -> Self {
        self.publish = rule;
        self
    }

    /// Produces the artifact even when the stage failed.
    #[must_use]
    pub fn on_failure(mut self) -> Self {
        self.on_failure = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_builder() {
        let stage = StageSpec::new("build", StageKind::Build)
            .with_command(CommandSpec::new("cargo", ["build", "--release"]))
            .depends_on("test")
            .after("lint")
            .writes("target")
            .with_output(
                OutputSpec::new("wasm", "target/wasm32v1-none/release/token.wasm")
                    .with_alternate("target/wasm32-unknown-unknown/release/token.wasm"),
            );

        assert_eq!(stage.all_upstreams().collect::<Vec<_>>(), vec!["test", "lint"]);
        assert_eq!(stage.output("wasm").map(|o| o.candidates().count()), Some(2));
        assert!(!stage.is_cacheable());
        assert!(stage.validate().is_ok());
    }

    #[test]
    fn test_self_dependency_rejected() {
        let stage = StageSpec::new("fmt", StageKind::Format)
            .with_command(CommandSpec::new("cargo", ["fmt"]))
            .after("fmt");
        let err = stage.validate().unwrap_err();
        assert_eq!(err.code(), Some(codes::SELF_DEP));
    }

    #[test]
    fn test_stage_without_commands_rejected() {
        let err = StageSpec::new("empty", StageKind::Lint).validate().unwrap_err();
        assert_eq!(err.code(), Some(codes::INVALID_STAGE));
    }

    #[test]
    fn test_command_spec_yaml_defaults() {
        let cmd: CommandSpec = serde_yaml::from_str("program: cargo\nargs: [fetch]\n").unwrap();
        assert_eq!(cmd.phase, CommandPhase::Verify);
        assert!(cmd.fallback.is_none());
    }
}
