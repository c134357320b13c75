//! Maps a run context to the enabled stages and publish decisions.

use super::TriggerRule;
use crate::context::RunContext;
use crate::pipeline::StageGraph;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Default primary branch name.
pub const DEFAULT_PRIMARY_BRANCH: &str = "main";

/// What the trigger evaluator decided for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Enablement {
    /// False when the event does not trigger the pipeline at all.
    pub triggered: bool,
    /// Stages whose own rule matched.
    pub enabled: BTreeSet<String>,
    /// Stages whose rule did not match, with the rule that excluded them.
    pub disabled: BTreeMap<String, String>,
    /// Publish gate per artifact.
    pub publish: BTreeMap<String, bool>,
}

impl Enablement {
    /// Returns true if the stage's own rule matched.
    #[must_use]
    pub fn is_enabled(&self, stage: &str) -> bool {
        self.enabled.contains(stage)
    }

    /// The evaluated publish gate for an artifact.
    #[must_use]
    pub fn publish_gate(&self, artifact: &str) -> bool {
        self.publish.get(artifact).copied().unwrap_or(false)
    }
}

/// Pure function from run context to [`Enablement`].
#[derive(Debug, Clone)]
pub struct TriggerEvaluator {
    primary_branch: String,
}

impl Default for TriggerEvaluator {
    fn default() -> Self {
        Self::new(DEFAULT_PRIMARY_BRANCH)
    }
}

impl TriggerEvaluator {
    /// Creates an evaluator for the given primary branch.
    #[must_use]
    pub fn new(primary_branch: impl Into<String>) -> Self {
        Self {
            primary_branch: primary_branch.into(),
        }
    }

    /// The primary branch name.
    #[must_use]
    pub fn primary_branch(&self) -> &str {
        &self.primary_branch
    }

    /// A run is triggered by a push to the primary branch or a pull request
    /// targeting it.
    #[must_use]
    pub fn is_triggered(&self, ctx: &RunContext) -> bool {
        ctx.branch == self.primary_branch
    }

    /// Evaluates a rule against the context.
    #[must_use]
    pub fn matches(&self, rule: &TriggerRule, ctx: &RunContext) -> bool {
        rule.matches(ctx, &self.primary_branch)
    }

    /// Computes the enabled stage set and artifact publish gates.
    #[must_use]
    pub fn evaluate(&self, graph: &StageGraph, ctx: &RunContext) -> Enablement {
        let triggered = self.is_triggered(ctx);
        let mut enablement = Enablement {
            triggered,
            ..Enablement::default()
        };

        for stage in graph.stages() {
            if !triggered {
                enablement.disabled.insert(
                    stage.id.clone(),
                    format!(
                        "{} to '{}' does not trigger the pipeline",
                        ctx.event, ctx.branch
                    ),
                );
                continue;
            }
            match &stage.trigger {
                Some(rule) if !self.matches(rule, ctx) => {
                    enablement
                        .disabled
                        .insert(stage.id.clone(), format!("trigger rule '{rule}' not met"));
                }
                _ => {
                    enablement.enabled.insert(stage.id.clone());
                }
            }
        }

        for artifact in graph.artifacts() {
            let gate = triggered && self.matches(&artifact.publish, ctx);
            enablement.publish.insert(artifact.name.clone(), gate);
        }

        enablement
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ArtifactKind, StageKind};
    use crate::pipeline::{ArtifactSpec, CommandSpec, PipelineBuilder, StageSpec};

    fn graph() -> StageGraph {
        let cmd = || CommandSpec::new("cargo", ["build"]);
        PipelineBuilder::new("p")
            .stage(StageSpec::new("build", StageKind::Build).with_command(cmd()))
            .unwrap()
            .stage(
                StageSpec::new("optimize", StageKind::Optimize)
                    .with_command(cmd())
                    .depends_on("build")
                    .with_trigger(TriggerRule::PushToPrimary),
            )
            .unwrap()
            .artifact(
                ArtifactSpec::new("contract-wasm", ArtifactKind::Binary, "optimize")
                    .with_publish(TriggerRule::PushToPrimary),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_push_to_primary_enables_everything() {
        let enablement = TriggerEvaluator::new("main").evaluate(&graph(), &RunContext::push("main", "c"));
        assert!(enablement.triggered);
        assert!(enablement.is_enabled("optimize"));
        assert!(enablement.publish_gate("contract-wasm"));
    }

    #[test]
    fn test_pull_request_disables_push_only_stage() {
        let enablement =
            TriggerEvaluator::new("main").evaluate(&graph(), &RunContext::pull_request("main", "c"));
        assert!(enablement.triggered);
        assert!(enablement.is_enabled("build"));
        assert!(!enablement.is_enabled("optimize"));
        assert!(enablement.disabled["optimize"].contains("push_to_primary"));
        assert!(!enablement.publish_gate("contract-wasm"));
    }

    #[test]
    fn test_push_to_other_branch_not_triggered() {
        let enablement =
            TriggerEvaluator::new("main").evaluate(&graph(), &RunContext::push("feature/x", "c"));
        assert!(!enablement.triggered);
        assert!(enablement.enabled.is_empty());
        assert_eq!(enablement.disabled.len(), 2);
        assert!(!enablement.publish_gate("contract-wasm"));
    }

    #[test]
    fn test_custom_primary_branch() {
        let evaluator = TriggerEvaluator::new("trunk");
        assert!(evaluator.is_triggered(&RunContext::push("trunk", "c")));
        assert!(!evaluator.is_triggered(&RunContext::push("main", "c")));
    }
}
