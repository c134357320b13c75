//! The stage graph and its execution plan.

use super::outputs::references;
use super::spec::{ArtifactSpec, CommandSpec, EntrySource, StageSpec};
use crate::errors::{codes, DiagnosticInfo, CycleDetectedError, PipelineValidationError};
use crate::utils::is_plain_name;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

/// Why `plan` left a stage out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DisableReason {
    /// The stage was not in the enabled set.
    NotEnabled,
    /// A hard dependency was disabled.
    DependencyDisabled {
        /// The disabled upstream.
        upstream: String,
    },
}

impl fmt::Display for DisableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotEnabled => write!(f, "not enabled for this run"),
            Self::DependencyDisabled { upstream } => {
                write!(f, "depends on disabled stage '{upstream}'")
            }
        }
    }
}

/// A stage excluded from the plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisabledStage {
    /// Stage id.
    pub stage: String,
    /// Why it was excluded.
    pub reason: DisableReason,
}

/// Ordered batches of stages; stages in one batch have no edges between them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionPlan {
    /// Batches in execution order.
    pub batches: Vec<Vec<String>>,
    /// Stages left out, in declaration order.
    pub disabled: Vec<DisabledStage>,
}

impl ExecutionPlan {
    /// Number of scheduled stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }

    /// Returns true if the stage is scheduled.
    #[must_use]
    pub fn contains(&self, stage: &str) -> bool {
        self.batches.iter().flatten().any(|s| s == stage)
    }

    /// The reason a stage was disabled, if it was.
    #[must_use]
    pub fn disabled_reason(&self, stage: &str) -> Option<&DisableReason> {
        self.disabled
            .iter()
            .find(|d| d.stage == stage)
            .map(|d| &d.reason)
    }
}

/// A validated pipeline: stages, their edges and the artifacts they produce.
#[derive(Debug, Clone)]
pub struct StageGraph {
    name: String,
    stages: HashMap<String, StageSpec>,
    stage_order: Vec<String>,
    artifacts: Vec<ArtifactSpec>,
}

impl StageGraph {
    /// Creates a graph and validates its structure.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown dependencies, cycles or artifacts that
    /// reference unknown stages or outputs.
    pub fn new(
        name: impl Into<String>,
        stages: HashMap<String, StageSpec>,
        stage_order: Vec<String>,
        artifacts: Vec<ArtifactSpec>,
    ) -> Result<Self, PipelineValidationError> {
        let graph = Self {
            name: name.into(),
            stages,
            stage_order,
            artifacts,
        };
        graph.validate()?;
        Ok(graph)
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

    /// Looks up a stage.
    #[must_use]
    pub fn stage(&self, id: &str) -> Option<&StageSpec> {
        self.stages.get(id)
    }

    /// Stages in declaration order.
    pub fn stages(&self) -> impl Iterator<Item = &StageSpec> {
        self.stage_order.iter().filter_map(|id| self.stages.get(id))
    }

    /// Stage ids in declaration order.
    #[must_use]
    pub fn stage_ids(&self) -> &[String] {
        &self.stage_order
    }

    /// Declared artifacts.
    #[must_use]
    pub fn artifacts(&self) -> &[ArtifactSpec] {
        &self.artifacts
    }

    /// Checks references and acyclicity.
    ///
    /// # Errors
    ///
    /// See [`StageGraph::new`].
    pub fn validate(&self) -> Result<(), PipelineValidationError> {
        if self.stages.is_empty() {
            return Err(PipelineValidationError::new("Pipeline has no stages")
                .with_error_info(
                    DiagnosticInfo::new(codes::EMPTY, "Cannot build an empty pipeline")
                        .with_fix_hint("Add at least one stage to the pipeline."),
                ));
        }

        for id in &self.stage_order {
            let Some(spec) = self.stages.get(id) else {
                continue;
            };
            spec.validate()?;
            for dep in spec.all_upstreams() {
                if !self.stages.contains_key(dep) {
                    return Err(PipelineValidationError::new(format!(
                        "Stage '{id}' depends on unknown stage '{dep}'"
                    ))
                    .with_stages(vec![id.clone(), dep.to_string()])
                    .with_error_info(
                        DiagnosticInfo::new(
                            codes::MISSING_DEP,
                            format!("Dependency '{dep}' not found"),
                        )
                        .with_fix_hint("Declare the stage or remove the edge."),
                    ));
                }
            }
        }

        self.detect_cycles()?;
        self.validate_output_references()?;
        self.validate_artifacts()
    }

    /// `${outputs.<stage>.<name>}` must name a declared output of a hard dependency.
    fn validate_output_references(&self) -> Result<(), PipelineValidationError> {
        for spec in self.stages() {
            let mut commands: Vec<&CommandSpec> = Vec::new();
            for command in &spec.commands {
                let mut next = Some(command);
                while let Some(current) = next {
                    commands.push(current);
                    next = current.fallback.as_deref();
                }
            }

            for arg in commands.iter().flat_map(|c| c.args.iter()) {
                for (stage, output) in references(arg) {
                    let declared = spec.depends_on.contains(&stage)
                        && self
                            .stages
                            .get(&stage)
                            .is_some_and(|upstream| upstream.output(&output).is_some());
                    if !declared {
                        return Err(PipelineValidationError::new(format!(
                            "Stage '{}' references '${{outputs.{stage}.{output}}}' which is not a declared output of one of its dependencies",
                            spec.id
                        ))
                        .with_stages(vec![spec.id.clone(), stage])
                        .with_error_info(
                            DiagnosticInfo::new(codes::INVALID_STAGE, "Unresolvable output reference")
                                .with_fix_hint("Add the producing stage to depends_on and declare the output there."),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    fn validate_artifacts(&self) -> Result<(), PipelineValidationError> {
        let mut seen = HashSet::new();
        for artifact in &self.artifacts {
            let invalid = |summary: String| {
                PipelineValidationError::new(format!(
                    "Artifact '{}': {summary}",
                    artifact.name
                ))
                .with_stages(vec![artifact.stage.clone()])
                .with_error_info(DiagnosticInfo::new(codes::INVALID_ARTIFACT, summary))
            };

            if !is_plain_name(&artifact.name) {
                return Err(invalid("name must be a single path component".to_string()));
            }
            if !seen.insert(artifact.name.as_str()) {
                return Err(invalid("declared more than once".to_string()));
            }
            let Some(stage) = self.stages.get(&artifact.stage) else {
                return Err(invalid(format!("unknown stage '{}'", artifact.stage)));
            };
            for entry in &artifact.entries {
                if !is_plain_name(&entry.name) {
                    return Err(invalid(format!(
                        "entry name '{}' must be a single path component",
                        entry.name
                    )));
                }
                if let EntrySource::Output(output) = &entry.source {
                    if stage.output(output).is_none() {
                        return Err(invalid(format!(
                            "stage '{}' declares no output '{output}'",
                            stage.id
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Detects cycles over hard and ordering edges.
    fn detect_cycles(&self) -> Result<(), CycleDetectedError> {
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut path = Vec::new();

        for id in &self.stage_order {
            if !visited.contains(id.as_str()) {
                if let Some(cycle) = self.dfs_cycle(id, &mut visited, &mut rec_stack, &mut path) {
                    return Err(CycleDetectedError::new(cycle));
                }
            }
        }
        Ok(())
    }

    fn dfs_cycle<'a>(
        &'a self,
        node: &'a str,
        visited: &mut HashSet<&'a str>,
        rec_stack: &mut HashSet<&'a str>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        visited.insert(node);
        rec_stack.insert(node);
        path.push(node);

        if let Some(spec) = self.stages.get(node) {
            for dep in spec.all_upstreams() {
                if !visited.contains(dep) {
                    if let Some(cycle) = self.dfs_cycle(dep, visited, rec_stack, path) {
                        return Some(cycle);
                    }
                } else if rec_stack.contains(dep) {
                    let start = path.iter().position(|n| *n == dep).unwrap_or(0);
                    let mut cycle: Vec<String> = path[start..].iter().map(|s| (*s).to_string()).collect();
                    cycle.push(dep.to_string());
                    return Some(cycle);
                }
            }
        }

        path.pop();
        rec_stack.remove(node);
        None
    }

    /// Stage ids with every upstream listed before its dependents.
    fn topological_order(&self) -> Vec<&str> {
        let mut order = Vec::with_capacity(self.stage_order.len());
        let mut placed: HashSet<&str> = HashSet::new();
        while order.len() < self.stage_order.len() {
            let before = order.len();
            for id in &self.stage_order {
                if placed.contains(id.as_str()) {
                    continue;
                }
                let ready = self
                    .stages
                    .get(id)
                    .is_some_and(|s| s.all_upstreams().all(|u| placed.contains(u)));
                if ready {
                    placed.insert(id);
                    order.push(id.as_str());
                }
            }
            // Cannot happen on a validated graph; avoids spinning otherwise.
            if order.len() == before {
                break;
            }
        }
        order
    }

    /// Resolves ordered parallel batches for the enabled stages.
    ///
    /// Stages whose hard dependencies are disabled are disabled too, with an
    /// explanation. Ordering-only edges to disabled stages are dropped.
    ///
    /// # Errors
    ///
    /// Returns an error for structural problems (see [`StageGraph::validate`])
    /// and when two stages of one batch write the same resource.
    pub fn plan(&self, enabled: &BTreeSet<String>) -> Result<ExecutionPlan, PipelineValidationError> {
        self.validate()?;

        let order = self.topological_order();
        let mut disabled: BTreeMap<&str, DisableReason> = BTreeMap::new();
        for &id in &order {
            let Some(spec) = self.stages.get(id) else {
                continue;
            };
            if !enabled.contains(id) {
                disabled.insert(id, DisableReason::NotEnabled);
                continue;
            }
            if let Some(upstream) = spec.depends_on.iter().find(|d| disabled.contains_key(d.as_str())) {
                disabled.insert(
                    id,
                    DisableReason::DependencyDisabled {
                        upstream: upstream.clone(),
                    },
                );
            }
        }

        let mut level: HashMap<&str, usize> = HashMap::new();
        for &id in &order {
            if disabled.contains_key(id) {
                continue;
            }
            let Some(spec) = self.stages.get(id) else {
                continue;
            };
            let depth = spec
                .all_upstreams()
                .filter_map(|u| level.get(u))
                .map(|l| l + 1)
                .max()
                .unwrap_or(0);
            level.insert(id, depth);
        }

        let batch_count = level.values().max().map_or(0, |m| m + 1);
        let mut batches: Vec<Vec<String>> = vec![Vec::new(); batch_count];
        for id in &self.stage_order {
            if let Some(&depth) = level.get(id.as_str()) {
                batches[depth].push(id.clone());
            }
        }

        for batch in &batches {
            self.check_shared_writers(batch)?;
        }

        let disabled = self
            .stage_order
            .iter()
            .filter_map(|id| {
                disabled.get(id.as_str()).map(|reason| DisabledStage {
                    stage: id.clone(),
                    reason: reason.clone(),
                })
            })
            .collect();

        Ok(ExecutionPlan { batches, disabled })
    }

    fn check_shared_writers(&self, batch: &[String]) -> Result<(), PipelineValidationError> {
        let mut writers: HashMap<&str, &str> = HashMap::new();
        for id in batch {
            let Some(spec) = self.stages.get(id) else {
                continue;
            };
            for resource in &spec.writes {
                if let Some(first) = writers.insert(resource, id) {
                    return Err(PipelineValidationError::new(format!(
                        "Stages '{first}' and '{id}' both write '{resource}' and may run concurrently"
                    ))
                    .with_stages(vec![first.to_string(), id.clone()])
                    .with_error_info(
                        DiagnosticInfo::new(codes::SHARED_WRITER, "Unordered shared writer")
                            .with_fix_hint(format!(
                                "Add an `after` edge between '{first}' and '{id}'"
                            ))
                            .with_context_entry("resource", resource.clone()),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StageKind;
    use crate::pipeline::OutputSpec;
    use pretty_assertions::assert_eq;

    fn stage(id: &str) -> StageSpec {
        StageSpec::new(id, StageKind::Build).with_command(CommandSpec::new("true", Vec::<String>::new()))
    }

    fn graph(stages: Vec<StageSpec>) -> Result<StageGraph, PipelineValidationError> {
        let order = stages.iter().map(|s| s.id.clone()).collect();
        let map = stages.into_iter().map(|s| (s.id.clone(), s)).collect();
        StageGraph::new("test", map, order, Vec::new())
    }

    fn all(graph: &StageGraph) -> BTreeSet<String> {
        graph.stage_ids().iter().cloned().collect()
    }

    #[test]
    fn test_plan_batches() {
        let g = graph(vec![
            stage("fmt"),
            stage("audit"),
            stage("lint").depends_on("fmt"),
            stage("test").depends_on("lint"),
        ])
        .unwrap();

        let plan = g.plan(&all(&g)).unwrap();
        assert_eq!(
            plan.batches,
            vec![
                vec!["fmt".to_string(), "audit".to_string()],
                vec!["lint".to_string()],
                vec!["test".to_string()],
            ]
        );
        assert!(plan.disabled.is_empty());
    }

    #[test]
    fn test_cycle_rejected() {
        let err = graph(vec![
            stage("a").depends_on("c"),
            stage("b").depends_on("a"),
            stage("c").after("b"),
        ])
        .unwrap_err();
        assert_eq!(err.code(), Some(codes::CYCLE));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let err = graph(vec![stage("a").depends_on("ghost")]).unwrap_err();
        assert_eq!(err.code(), Some(codes::MISSING_DEP));
    }

    #[test]
    fn test_disabled_dependency_propagates() {
        let g = graph(vec![
            stage("build"),
            stage("optimize").depends_on("build"),
            stage("publish").depends_on("optimize"),
            stage("coverage").after("optimize"),
        ])
        .unwrap();
        let enabled: BTreeSet<String> = ["build", "publish", "coverage"]
            .into_iter()
            .map(String::from)
            .collect();

        let plan = g.plan(&enabled).unwrap();

        assert_eq!(plan.disabled_reason("optimize"), Some(&DisableReason::NotEnabled));
        assert_eq!(
            plan.disabled_reason("publish"),
            Some(&DisableReason::DependencyDisabled {
                upstream: "optimize".to_string()
            })
        );
        // Ordering edge to a disabled stage is dropped.
        assert!(plan.contains("coverage"));
        assert_eq!(plan.batches, vec![vec!["build".to_string(), "coverage".to_string()]]);
    }

    #[test]
    fn test_shared_writer_in_one_batch_rejected() {
        let g = graph(vec![stage("lint").writes("target"), stage("build").writes("target")]).unwrap();
        let err = g.plan(&all(&g)).unwrap_err();
        assert_eq!(err.code(), Some(codes::SHARED_WRITER));
    }

    #[test]
    fn test_after_edge_serializes_writers() {
        let g = graph(vec![
            stage("lint").writes("target"),
            stage("build").writes("target").after("lint"),
        ])
        .unwrap();
        let plan = g.plan(&all(&g)).unwrap();
        assert_eq!(plan.batches.len(), 2);
    }

    #[test]
    fn test_output_reference_needs_hard_dependency() {
        let build = stage("build").with_output(crate::pipeline::OutputSpec::new("wasm", "out.wasm"));
        let optimize = StageSpec::new("optimize", StageKind::Optimize)
            .with_command(CommandSpec::new("stellar", ["contract", "optimize", "--wasm", "${outputs.build.wasm}"]));

        let err = graph(vec![build.clone(), optimize.clone().after("build")]).unwrap_err();
        assert_eq!(err.code(), Some(codes::INVALID_STAGE));

        assert!(graph(vec![build, optimize.depends_on("build")]).is_ok());
    }

    #[test]
    fn test_artifact_must_reference_declared_output() {
        let stages = vec![stage("build")];
        let order = vec!["build".to_string()];
        let map = stages.into_iter().map(|s| (s.id.clone(), s)).collect();
        let artifact = ArtifactSpec::new("wasm", crate::core::ArtifactKind::Binary, "build")
            .with_entry("token.wasm", EntrySource::Output("wasm".to_string()));

        let err = StageGraph::new("test", map, order, vec![artifact]).unwrap_err();
        assert_eq!(err.code(), Some(codes::INVALID_ARTIFACT));
    }

    #[test]
    fn test_artifact_names_cannot_escape_the_sink() {
        let cases = [("../escape", "out.wasm"), ("wasm", "../../etc/x"), ("wasm", "..")];
        for (artifact_name, entry_name) in cases {
            let build = stage("build").with_output(OutputSpec::new("wasm", "target/out.wasm"));
            let order = vec!["build".to_string()];
            let map = std::iter::once((build.id.clone(), build)).collect();
            let artifact = ArtifactSpec::new(artifact_name, crate::core::ArtifactKind::Binary, "build")
                .with_entry(entry_name, EntrySource::Output("wasm".to_string()));

            let err = StageGraph::new("test", map, order, vec![artifact]).unwrap_err();
            assert_eq!(err.code(), Some(codes::INVALID_ARTIFACT), "{artifact_name}/{entry_name}");
        }
    }
}
