//! Runs a stage graph against a run context.
//!
//! The engine evaluates triggers, plans batches, runs each batch with one
//! tokio task per stage, settles the run state and finally publishes the
//! declared artifacts. It holds no global state: every collaborator is
//! passed in explicitly.

use super::executor::{StageOutcome, StageTask};
use super::graph::{DisableReason, ExecutionPlan, StageGraph};
use super::outputs::OutputMap;
use super::report::{ArtifactOutcome, RunReport};
use super::spec::{ArtifactSpec, EntrySource, StageSpec};
use crate::cache::{host_platform, CacheStore};
use crate::cancellation::CancellationToken;
use crate::context::RunContext;
use crate::core::{
    Artifact, ArtifactKind, ArtifactSource, FailureKind, FailurePolicy, RunState, SkipReason,
    StageKind, StageResult, StageState,
};
use crate::errors::{GateflowError, InfrastructureError, PipelineValidationError};
use crate::events::{names, EventSink, NoOpEventSink};
use crate::runner::ToolRunner;
use crate::sink::ArtifactSink;
use crate::trigger::{Enablement, TriggerEvaluator};
use crate::utils::{elapsed_ms, expand_home};
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// Executes a [`StageGraph`].
pub struct PipelineEngine {
    graph: Arc<StageGraph>,
    runner: Arc<dyn ToolRunner>,
    cache: Arc<dyn CacheStore>,
    sink: Arc<dyn ArtifactSink>,
    events: Arc<dyn EventSink>,
    evaluator: TriggerEvaluator,
    workdir: PathBuf,
    platform: String,
}

impl std::fmt::Debug for PipelineEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineEngine")
            .field("pipeline", &self.graph.name())
            .field("workdir", &self.workdir)
            .field("platform", &self.platform)
            .field("primary_branch", &self.evaluator.primary_branch())
            .finish_non_exhaustive()
    }
}

impl PipelineEngine {
    /// Creates an engine with a no-op event sink, the default trigger
    /// evaluator and the host platform.
    #[must_use]
    pub fn new(
        graph: StageGraph,
        runner: Arc<dyn ToolRunner>,
        cache: Arc<dyn CacheStore>,
        sink: Arc<dyn ArtifactSink>,
        workdir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            graph: Arc::new(graph),
            runner,
            cache,
            sink,
            events: Arc::new(NoOpEventSink),
            evaluator: TriggerEvaluator::default(),
            workdir: workdir.into(),
            platform: host_platform(),
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Sets the trigger evaluator.
    #[must_use]
    pub fn with_evaluator(mut self, evaluator: TriggerEvaluator) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Overrides the platform component of cache keys.
    #[must_use]
    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = platform.into();
        self
    }

    /// The graph this engine runs.
    #[must_use]
    pub fn graph(&self) -> &StageGraph {
        &self.graph
    }

    /// Evaluates triggers and plans batches without running anything.
    ///
    /// # Errors
    ///
    /// Returns an error if two stages in one batch write the same resource.
    pub fn plan(&self, ctx: &RunContext) -> Result<(Enablement, ExecutionPlan), PipelineValidationError> {
        let enablement = self.evaluator.evaluate(&self.graph, ctx);
        let plan = self.graph.plan(&enablement.enabled)?;
        Ok((enablement, plan))
    }

    /// Runs the pipeline to completion.
    ///
    /// Verification failures, cancellation and infrastructure errors are all
    /// reported through the returned [`RunReport`].
    ///
    /// # Errors
    ///
    /// Returns a configuration error, before any stage runs, if the plan
    /// cannot be built.
    pub async fn run(
        &self,
        ctx: &RunContext,
        cancel: Arc<CancellationToken>,
    ) -> Result<RunReport, GateflowError> {
        let started_at = Utc::now();
        let start = Instant::now();
        let (enablement, plan) = self.plan(ctx)?;

        info!(
            run_id = %ctx.run_id,
            pipeline = %self.graph.name(),
            event = %ctx.event,
            branch = %ctx.branch,
            triggered = enablement.triggered,
            batches = plan.batches.len(),
            "Pipeline run started"
        );
        self.events.emit(
            names::RUN_STARTED,
            Some(json!({
                "run_id": ctx.run_id.to_string(),
                "pipeline": self.graph.name(),
                "event": ctx.event,
                "branch": ctx.branch,
                "triggered": enablement.triggered,
                "stages": plan.stage_count(),
            })),
        );

        let mut results: HashMap<String, StageResult> = HashMap::new();
        let mut warnings = Vec::new();
        let mut infrastructure_error: Option<String> = None;

        for disabled in &plan.disabled {
            let Some(spec) = self.graph.stage(&disabled.stage) else {
                continue;
            };
            let reason = if enablement.triggered {
                let text = match &disabled.reason {
                    DisableReason::NotEnabled => enablement
                        .disabled
                        .get(&disabled.stage)
                        .cloned()
                        .unwrap_or_else(|| disabled.reason.to_string()),
                    other => other.to_string(),
                };
                SkipReason::Disabled { reason: text }
            } else {
                SkipReason::NotTriggered
            };
            self.record_skip(&mut results, spec, reason);
        }

        let secrets = ctx.secrets.clone();
        let redactor = secrets.redactor();
        let mut outputs = OutputMap::new();

        for (index, batch) in plan.batches.iter().enumerate() {
            if cancel.is_cancelled() {
                warn!(batch = index, reason = ?cancel.reason(), "Run cancelled, not starting batch");
                for id in batch {
                    if let Some(spec) = self.graph.stage(id) {
                        let result = pending(spec).cancelled();
                        self.emit_stage(names::STAGE_CANCELLED, &result);
                        results.insert(id.clone(), result);
                    }
                }
                continue;
            }

            info!(batch = index, stages = ?batch, "Starting batch");
            let snapshot = Arc::new(outputs.clone());
            let mut running = FuturesUnordered::new();

            for id in batch {
                let Some(spec) = self.graph.stage(id) else {
                    continue;
                };
                if let Some((upstream, state)) = blocking_upstream(spec, &results) {
                    self.record_skip(&mut results, spec, SkipReason::UpstreamBlocked { upstream, state });
                    continue;
                }

                let task = StageTask {
                    spec: spec.clone(),
                    runner: Arc::clone(&self.runner),
                    cache: Arc::clone(&self.cache),
                    events: Arc::clone(&self.events),
                    cancel: Arc::clone(&cancel),
                    workdir: self.workdir.clone(),
                    platform: self.platform.clone(),
                    secrets: secrets.clone(),
                    redactor: redactor.clone(),
                    upstream_outputs: Arc::clone(&snapshot),
                };
                let handle = tokio::spawn(task.run());
                let stage = id.clone();
                running.push(async move { (stage, handle.await) });
            }

            while let Some((stage, joined)) = running.next().await {
                let outcome = match joined {
                    Ok(outcome) => outcome,
                    Err(e) => self.aborted(&stage, &e.to_string()),
                };
                warnings.extend(outcome.warnings);

                if let Some(err) = outcome.infrastructure {
                    if infrastructure_error.is_none() {
                        error!(stage = %stage, error = %err, "Infrastructure error, aborting run");
                        cancel.cancel(format!("infrastructure error in stage '{stage}': {err}"));
                        infrastructure_error = Some(err.to_string());
                    }
                }
                if outcome.result.state == StageState::Succeeded {
                    outputs.insert(stage.clone(), outcome.result.outputs.clone());
                }
                results.insert(stage, outcome.result);
            }
        }

        let stages: Vec<StageResult> = self
            .graph
            .stage_ids()
            .iter()
            .filter_map(|id| results.remove(id))
            .collect();

        let mut state = settle(&stages, infrastructure_error.is_some(), cancel.is_cancelled());

        let mut artifacts = Vec::with_capacity(self.graph.artifacts().len());
        let aborted = infrastructure_error.is_some() || state == RunState::Cancelled;
        for spec in self.graph.artifacts() {
            let (outcome, publish_failed) = self
                .publish_artifact(spec, &stages, &enablement, ctx, aborted, &mut warnings)
                .await;
            if publish_failed && spec.kind == ArtifactKind::Binary {
                state = RunState::Failed;
            }
            artifacts.push(outcome);
        }

        let duration_ms = elapsed_ms(start);
        info!(
            run_id = %ctx.run_id,
            state = %state,
            duration_ms,
            warnings = warnings.len(),
            "Pipeline run completed"
        );
        self.events.emit(
            names::RUN_COMPLETED,
            Some(json!({
                "run_id": ctx.run_id.to_string(),
                "state": state,
                "duration_ms": duration_ms,
                "infrastructure_error": infrastructure_error,
            })),
        );

        Ok(RunReport {
            run_id: ctx.run_id,
            pipeline: self.graph.name().to_string(),
            event: ctx.event,
            branch: ctx.branch.clone(),
            commit: ctx.commit.clone(),
            state,
            enablement,
            plan,
            stages,
            artifacts,
            warnings,
            infrastructure_error,
            started_at,
            duration_ms,
        })
    }

    fn record_skip(&self, results: &mut HashMap<String, StageResult>, spec: &StageSpec, reason: SkipReason) {
        info!(stage = %spec.id, reason = %reason, "Stage skipped");
        let result = pending(spec).skipped(reason);
        self.emit_stage(names::STAGE_SKIPPED, &result);
        results.insert(spec.id.clone(), result);
    }

    fn emit_stage(&self, event: &str, result: &StageResult) {
        self.events.emit(
            event,
            Some(json!({
                "stage": result.stage,
                "state": result.state,
                "reason": result.skip_reason.as_ref().map(ToString::to_string),
            })),
        );
    }

    fn aborted(&self, stage: &str, reason: &str) -> StageOutcome {
        let error = InfrastructureError::TaskAborted {
            stage: stage.to_string(),
            reason: reason.to_string(),
        };
        let result = self.graph.stage(stage).map_or_else(
            || StageResult::new(stage, StageKind::default(), FailurePolicy::Fatal),
            pending,
        );
        let result = result.failed(FailureKind::Infrastructure {
            reason: error.to_string(),
        });
        self.emit_stage(names::STAGE_FAILED, &result);
        StageOutcome {
            result,
            infrastructure: Some(error),
            warnings: Vec::new(),
        }
    }

    async fn publish_artifact(
        &self,
        spec: &ArtifactSpec,
        stages: &[StageResult],
        enablement: &Enablement,
        ctx: &RunContext,
        aborted: bool,
        warnings: &mut Vec<String>,
    ) -> (ArtifactOutcome, bool) {
        let publish_gate = enablement.publish_gate(&spec.name);
        let mut outcome = ArtifactOutcome {
            name: spec.name.clone(),
            kind: spec.kind,
            stage: spec.stage.clone(),
            publish_gate,
            receipt: None,
            note: None,
        };

        if aborted {
            outcome.note = Some("run aborted before publication".to_string());
            return (outcome, false);
        }
        if !publish_gate {
            outcome.note = Some(format!("publish rule '{}' not met", spec.publish));
            return (outcome, false);
        }
        let Some(result) = stages.iter().find(|s| s.stage == spec.stage) else {
            outcome.note = Some(format!("stage '{}' has no result", spec.stage));
            return (outcome, false);
        };
        let producible = match result.state {
            StageState::Succeeded => true,
            StageState::Failed => {
                spec.on_failure && !result.failure.as_ref().is_some_and(FailureKind::is_infrastructure)
            }
            _ => false,
        };
        if !producible {
            outcome.note = Some(format!("stage '{}' {}", spec.stage, result.state));
            return (outcome, false);
        }

        let artifact = match self.assemble(spec, result, ctx) {
            Ok(artifact) => artifact,
            Err(reason) => {
                warn!(artifact = %spec.name, reason = %reason, "Artifact could not be assembled");
                warnings.push(format!("artifact '{}': {reason}", spec.name));
                outcome.note = Some(format!("not published: {reason}"));
                return (outcome, true);
            }
        };

        match self.sink.publish(&artifact).await {
            Ok(receipt) => {
                info!(artifact = %spec.name, location = %receipt.location, replaced = receipt.replaced, "Artifact published");
                self.events.emit(
                    names::ARTIFACT_PUBLISHED,
                    Some(json!({
                        "artifact": spec.name,
                        "kind": spec.kind,
                        "location": receipt.location,
                        "replaced": receipt.replaced,
                    })),
                );
                outcome.receipt = Some(receipt);
                (outcome, false)
            }
            Err(e) => {
                warn!(artifact = %spec.name, error = %e, "Artifact publication failed");
                warnings.push(e.to_string());
                outcome.note = Some(format!("not published: {e}"));
                (outcome, true)
            }
        }
    }

    fn assemble(&self, spec: &ArtifactSpec, result: &StageResult, ctx: &RunContext) -> Result<Artifact, String> {
        let mut artifact = Artifact::new(&spec.name, spec.kind, ctx.run_id)
            .with_retention_days(spec.retention_days)
            .with_publish_gate(true)
            .with_tag("stage", &spec.stage);
        for (key, value) in ctx.artifact_tags() {
            artifact = artifact.with_tag(key, value);
        }

        for entry in &spec.entries {
            let source = match &entry.source {
                EntrySource::Output(name) => {
                    let path = result
                        .outputs
                        .get(name)
                        .ok_or_else(|| format!("output '{name}' of stage '{}' was not produced", spec.stage))?;
                    path_source(path.clone())
                }
                EntrySource::Path(path) => path_source(expand_home(path, &self.workdir)),
                EntrySource::Captured => ArtifactSource::Inline(captured_output(result)),
            };
            artifact = artifact.with_entry(&entry.name, source);
        }
        Ok(artifact)
    }
}

fn pending(spec: &StageSpec) -> StageResult {
    StageResult::new(&spec.id, spec.kind, spec.policy)
}

fn path_source(path: PathBuf) -> ArtifactSource {
    if path.is_dir() {
        ArtifactSource::Directory(path)
    } else {
        ArtifactSource::File(path)
    }
}

/// Concatenated redacted output of every command that ran.
fn captured_output(result: &StageResult) -> String {
    let mut text = String::new();
    for command in result.commands.iter().filter(|c| !c.skipped_by_cache) {
        text.push_str("$ ");
        text.push_str(&command.command_line);
        text.push('\n');
        for stream in [&command.stdout, &command.stderr] {
            if !stream.is_empty() {
                text.push_str(stream);
                if !stream.ends_with('\n') {
                    text.push('\n');
                }
            }
        }
    }
    text
}

/// The first hard dependency that did not let this stage run.
///
/// A continue-and-report failure still lets dependents run; anything else
/// short of success blocks.
fn blocking_upstream(spec: &StageSpec, results: &HashMap<String, StageResult>) -> Option<(String, StageState)> {
    for dep in &spec.depends_on {
        match results.get(dep) {
            Some(r) if r.state == StageState::Succeeded => {}
            Some(r) if r.state == StageState::Failed && !r.is_blocking_failure() => {}
            Some(r) => return Some((dep.clone(), r.state)),
            None => return Some((dep.clone(), StageState::Pending)),
        }
    }
    None
}

fn settle(stages: &[StageResult], infrastructure: bool, cancelled: bool) -> RunState {
    if infrastructure || stages.iter().any(StageResult::is_blocking_failure) {
        RunState::Failed
    } else if cancelled || stages.iter().any(|s| s.state == StageState::Cancelled) {
        RunState::Cancelled
    } else if stages.iter().any(|s| s.state == StageState::Failed) {
        RunState::PartiallyFailed
    } else {
        RunState::Succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CommandRecord;

    fn result(id: &str, policy: FailurePolicy, state: StageState) -> StageResult {
        let mut r = StageResult::new(id, StageKind::Audit, policy);
        r.state = state;
        if state == StageState::Failed {
            r.failure = Some(FailureKind::Verification {
                command: "cargo audit".to_string(),
                exit_code: 1,
            });
        }
        r
    }

    #[test]
    fn test_settle_precedence() {
        let reported = result("audit", FailurePolicy::ContinueAndReport, StageState::Failed);
        let fatal = result("fmt", FailurePolicy::Fatal, StageState::Failed);
        let cancelled = result("test", FailurePolicy::Fatal, StageState::Cancelled);
        let ok = result("build", FailurePolicy::Fatal, StageState::Succeeded);

        assert_eq!(settle(&[ok.clone()], false, false), RunState::Succeeded);
        assert_eq!(settle(&[ok.clone(), reported.clone()], false, false), RunState::PartiallyFailed);
        assert_eq!(settle(&[reported.clone(), cancelled], false, true), RunState::Cancelled);
        assert_eq!(settle(&[fatal, reported], false, true), RunState::Failed);
        assert_eq!(settle(&[ok], true, true), RunState::Failed);
    }

    #[test]
    fn test_blocking_upstream_lets_reported_failures_through() {
        let spec = StageSpec::new("report", StageKind::Coverage)
            .depends_on("audit")
            .depends_on("fmt");
        let mut results = HashMap::new();
        results.insert(
            "audit".to_string(),
            result("audit", FailurePolicy::ContinueAndReport, StageState::Failed),
        );
        results.insert("fmt".to_string(), result("fmt", FailurePolicy::Fatal, StageState::Succeeded));
        assert_eq!(blocking_upstream(&spec, &results), None);

        results.insert("fmt".to_string(), result("fmt", FailurePolicy::Fatal, StageState::Skipped));
        assert_eq!(
            blocking_upstream(&spec, &results),
            Some(("fmt".to_string(), StageState::Skipped))
        );
    }

    #[test]
    fn test_captured_output_skips_cached_commands() {
        let mut r = StageResult::new("audit", StageKind::Audit, FailurePolicy::ContinueAndReport);
        r.commands.push(CommandRecord::cache_skipped("cargo install cargo-audit"));
        r.commands.push(CommandRecord {
            command_line: "cargo audit".to_string(),
            stdout: "Crate: time".to_string(),
            stderr: "error: 1 vulnerability found\n".to_string(),
            exit_code: Some(1),
            ..Default::default()
        });

        assert_eq!(
            captured_output(&r),
            "$ cargo audit\nCrate: time\nerror: 1 vulnerability found\n"
        );
    }
}
