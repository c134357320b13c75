//! Execution of a single stage: cache restore, commands, outputs, cache store.

use super::outputs::{substitute, OutputMap};
use super::spec::{CommandSpec, StageSpec};
use crate::cache::{CacheKey, CacheStore};
use crate::cancellation::CancellationToken;
use crate::context::{Redactor, SecretSet};
use crate::core::{
    CacheOutcome, CacheRecord, CommandPhase, CommandRecord, FailureKind, StageResult, StageState,
};
use crate::errors::InfrastructureError;
use crate::events::{names, EventSink};
use crate::runner::{CommandInvocation, CommandOutcome, ToolRunner};
use crate::utils::{elapsed_ms, expand_home};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Everything one stage task needs; owned so it can be spawned.
pub(crate) struct StageTask {
    pub spec: StageSpec,
    pub runner: Arc<dyn ToolRunner>,
    pub cache: Arc<dyn CacheStore>,
    pub events: Arc<dyn EventSink>,
    pub cancel: Arc<CancellationToken>,
    pub workdir: PathBuf,
    pub platform: String,
    pub secrets: SecretSet,
    pub redactor: Redactor,
    pub upstream_outputs: Arc<OutputMap>,
}

/// What a stage task hands back to the engine.
pub(crate) struct StageOutcome {
    pub result: StageResult,
    pub infrastructure: Option<InfrastructureError>,
    pub warnings: Vec<String>,
}

struct BoundCache {
    key: CacheKey,
    destinations: Vec<PathBuf>,
}

enum CommandStatus {
    Passed,
    Cancelled,
    Failed(FailureKind),
}

enum Invoked {
    Ran(CommandRecord, CommandOutcome),
    NotRun(FailureKind),
}

impl StageTask {
    /// Runs the stage to a terminal state.
    pub async fn run(self) -> StageOutcome {
        let start = Instant::now();
        let mut result = StageResult::new(&self.spec.id, self.spec.kind, self.spec.policy);
        result.state = StageState::Running;
        let mut warnings = Vec::new();

        info!(stage = %self.spec.id, kind = %self.spec.kind, "Stage started");
        self.events.emit(
            names::STAGE_STARTED,
            Some(json!({ "stage": self.spec.id, "kind": self.spec.kind })),
        );

        let infrastructure = match self.execute(&mut result, &mut warnings, start).await {
            Ok(()) => None,
            Err(e) => {
                warn!(stage = %self.spec.id, error = %e, "Infrastructure error");
                result.state = StageState::Failed;
                result.failure = Some(FailureKind::Infrastructure {
                    reason: e.to_string(),
                });
                Some(e)
            }
        };
        result.duration_ms = elapsed_ms(start);
        self.emit_settled(&result);

        StageOutcome {
            result,
            infrastructure,
            warnings,
        }
    }

    async fn execute(
        &self,
        result: &mut StageResult,
        warnings: &mut Vec<String>,
        start: Instant,
    ) -> Result<(), InfrastructureError> {
        for command in self.all_commands() {
            self.command_env(command)?;
        }

        let bound = self.restore_caches(result).await?;
        let all_exact = !result.caches.is_empty()
            && result
                .caches
                .iter()
                .all(|c| c.outcome == CacheOutcome::ExactHit);

        for command in &self.spec.commands {
            if self.cancel.is_cancelled() {
                result.state = StageState::Cancelled;
                return Ok(());
            }
            if command.phase == CommandPhase::Setup && all_exact {
                let line = self.redactor.redact(&display_line(command));
                debug!(stage = %self.spec.id, command = %line, "Setup command skipped by exact cache hit");
                result.commands.push(CommandRecord::cache_skipped(line));
                continue;
            }
            match self.run_command(command, start, result, warnings).await? {
                CommandStatus::Passed => {}
                CommandStatus::Cancelled => {
                    result.state = StageState::Cancelled;
                    return Ok(());
                }
                CommandStatus::Failed(failure) => {
                    result.state = StageState::Failed;
                    result.failure = Some(failure);
                    return Ok(());
                }
            }
        }

        for output in &self.spec.outputs {
            let candidates: Vec<PathBuf> = output
                .candidates()
                .map(|c| expand_home(c, &self.workdir))
                .collect();
            match candidates.iter().find(|p| p.exists()) {
                Some(path) => {
                    if path != &candidates[0] {
                        info!(stage = %self.spec.id, output = %output.name, path = %path.display(), "Output found at alternate path");
                    }
                    result.outputs.insert(output.name.clone(), path.clone());
                }
                None => {
                    result.state = StageState::Failed;
                    result.failure = Some(FailureKind::MissingOutput {
                        name: output.name.clone(),
                        candidates,
                    });
                    return Ok(());
                }
            }
        }

        if self.cancel.is_cancelled() {
            result.state = StageState::Cancelled;
            return Ok(());
        }

        self.store_caches(&bound, result, warnings).await;
        result.state = StageState::Succeeded;
        Ok(())
    }

    fn all_commands(&self) -> Vec<&CommandSpec> {
        let mut commands = Vec::new();
        for command in &self.spec.commands {
            commands.push(command);
            if let Some(fallback) = command.fallback.as_deref() {
                commands.push(fallback);
            }
        }
        commands
    }

    fn command_env(&self, command: &CommandSpec) -> Result<BTreeMap<String, String>, InfrastructureError> {
        let mut env = command.env.clone();
        for name in &command.secrets {
            let value = self
                .secrets
                .get(name)
                .ok_or_else(|| InfrastructureError::MissingSecret {
                    stage: self.spec.id.clone(),
                    name: name.clone(),
                })?;
            env.insert(name.clone(), value.to_string());
        }
        Ok(env)
    }

    async fn restore_caches(
        &self,
        result: &mut StageResult,
    ) -> Result<Vec<BoundCache>, InfrastructureError> {
        let setup_lines: Vec<String> = self
            .all_commands()
            .into_iter()
            .filter(|c| c.phase == CommandPhase::Setup)
            .map(display_line)
            .collect();
        let mut bound = Vec::with_capacity(self.spec.caches.len());
        for binding in &self.spec.caches {
            let key = {
                let owned = binding.clone();
                let workdir = self.workdir.clone();
                let platform = self.platform.clone();
                tokio::task::spawn_blocking(move || CacheKey::compute(&owned, &workdir, &platform))
                    .await
                    .map_err(|e| InfrastructureError::Hashing {
                        scope: binding.scope.clone(),
                        reason: e.to_string(),
                    })??
                    .with_setup_commands(&setup_lines)
            };
            let destinations: Vec<PathBuf> = binding
                .paths
                .iter()
                .map(|p| expand_home(p, &self.workdir))
                .collect();

            let outcome = match self.cache.lookup(&key, &binding.fallbacks).await? {
                Some(hit) => {
                    self.cache.restore(&hit, &destinations).await?;
                    info!(stage = %self.spec.id, key = %key, matched = %hit.key, exact = hit.is_exact(), "Cache hit");
                    self.events.emit(
                        names::CACHE_HIT,
                        Some(json!({
                            "stage": self.spec.id,
                            "scope": binding.scope,
                            "key": key.to_string(),
                            "matched": hit.key.to_string(),
                            "exact": hit.is_exact(),
                        })),
                    );
                    if hit.is_exact() {
                        CacheOutcome::ExactHit
                    } else {
                        CacheOutcome::PrefixHit {
                            matched: hit.key.to_string(),
                        }
                    }
                }
                None => {
                    info!(stage = %self.spec.id, key = %key, "Cache miss");
                    self.events.emit(
                        names::CACHE_MISS,
                        Some(json!({ "stage": self.spec.id, "scope": binding.scope, "key": key.to_string() })),
                    );
                    CacheOutcome::Miss
                }
            };

            result.caches.push(CacheRecord {
                scope: binding.scope.clone(),
                key: key.to_string(),
                outcome,
                stored: false,
            });
            bound.push(BoundCache { key, destinations });
        }
        Ok(bound)
    }

    /// Store failures are tolerated: a lost update only costs a future miss.
    async fn store_caches(
        &self,
        bound: &[BoundCache],
        result: &mut StageResult,
        warnings: &mut Vec<String>,
    ) {
        for (record, cache) in result.caches.iter_mut().zip(bound) {
            if record.outcome == CacheOutcome::ExactHit {
                continue;
            }
            match self.cache.store(&cache.key, &cache.destinations).await {
                Ok(()) => {
                    record.stored = true;
                    self.events.emit(
                        names::CACHE_STORED,
                        Some(json!({ "stage": self.spec.id, "scope": record.scope, "key": record.key })),
                    );
                }
                Err(e) => {
                    warn!(stage = %self.spec.id, key = %record.key, error = %e, "Cache store failed");
                    warnings.push(format!(
                        "stage '{}': storing cache scope '{}' failed: {e}",
                        self.spec.id, record.scope
                    ));
                }
            }
        }
    }

    async fn run_command(
        &self,
        command: &CommandSpec,
        start: Instant,
        result: &mut StageResult,
        warnings: &mut Vec<String>,
    ) -> Result<CommandStatus, InfrastructureError> {
        let (record, outcome) = match self.invoke(command, start).await? {
            Invoked::Ran(record, outcome) => (record, outcome),
            Invoked::NotRun(failure) => return Ok(CommandStatus::Failed(failure)),
        };
        let primary_line = record.command_line.clone();
        result.commands.push(record);

        if outcome.cancelled {
            return Ok(CommandStatus::Cancelled);
        }
        if outcome.success() {
            self.write_stdout(command, &outcome).await?;
            return Ok(CommandStatus::Passed);
        }
        if outcome.timed_out {
            return Ok(CommandStatus::Failed(self.timeout_failure(primary_line)));
        }
        let Some(fallback) = command.fallback.as_deref() else {
            return Ok(CommandStatus::Failed(FailureKind::Verification {
                command: primary_line,
                exit_code: outcome.exit_code.unwrap_or(-1),
            }));
        };

        let fallback_line = self.redactor.redact(&display_line(fallback));
        warn!(
            stage = %self.spec.id,
            command = %primary_line,
            fallback = %fallback_line,
            "Command failed, trying declared fallback"
        );
        let (mut record, outcome) = match self.invoke(fallback, start).await? {
            Invoked::Ran(record, outcome) => (record, outcome),
            Invoked::NotRun(failure) => return Ok(CommandStatus::Failed(failure)),
        };
        record.fallback_used = true;
        let line = record.command_line.clone();
        result.commands.push(record);

        if outcome.cancelled {
            return Ok(CommandStatus::Cancelled);
        }
        if outcome.success() {
            self.write_stdout(fallback, &outcome).await?;
            warnings.push(format!(
                "stage '{}': `{primary_line}` failed, fallback `{line}` used",
                self.spec.id
            ));
            return Ok(CommandStatus::Passed);
        }
        if outcome.timed_out {
            return Ok(CommandStatus::Failed(self.timeout_failure(line)));
        }
        Ok(CommandStatus::Failed(FailureKind::Verification {
            command: line,
            exit_code: outcome.exit_code.unwrap_or(-1),
        }))
    }

    async fn invoke(&self, command: &CommandSpec, start: Instant) -> Result<Invoked, InfrastructureError> {
        let mut args = Vec::with_capacity(command.args.len());
        for arg in &command.args {
            match substitute(arg, &self.upstream_outputs) {
                Ok(arg) => args.push(arg),
                Err(reference) => {
                    return Ok(Invoked::NotRun(FailureKind::MissingOutput {
                        name: reference,
                        candidates: Vec::new(),
                    }));
                }
            }
        }

        let mut invocation = CommandInvocation::new(&self.spec.id, &command.program, &self.workdir)
            .with_args(args)
            .with_redactor(self.redactor.clone());
        invocation.env = self.command_env(command)?;

        if let Some(budget) = self.spec.timeout {
            let remaining = budget.saturating_sub(start.elapsed());
            if remaining == Duration::ZERO {
                let line = self.redactor.redact(&invocation.command_line());
                return Ok(Invoked::NotRun(self.timeout_failure(line)));
            }
            invocation.timeout = Some(remaining);
        }

        let line = self.redactor.redact(&invocation.command_line());
        let outcome = self.runner.execute(&invocation, &self.cancel).await?;
        let record = CommandRecord {
            command_line: line,
            phase: command.phase,
            exit_code: outcome.exit_code,
            duration_ms: outcome.duration_ms,
            stdout: outcome.stdout.clone(),
            stderr: outcome.stderr.clone(),
            skipped_by_cache: false,
            fallback_used: false,
            timed_out: outcome.timed_out,
        };
        Ok(Invoked::Ran(record, outcome))
    }

    async fn write_stdout(
        &self,
        command: &CommandSpec,
        outcome: &CommandOutcome,
    ) -> Result<(), InfrastructureError> {
        let Some(target) = &command.stdout_to else {
            return Ok(());
        };
        let path = expand_home(target, &self.workdir);
        let workspace_error = |e: std::io::Error| InfrastructureError::Workspace {
            path: path.clone(),
            reason: e.to_string(),
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(workspace_error)?;
        }
        tokio::fs::write(&path, &outcome.stdout)
            .await
            .map_err(workspace_error)
    }

    fn timeout_failure(&self, command: String) -> FailureKind {
        let after_ms = self
            .spec
            .timeout
            .map_or(0, |t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX));
        FailureKind::Timeout { command, after_ms }
    }

    fn emit_settled(&self, result: &StageResult) {
        let event = match result.state {
            StageState::Succeeded => names::STAGE_SUCCEEDED,
            StageState::Failed => names::STAGE_FAILED,
            StageState::Cancelled => names::STAGE_CANCELLED,
            StageState::Skipped => names::STAGE_SKIPPED,
            StageState::Pending | StageState::Running => return,
        };
        match &result.failure {
            Some(failure) => {
                warn!(stage = %result.stage, state = %result.state, failure = %failure, "Stage settled");
            }
            None => {
                info!(stage = %result.stage, state = %result.state, duration_ms = result.duration_ms, "Stage settled");
            }
        }
        self.events.emit(
            event,
            Some(json!({
                "stage": result.stage,
                "state": result.state,
                "duration_ms": result.duration_ms,
                "failure": result.failure.as_ref().map(ToString::to_string),
            })),
        );
    }
}

fn display_line(command: &CommandSpec) -> String {
    CommandInvocation::new("", &command.program, ".")
        .with_args(command.args.iter().cloned())
        .command_line()
}
