//! Human and machine readable run summaries.
//!
//! Every stage is listed with its final state. Failed stages carry the tail of
//! their (already redacted) output; audit stages carry the advisory ids found
//! in theirs.

use crate::core::{RunState, StageKind, StageResult, StageState};
use crate::pipeline::RunReport;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::sync::OnceLock;
use uuid::Uuid;

/// Lines of output kept for failed stages.
pub const TAIL_LINES: usize = 20;

fn advisory_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"RUSTSEC-\d{4}-\d{4}").ok())
        .as_ref()
}

/// Advisory ids mentioned in `text`, sorted and deduplicated.
#[must_use]
pub fn advisories(text: &str) -> Vec<String> {
    let Some(pattern) = advisory_pattern() else {
        return Vec::new();
    };
    pattern
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// One stage line of the summary.
#[derive(Debug, Clone, Serialize)]
pub struct StageLine {
    /// Stage id.
    pub stage: String,
    /// Stage kind.
    pub kind: StageKind,
    /// Final state.
    pub state: StageState,
    /// Failure or skip reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Wall time in milliseconds.
    pub duration_ms: u64,
    /// A declared fallback command was used.
    pub fallback_used: bool,
    /// Commands skipped by an exact cache hit.
    pub cached_commands: usize,
    /// Advisory ids (audit stages only).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub advisories: Vec<String>,
    /// Output tail (failed stages only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tail: Option<String>,
}

impl StageLine {
    fn from_result(result: &StageResult) -> Self {
        let reason = result
            .failure
            .as_ref()
            .map(ToString::to_string)
            .or_else(|| result.skip_reason.as_ref().map(ToString::to_string));
        let advisories = if result.kind == StageKind::Audit {
            let text: String = result
                .commands
                .iter()
                .flat_map(|c| [c.stdout.as_str(), c.stderr.as_str()])
                .collect::<Vec<_>>()
                .join("\n");
            advisories(&text)
        } else {
            Vec::new()
        };
        let output_tail = (result.state == StageState::Failed)
            .then(|| result.output_tail(TAIL_LINES))
            .filter(|tail| !tail.is_empty());

        Self {
            stage: result.stage.clone(),
            kind: result.kind,
            state: result.state,
            reason,
            duration_ms: result.duration_ms,
            fallback_used: result.used_fallback(),
            cached_commands: result.commands.iter().filter(|c| c.skipped_by_cache).count(),
            advisories,
            output_tail,
        }
    }
}

/// One artifact line of the summary.
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactLine {
    /// Artifact name.
    pub name: String,
    /// Whether the sink accepted it.
    pub published: bool,
    /// Sink location when published.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Why it was not published.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Summary of a whole run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Run id.
    pub run_id: Uuid,
    /// Pipeline name.
    pub pipeline: String,
    /// `"<event> to <branch> @ <commit>"`.
    pub trigger: String,
    /// Final run state.
    pub state: RunState,
    /// Process exit code.
    pub exit_code: i32,
    /// Stage lines in declaration order.
    pub stages: Vec<StageLine>,
    /// Artifact lines in declaration order.
    pub artifacts: Vec<ArtifactLine>,
    /// Warnings.
    pub warnings: Vec<String>,
    /// The infrastructure error that aborted the run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub infrastructure_error: Option<String>,
    /// Wall time in milliseconds.
    pub duration_ms: u64,
}

impl RunSummary {
    /// Builds the summary of a finished run.
    #[must_use]
    pub fn from_report(report: &RunReport) -> Self {
        let mut warnings = report.warnings.clone();
        if report.state == RunState::PartiallyFailed {
            let failed: Vec<&str> = report.failures().map(|s| s.stage.as_str()).collect();
            warnings.push(format!(
                "non-blocking stages failed: {}",
                failed.join(", ")
            ));
        }

        Self {
            run_id: report.run_id,
            pipeline: report.pipeline.clone(),
            trigger: format!("{} to {} @ {}", report.event, report.branch, report.commit),
            state: report.state,
            exit_code: report.exit_code(),
            stages: report.stages.iter().map(StageLine::from_result).collect(),
            artifacts: report
                .artifacts
                .iter()
                .map(|a| ArtifactLine {
                    name: a.name.clone(),
                    published: a.is_published(),
                    location: a.receipt.as_ref().map(|r| r.location.clone()),
                    note: a.note.clone(),
                })
                .collect(),
            warnings,
            infrastructure_error: report.infrastructure_error.clone(),
            duration_ms: report.duration_ms,
        }
    }

    /// Pretty-printed JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Plain text for terminals and CI logs.
    #[must_use]
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "pipeline {} ({})", self.pipeline, self.trigger);
        let _ = writeln!(out, "run {}", self.run_id);
        out.push('\n');

        let width = self.stages.iter().map(|s| s.stage.len()).max().unwrap_or(0);
        for stage in &self.stages {
            let _ = write!(
                out,
                "  {:<width$}  {:<9}  {:>7}ms",
                stage.stage,
                stage.state.to_string(),
                stage.duration_ms
            );
            if let Some(reason) = &stage.reason {
                let _ = write!(out, "  {reason}");
            }
            if stage.fallback_used {
                out.push_str("  [fallback used]");
            }
            if stage.cached_commands > 0 {
                let _ = write!(out, "  [{} cached]", stage.cached_commands);
            }
            out.push('\n');
            if !stage.advisories.is_empty() {
                let _ = writeln!(out, "      advisories: {}", stage.advisories.join(", "));
            }
            if let Some(tail) = &stage.output_tail {
                for line in tail.lines() {
                    let _ = writeln!(out, "      | {line}");
                }
            }
        }

        if !self.artifacts.is_empty() {
            out.push_str("\nartifacts:\n");
            for artifact in &self.artifacts {
                match (&artifact.location, &artifact.note) {
                    (Some(location), _) => {
                        let _ = writeln!(out, "  {}  published  {location}", artifact.name);
                    }
                    (None, Some(note)) => {
                        let _ = writeln!(out, "  {}  not published  ({note})", artifact.name);
                    }
                    (None, None) => {
                        let _ = writeln!(out, "  {}  not published", artifact.name);
                    }
                }
            }
        }

        if !self.warnings.is_empty() {
            out.push_str("\nwarnings:\n");
            for warning in &self.warnings {
                let _ = writeln!(out, "  - {warning}");
            }
        }
        if let Some(error) = &self.infrastructure_error {
            let _ = writeln!(out, "\ninfrastructure error: {error}");
        }

        let _ = writeln!(
            out,
            "\nresult: {} (exit {}) in {}ms",
            self.state, self.exit_code, self.duration_ms
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::EventKind;
    use crate::core::{CommandRecord, FailureKind, FailurePolicy, SkipReason};
    use crate::pipeline::ExecutionPlan;
    use crate::trigger::Enablement;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    fn report(stages: Vec<StageResult>, state: RunState) -> RunReport {
        RunReport {
            run_id: Uuid::nil(),
            pipeline: "contract".to_string(),
            event: EventKind::Push,
            branch: "main".to_string(),
            commit: "abc123".to_string(),
            state,
            enablement: Enablement::default(),
            plan: ExecutionPlan::default(),
            stages,
            artifacts: Vec::new(),
            warnings: Vec::new(),
            infrastructure_error: None,
            started_at: Utc::now(),
            duration_ms: 42,
        }
    }

    #[test]
    fn test_advisories_deduplicated() {
        let text = "Crate: time\nID: RUSTSEC-2020-0071\n...\nID: RUSTSEC-2020-0071\nID: RUSTSEC-2023-0052";
        assert_eq!(advisories(text), vec!["RUSTSEC-2020-0071", "RUSTSEC-2023-0052"]);
        assert!(advisories("no vulnerabilities found").is_empty());
    }

    #[test]
    fn test_partial_failure_summary() {
        let mut audit = StageResult::new("audit", StageKind::Audit, FailurePolicy::ContinueAndReport)
            .failed(FailureKind::Verification {
                command: "cargo audit".to_string(),
                exit_code: 1,
            });
        audit.commands.push(CommandRecord {
            command_line: "cargo audit".to_string(),
            stdout: "ID: RUSTSEC-2024-0003\nerror: 1 vulnerability found".to_string(),
            exit_code: Some(1),
            ..Default::default()
        });
        let mut build = StageResult::new("build", StageKind::Build, FailurePolicy::Fatal);
        build.state = StageState::Succeeded;

        let summary = RunSummary::from_report(&report(vec![build, audit], RunState::PartiallyFailed));
        assert_eq!(summary.exit_code, 0);
        assert_eq!(summary.stages[1].advisories, vec!["RUSTSEC-2024-0003"]);
        assert_eq!(
            summary.stages[1].output_tail.as_deref(),
            Some("ID: RUSTSEC-2024-0003\nerror: 1 vulnerability found")
        );
        assert!(summary.warnings.iter().any(|w| w.contains("audit")));

        let text = summary.render_text();
        assert!(text.contains("advisories: RUSTSEC-2024-0003"));
        assert!(text.contains("| error: 1 vulnerability found"));
        assert!(text.contains("result: partially_failed (exit 0)"));
    }

    #[test]
    fn test_skipped_stage_line() {
        let lint = StageResult::new("lint", StageKind::Lint, FailurePolicy::Fatal).skipped(
            SkipReason::UpstreamBlocked {
                upstream: "fmt".to_string(),
                state: StageState::Failed,
            },
        );
        let summary = RunSummary::from_report(&report(vec![lint], RunState::Failed));
        let line = &summary.stages[0];
        assert_eq!(line.reason.as_deref(), Some("upstream stage 'fmt' failed"));
        assert!(line.output_tail.is_none());

        let json: serde_json::Value = serde_json::from_str(&summary.to_json().unwrap()).unwrap();
        assert_eq!(json["state"], "failed");
        assert_eq!(json["exit_code"], 1);
        assert_eq!(json["stages"][0]["state"], "skipped");
    }
}
