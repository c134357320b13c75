//! The record of one pipeline run.

use super::graph::ExecutionPlan;
use crate::context::EventKind;
use crate::core::{ArtifactKind, PublishReceipt, RunState, StageResult, StageState};
use crate::trigger::Enablement;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// What happened to one declared artifact.
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactOutcome {
    /// Artifact name.
    pub name: String,
    /// Artifact kind.
    pub kind: ArtifactKind,
    /// Producing stage.
    pub stage: String,
    /// The evaluated publish gate.
    pub publish_gate: bool,
    /// The sink's receipt, if it was published.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt: Option<PublishReceipt>,
    /// Why it was not published, if it was not.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl ArtifactOutcome {
    /// Returns true if the sink accepted the artifact.
    #[must_use]
    pub fn is_published(&self) -> bool {
        self.receipt.is_some()
    }
}

/// Number of stages per final state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageCounts {
    /// Succeeded stages.
    pub succeeded: usize,
    /// Failed stages.
    pub failed: usize,
    /// Skipped stages.
    pub skipped: usize,
    /// Cancelled stages.
    pub cancelled: usize,
}

/// Everything the engine observed during a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Run id.
    pub run_id: Uuid,
    /// Pipeline name.
    pub pipeline: String,
    /// Triggering event.
    pub event: EventKind,
    /// Branch (pushed branch or pull request target).
    pub branch: String,
    /// Commit id.
    pub commit: String,
    /// Final run state.
    pub state: RunState,
    /// Trigger decisions.
    pub enablement: Enablement,
    /// The plan that was executed.
    pub plan: ExecutionPlan,
    /// Stage results in declaration order.
    pub stages: Vec<StageResult>,
    /// Artifact outcomes in declaration order.
    pub artifacts: Vec<ArtifactOutcome>,
    /// Non-fatal problems (cache store failures, fallbacks, sink errors).
    pub warnings: Vec<String>,
    /// The infrastructure error that aborted the run, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub infrastructure_error: Option<String>,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// Wall time in milliseconds.
    pub duration_ms: u64,
}

impl RunReport {
    /// Process exit code for the run.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.state.exit_code()
    }

    /// Looks up a stage result.
    #[must_use]
    pub fn stage(&self, id: &str) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.stage == id)
    }

    /// The final state of a stage.
    #[must_use]
    pub fn stage_state(&self, id: &str) -> Option<StageState> {
        self.stage(id).map(|s| s.state)
    }

    /// Looks up an artifact outcome.
    #[must_use]
    pub fn artifact(&self, name: &str) -> Option<&ArtifactOutcome> {
        self.artifacts.iter().find(|a| a.name == name)
    }

    /// Receipts of every published artifact.
    pub fn published(&self) -> impl Iterator<Item = &PublishReceipt> {
        self.artifacts.iter().filter_map(|a| a.receipt.as_ref())
    }

    /// Stage counts by final state.
    #[must_use]
    pub fn counts(&self) -> StageCounts {
        let mut counts = StageCounts::default();
        for stage in &self.stages {
            match stage.state {
                StageState::Succeeded => counts.succeeded += 1,
                StageState::Failed => counts.failed += 1,
                StageState::Skipped => counts.skipped += 1,
                StageState::Cancelled => counts.cancelled += 1,
                StageState::Pending | StageState::Running => {}
            }
        }
        counts
    }

    /// Failed stages in declaration order.
    pub fn failures(&self) -> impl Iterator<Item = &StageResult> {
        self.stages.iter().filter(|s| s.state == StageState::Failed)
    }
}
