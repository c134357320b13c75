//! Stage state, run state, policy and kind enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of work a stage performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Installs toolchains or fetches dependencies.
    Setup,
    /// Checks source formatting.
    Format,
    /// Runs static analysis.
    Lint,
    /// Runs the unit test suite.
    Test,
    /// Compiles the deployable binary.
    #[default]
    Build,
    /// Shrinks the compiled binary.
    Optimize,
    /// Produces coverage reports.
    Coverage,
    /// Scans dependencies for advisories.
    Audit,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Setup => write!(f, "setup"),
            Self::Format => write!(f, "format"),
            Self::Lint => write!(f, "lint"),
            Self::Test => write!(f, "test"),
            Self::Build => write!(f, "build"),
            Self::Optimize => write!(f, "optimize"),
            Self::Coverage => write!(f, "coverage"),
            Self::Audit => write!(f, "audit"),
        }
    }
}

/// What a stage failure means for the rest of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Dependents are skipped and the run fails.
    #[default]
    Fatal,
    /// The failure is reported but blocks nothing.
    ContinueAndReport,
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fatal => write!(f, "fatal"),
            Self::ContinueAndReport => write!(f, "continue-and-report"),
        }
    }
}

/// Whether a command prepares the environment or checks the code.
///
/// Setup commands may be skipped on an exact cache hit; verify commands
/// always run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandPhase {
    /// Toolchain install, dependency fetch.
    Setup,
    /// Format, lint, test, build.
    #[default]
    Verify,
}

/// The execution state of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    /// Stage is waiting for its batch.
    #[default]
    Pending,
    /// Stage is executing commands.
    Running,
    /// Every command exited 0 and every declared output exists.
    Succeeded,
    /// A command failed, timed out, or an output was missing.
    Failed,
    /// Stage was disabled or blocked by an upstream failure.
    Skipped,
    /// The run was cancelled before the stage settled.
    Cancelled,
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl StageState {
    /// Returns true if the state is final for this run.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }
}

/// The overall state of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// The run has been created but not started.
    #[default]
    Pending,
    /// Batches are executing.
    Running,
    /// Every enabled stage succeeded.
    Succeeded,
    /// Only continue-and-report stages failed.
    PartiallyFailed,
    /// A fatal stage failed or the infrastructure broke.
    Failed,
    /// The run was cancelled.
    Cancelled,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::PartiallyFailed => write!(f, "partially_failed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl RunState {
    /// Process exit code for this run state.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Succeeded | Self::PartiallyFailed => 0,
            Self::Cancelled => 130,
            Self::Pending | Self::Running | Self::Failed => 1,
        }
    }
}
