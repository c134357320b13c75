//! Per-stage and per-command results recorded during a run.

use super::{CommandPhase, FailurePolicy, StageKind, StageState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Why a stage ended up `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FailureKind {
    /// A command exited non-zero.
    Verification {
        /// The command line that failed.
        command: String,
        /// Its exit code (`-1` when killed by a signal).
        exit_code: i32,
    },
    /// A command exceeded the stage's time budget.
    Timeout {
        /// The command line that timed out.
        command: String,
        /// The budget it was given.
        after_ms: u64,
    },
    /// A declared output was not produced.
    MissingOutput {
        /// The output name.
        name: String,
        /// The candidate paths that were checked.
        candidates: Vec<PathBuf>,
    },
    /// The environment broke; fatal regardless of policy.
    Infrastructure {
        /// The error message.
        reason: String,
    },
}

impl FailureKind {
    /// Returns true for failures that abort the whole run.
    #[must_use]
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Infrastructure { .. })
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Verification { command, exit_code } => {
                write!(f, "`{command}` exited with code {exit_code}")
            }
            Self::Timeout { command, after_ms } => {
                write!(f, "`{command}` timed out after {after_ms}ms")
            }
            Self::MissingOutput { name, candidates } => {
                let paths: Vec<String> = candidates.iter().map(|p| p.display().to_string()).collect();
                write!(f, "declared output '{name}' not found (checked {})", paths.join(", "))
            }
            Self::Infrastructure { reason } => write!(f, "infrastructure error: {reason}"),
        }
    }
}

/// Why a stage was `Skipped`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SkipReason {
    /// The event did not trigger this pipeline at all.
    NotTriggered,
    /// The trigger evaluator, or a disabled dependency, disabled the stage.
    Disabled {
        /// Human readable explanation.
        reason: String,
    },
    /// A required upstream stage failed or was itself skipped.
    UpstreamBlocked {
        /// The upstream stage id.
        upstream: String,
        /// The upstream state.
        state: StageState,
    },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotTriggered => write!(f, "event does not trigger this pipeline"),
            Self::Disabled { reason } => write!(f, "{reason}"),
            Self::UpstreamBlocked { upstream, state } => {
                write!(f, "upstream stage '{upstream}' {state}")
            }
        }
    }
}

/// Outcome of a cache lookup for one binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CacheOutcome {
    /// The exact key was present.
    ExactHit,
    /// A declared fallback prefix matched an older entry.
    PrefixHit {
        /// The key of the entry that was restored.
        matched: String,
    },
    /// Nothing reusable was found.
    Miss,
}

/// Cache activity for one binding of a stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheRecord {
    /// The cache scope.
    pub scope: String,
    /// The rendered exact key.
    pub key: String,
    /// What the lookup found.
    pub outcome: CacheOutcome,
    /// Whether the tree was stored after the stage succeeded.
    pub stored: bool,
}

/// Record of one command invocation (or its cache-skip).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandRecord {
    /// Program and arguments; never includes environment values.
    pub command_line: String,
    /// Setup or verify.
    pub phase: CommandPhase,
    /// Exit code, absent when the command did not run or was killed.
    pub exit_code: Option<i32>,
    /// Wall time in milliseconds.
    pub duration_ms: u64,
    /// Captured stdout, secrets redacted.
    pub stdout: String,
    /// Captured stderr, secrets redacted.
    pub stderr: String,
    /// Skipped because every cache binding hit exactly.
    pub skipped_by_cache: bool,
    /// The declared fallback ran because the primary command failed.
    pub fallback_used: bool,
    /// The command hit its timeout.
    pub timed_out: bool,
}

impl CommandRecord {
    /// Creates a record for a command skipped by a cache hit.
    #[must_use]
    pub fn cache_skipped(command_line: impl Into<String>) -> Self {
        Self {
            command_line: command_line.into(),
            phase: CommandPhase::Setup,
            skipped_by_cache: true,
            ..Default::default()
        }
    }
}

/// Final result of one stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    /// The stage id.
    pub stage: String,
    /// The stage kind.
    pub kind: StageKind,
    /// The stage failure policy.
    pub policy: FailurePolicy,
    /// Final state.
    pub state: StageState,
    /// Why it failed, if it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    /// Why it was skipped, if it was.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    /// Commands in execution order.
    #[serde(default)]
    pub commands: Vec<CommandRecord>,
    /// Declared outputs resolved to concrete paths.
    #[serde(default)]
    pub outputs: BTreeMap<String, PathBuf>,
    /// Cache activity.
    #[serde(default)]
    pub caches: Vec<CacheRecord>,
    /// Wall time in milliseconds.
    pub duration_ms: u64,
}

impl StageResult {
    /// Creates a pending result.
    #[must_use]
    pub fn new(stage: impl Into<String>, kind: StageKind, policy: FailurePolicy) -> Self {
        Self {
            stage: stage.into(),
            kind,
            policy,
            state: StageState::Pending,
            failure: None,
            skip_reason: None,
            commands: Vec::new(),
            outputs: BTreeMap::new(),
            caches: Vec::new(),
            duration_ms: 0,
        }
    }

    /// Marks the result skipped.
    #[must_use]
    pub fn skipped(mut self, reason: SkipReason) -> Self {
        self.state = StageState::Skipped;
        self.skip_reason = Some(reason);
        self
    }

    /// Marks the result cancelled.
    #[must_use]
    pub fn cancelled(mut self) -> Self {
        self.state = StageState::Cancelled;
        self
    }

    /// Marks the result failed.
    #[must_use]
    pub fn failed(mut self, failure: FailureKind) -> Self {
        self.state = StageState::Failed;
        self.failure = Some(failure);
        self
    }

    /// Returns true if the stage failed under a fatal policy or broke the infrastructure.
    #[must_use]
    pub fn is_blocking_failure(&self) -> bool {
        self.state == StageState::Failed
            && (self.policy == FailurePolicy::Fatal
                || self.failure.as_ref().is_some_and(FailureKind::is_infrastructure))
    }

    /// Whether any command fell back to its declared alternative.
    #[must_use]
    pub fn used_fallback(&self) -> bool {
        self.commands.iter().any(|c| c.fallback_used)
    }

    /// Returns the last `lines` lines of combined output of the last command that ran.
    #[must_use]
    pub fn output_tail(&self, lines: usize) -> String {
        let Some(last) = self.commands.iter().rev().find(|c| !c.skipped_by_cache) else {
            return String::new();
        };
        let combined = if last.stderr.is_empty() {
            last.stdout.clone()
        } else if last.stdout.is_empty() {
            last.stderr.clone()
        } else {
            format!("{}\n{}", last.stdout.trim_end(), last.stderr)
        };
        tail_lines(&combined, lines)
    }
}

/// Returns the last `lines` lines of `text`.
#[must_use]
pub fn tail_lines(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_tail_uses_last_command() {
        let mut result = StageResult::new("test", StageKind::Test, FailurePolicy::Fatal);
        result.commands.push(CommandRecord {
            command_line: "cargo build".to_string(),
            stdout: "built".to_string(),
            ..Default::default()
        });
        result.commands.push(CommandRecord {
            command_line: "cargo test".to_string(),
            stdout: "a\nb\nc\nd".to_string(),
            stderr: "panicked".to_string(),
            exit_code: Some(101),
            ..Default::default()
        });

        assert_eq!(result.output_tail(2), "d\npanicked");
    }

    #[test]
    fn test_blocking_failure() {
        let verification = FailureKind::Verification {
            command: "cargo audit".to_string(),
            exit_code: 1,
        };

        let fatal = StageResult::new("fmt", StageKind::Format, FailurePolicy::Fatal)
            .failed(verification.clone());
        assert!(fatal.is_blocking_failure());

        let reported = StageResult::new("audit", StageKind::Audit, FailurePolicy::ContinueAndReport)
            .failed(verification);
        assert!(!reported.is_blocking_failure());

        let broken = StageResult::new("audit", StageKind::Audit, FailurePolicy::ContinueAndReport)
            .failed(FailureKind::Infrastructure {
                reason: "cargo-audit missing".to_string(),
            });
        assert!(broken.is_blocking_failure());
    }

    #[test]
    fn test_skip_reason_display() {
        let reason = SkipReason::UpstreamBlocked {
            upstream: "fmt".to_string(),
            state: StageState::Failed,
        };
        assert_eq!(reason.to_string(), "upstream stage 'fmt' failed");
    }

    #[test]
    fn test_failure_kind_serialization() {
        let kind = FailureKind::Timeout {
            command: "cargo test".to_string(),
            after_ms: 1000,
        };
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["type"], "timeout");
        assert_eq!(json["after_ms"], 1000);
    }
}
