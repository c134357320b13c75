//! Error types for the gateflow orchestrator.
//!
//! Errors fall into three families:
//! - configuration errors, raised while validating or planning the stage graph
//!   before any stage runs;
//! - infrastructure errors, raised when the environment cannot carry a run
//!   (missing tool, unreachable cache, missing secret);
//! - sink errors, raised by artifact publication backends.
//!
//! Verification failures (non-zero exits, timeouts) are not errors: they are
//! ordinary stage outcomes recorded in [`crate::core::FailureKind`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for gateflow operations.
#[derive(Debug, Error)]
pub enum GateflowError {
    /// The pipeline definition is invalid.
    #[error("{0}")]
    Configuration(#[from] PipelineValidationError),

    /// The environment could not carry the run.
    #[error("{0}")]
    Infrastructure(#[from] InfrastructureError),

    /// The pipeline definition file could not be parsed.
    #[error("Pipeline definition error: {0}")]
    Definition(String),
}

impl GateflowError {
    /// Returns true for errors raised before any stage executed.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::Definition(_))
    }
}

impl From<serde_yaml::Error> for GateflowError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Definition(err.to_string())
    }
}

/// Metadata about a configuration error for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DiagnosticInfo {
    /// Error code (e.g., "CONFIG-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl DiagnosticInfo {
    /// Creates diagnostic info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Error raised when pipeline validation fails.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PipelineValidationError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
    /// Diagnostic info, when available.
    pub error_info: Option<DiagnosticInfo>,
}

impl PipelineValidationError {
    /// Creates a new pipeline validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
            error_info: None,
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }

    /// Attaches diagnostic info.
    #[must_use]
    pub fn with_error_info(mut self, info: DiagnosticInfo) -> Self {
        self.error_info = Some(info);
        self
    }

    /// Returns the error code, if one was attached.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.error_info.as_ref().map(|info| info.code.as_str())
    }
}

/// Error raised when a cycle is detected in the stage graph.
#[derive(Debug, Clone, Error)]
#[error("Cycle detected in pipeline: {}", cycle_path.join(" -> "))]
pub struct CycleDetectedError {
    /// The path of stages forming the cycle.
    pub cycle_path: Vec<String>,
    /// Diagnostic info.
    pub error_info: DiagnosticInfo,
}

impl CycleDetectedError {
    /// Creates a new cycle detected error.
    #[must_use]
    pub fn new(cycle_path: Vec<String>) -> Self {
        let info = DiagnosticInfo::new(
            codes::CYCLE,
            format!("Pipeline contains a dependency cycle: {}", cycle_path.join(" -> ")),
        )
        .with_fix_hint("Remove one of the `depends_on` or `after` edges in the cycle.");

        Self {
            cycle_path,
            error_info: info,
        }
    }
}

impl From<CycleDetectedError> for PipelineValidationError {
    fn from(err: CycleDetectedError) -> Self {
        Self {
            message: err.to_string(),
            stages: err.cycle_path.clone(),
            error_info: Some(err.error_info),
        }
    }
}

/// Error codes attached to [`PipelineValidationError`].
pub mod codes {
    /// The graph contains a cycle.
    pub const CYCLE: &str = "CONFIG-CYCLE";
    /// A stage references an unknown stage.
    pub const MISSING_DEP: &str = "CONFIG-MISSING-DEP";
    /// Two stages share an id.
    pub const DUPLICATE: &str = "CONFIG-DUPLICATE";
    /// A stage depends on itself.
    pub const SELF_DEP: &str = "CONFIG-SELF-DEP";
    /// The pipeline has no stages.
    pub const EMPTY: &str = "CONFIG-EMPTY";
    /// Two concurrently scheduled stages write the same resource.
    pub const SHARED_WRITER: &str = "CONFIG-SHARED-WRITER";
    /// A stage or command definition is malformed.
    pub const INVALID_STAGE: &str = "CONFIG-INVALID-STAGE";
    /// An artifact references an unknown stage or output.
    pub const INVALID_ARTIFACT: &str = "CONFIG-INVALID-ARTIFACT";
}

/// Errors caused by the environment rather than by the code under test.
///
/// These are fatal regardless of a stage's failure policy: no meaningful
/// signal about source quality can be derived once one occurs.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InfrastructureError {
    /// The program could not be found on `PATH`.
    #[error("Tool not found: {program}")]
    ToolNotFound {
        /// The program name.
        program: String,
    },

    /// The process could not be spawned.
    #[error("Failed to spawn '{program}': {reason}")]
    Spawn {
        /// The program name.
        program: String,
        /// The underlying reason.
        reason: String,
    },

    /// The cache store could not be read or written.
    #[error("Cache store unavailable at {}: {reason}", path.display())]
    CacheUnavailable {
        /// The cache path involved.
        path: PathBuf,
        /// The underlying reason.
        reason: String,
    },

    /// Computing a cache key failed.
    #[error("Failed to hash inputs for cache scope '{scope}': {reason}")]
    Hashing {
        /// The cache scope.
        scope: String,
        /// The underlying reason.
        reason: String,
    },

    /// A command requested a secret that is not present in the run context.
    #[error("Secret '{name}' required by stage '{stage}' is not available")]
    MissingSecret {
        /// The stage requesting it.
        stage: String,
        /// The secret name.
        name: String,
    },

    /// Reading or writing the workspace failed.
    #[error("Workspace I/O failed at {}: {reason}", path.display())]
    Workspace {
        /// The path involved.
        path: PathBuf,
        /// The underlying reason.
        reason: String,
    },

    /// A stage task panicked or was aborted.
    #[error("Stage task '{stage}' aborted: {reason}")]
    TaskAborted {
        /// The stage id.
        stage: String,
        /// The join error.
        reason: String,
    },
}

impl InfrastructureError {
    /// Creates a spawn error.
    #[must_use]
    pub fn spawn(program: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Spawn {
            program: program.into(),
            reason: reason.into(),
        }
    }

    /// Creates a cache unavailable error.
    #[must_use]
    pub fn cache(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::CacheUnavailable {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// Errors raised by artifact sinks.
#[derive(Debug, Clone, Error)]
pub enum SinkError {
    /// A file listed by the artifact does not exist.
    #[error("Artifact '{artifact}' is missing file {}", path.display())]
    MissingFile {
        /// The artifact name.
        artifact: String,
        /// The missing path.
        path: PathBuf,
    },

    /// The backend rejected or failed the upload.
    #[error("Failed to publish artifact '{artifact}': {reason}")]
    Backend {
        /// The artifact name.
        artifact: String,
        /// The underlying reason.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostic_info_creation() {
        let info = DiagnosticInfo::new("TEST-001", "Test error")
            .with_fix_hint("Fix this by doing that")
            .with_context_entry("stage", "lint");

        assert_eq!(info.code, "TEST-001");
        assert_eq!(info.fix_hint, Some("Fix this by doing that".to_string()));
        assert_eq!(info.context.get("stage"), Some(&"lint".to_string()));
    }

    #[test]
    fn test_cycle_detected_error() {
        let err = CycleDetectedError::new(vec![
            "fmt".to_string(),
            "lint".to_string(),
            "fmt".to_string(),
        ]);

        assert!(err.to_string().contains("fmt -> lint -> fmt"));
        assert_eq!(err.error_info.code, codes::CYCLE);

        let validation: PipelineValidationError = err.into();
        assert_eq!(validation.code(), Some(codes::CYCLE));
        assert_eq!(validation.stages.len(), 3);
    }

    #[test]
    fn test_configuration_classification() {
        let err = GateflowError::from(PipelineValidationError::new("bad"));
        assert!(err.is_configuration());

        let cycle = CycleDetectedError::new(vec!["a".to_string(), "b".to_string(), "a".to_string()]);
        let err = GateflowError::from(PipelineValidationError::from(cycle));
        assert!(err.is_configuration());
        assert!(matches!(err, GateflowError::Configuration(_)));

        let err = GateflowError::from(InfrastructureError::ToolNotFound {
            program: "cargo".to_string(),
        });
        assert!(!err.is_configuration());
        assert_eq!(err.to_string(), "Tool not found: cargo");
    }
}
