//! Artifacts handed to the artifact sink.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// The kind of blob an artifact carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// The deployable binary.
    #[default]
    Binary,
    /// Machine-readable coverage, summary text and a browsable tree.
    CoverageReport,
    /// Audit pass/fail plus advisories.
    AuditLog,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Binary => write!(f, "binary"),
            Self::CoverageReport => write!(f, "coverage_report"),
            Self::AuditLog => write!(f, "audit_log"),
        }
    }
}

/// Where the bytes of one artifact entry come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ArtifactSource {
    /// A single file on disk.
    File(PathBuf),
    /// A directory tree on disk.
    Directory(PathBuf),
    /// Text captured by the engine (e.g. redacted tool output).
    Inline(String),
}

/// One named entry inside an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactEntry {
    /// Name of the entry inside the artifact.
    pub name: String,
    /// Content source.
    pub source: ArtifactSource,
}

/// A named blob plus retention and publish gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    /// Artifact name, unique per run.
    pub name: String,
    /// Artifact kind.
    pub kind: ArtifactKind,
    /// The run that produced it.
    pub run_id: Uuid,
    /// Entries in declaration order.
    pub entries: Vec<ArtifactEntry>,
    /// Days after which the retention sweep may delete it.
    pub retention_days: u32,
    /// Free-form tags (commit, branch, event, ...).
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Result of evaluating the publish rule against the run context.
    pub publish_gate: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    /// Creates a new artifact with no entries.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: ArtifactKind, run_id: Uuid) -> Self {
        Self {
            name: name.into(),
            kind,
            run_id,
            entries: Vec::new(),
            retention_days: 30,
            tags: BTreeMap::new(),
            publish_gate: false,
            created_at: Utc::now(),
        }
    }

    /// Adds an entry.
    #[must_use]
    pub fn with_entry(mut self, name: impl Into<String>, source: ArtifactSource) -> Self {
        self.entries.push(ArtifactEntry {
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

    /// Adds a tag.
    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Sets the evaluated publish gate.
    #[must_use]
    pub fn with_publish_gate(mut self, gate: bool) -> Self {
        self.publish_gate = gate;
        self
    }

    /// When the retention sweep may delete this artifact.
    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.created_at + Duration::days(i64::from(self.retention_days))
    }
}

/// Acknowledgement returned by a sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    /// Artifact name.
    pub artifact: String,
    /// Run id.
    pub run_id: Uuid,
    /// Backend-specific location.
    pub location: String,
    /// True if a previous upload for the same (name, run) was replaced.
    pub replaced: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_builder() {
        let run_id = Uuid::new_v4();
        let artifact = Artifact::new("contract-wasm", ArtifactKind::Binary, run_id)
            .with_entry("token.wasm", ArtifactSource::File(PathBuf::from("out/token.wasm")))
            .with_retention_days(90)
            .with_tag("commit", "abc123")
            .with_publish_gate(true);

        assert_eq!(artifact.entries.len(), 1);
        assert_eq!(artifact.tags.get("commit").map(String::as_str), Some("abc123"));
        assert!(artifact.publish_gate);
        assert_eq!(
            artifact.expires_at() - artifact.created_at,
            Duration::days(90)
        );
    }

    #[test]
    fn test_artifact_source_serialization() {
        let source = ArtifactSource::Inline("ok".to_string());
        let json = serde_json::to_value(&source).unwrap();
        assert_eq!(json["type"], "inline");
        assert_eq!(json["value"], "ok");
    }
}
