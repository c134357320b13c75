//! Artifact sink writing to a local directory.

use super::ArtifactSink;
use crate::cache::copy_tree;
use crate::core::{Artifact, ArtifactKind, ArtifactSource, PublishReceipt};
use crate::errors::SinkError;
use crate::utils::is_plain_name;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info, warn};
use uuid::Uuid;

const MANIFEST_FILE: &str = "manifest.json";
const STAGING_DIR: &str = ".staging";

/// Metadata written next to every published artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    /// Artifact name.
    pub name: String,
    /// Artifact kind.
    pub kind: ArtifactKind,
    /// Producing run.
    pub run_id: Uuid,
    /// Entry names, in declaration order.
    pub entries: Vec<String>,
    /// Tags.
    pub tags: BTreeMap<String, String>,
    /// Retention period in days.
    pub retention_days: u32,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When the retention sweep may delete the artifact.
    pub expires_at: DateTime<Utc>,
}

/// Publishes artifacts to `<root>/<run_id>/<name>/`.
///
/// Each publish is staged and then renamed into place, so readers never see
/// a partially written artifact.
#[derive(Debug, Clone)]
pub struct FsArtifactSink {
    root: PathBuf,
}

impl FsArtifactSink {
    /// Creates a sink rooted at `root`. The directory is created lazily.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The sink root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where an artifact lands.
    #[must_use]
    pub fn artifact_dir(&self, run_id: Uuid, name: &str) -> PathBuf {
        self.root.join(run_id.to_string()).join(name)
    }

    /// Deletes artifacts whose manifest says they expired before `now`.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Backend`] if the root cannot be listed.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Result<Vec<PathBuf>, SinkError> {
        let backend = |reason: String| SinkError::Backend {
            artifact: "*".to_string(),
            reason,
        };
        let runs = match fs::read_dir(&self.root) {
            Ok(runs) => runs,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(backend(e.to_string())),
        };

        let mut removed = Vec::new();
        for run in runs.flatten() {
            if run.file_name() == STAGING_DIR {
                continue;
            }
            let Ok(artifacts) = fs::read_dir(run.path()) else {
                continue;
            };
            for artifact in artifacts.flatten() {
                let dir = artifact.path();
                let Ok(bytes) = fs::read(dir.join(MANIFEST_FILE)) else {
                    continue;
                };
                let Ok(manifest) = serde_json::from_slice::<ArtifactManifest>(&bytes) else {
                    continue;
                };
                if manifest.expires_at <= now {
                    match fs::remove_dir_all(&dir) {
                        Ok(()) => removed.push(dir),
                        Err(e) => warn!(path = %dir.display(), error = %e, "Failed to remove expired artifact"),
                    }
                }
            }
        }
        info!(removed = removed.len(), "Artifact retention sweep finished");
        Ok(removed)
    }

    fn publish_blocking(&self, artifact: &Artifact) -> Result<PublishReceipt, SinkError> {
        let backend = |reason: String| SinkError::Backend {
            artifact: artifact.name.clone(),
            reason,
        };

        if let Some(bad) = std::iter::once(&artifact.name)
            .chain(artifact.entries.iter().map(|e| &e.name))
            .find(|name| !is_plain_name(name))
        {
            return Err(backend(format!("'{bad}' is not a plain file name")));
        }

        for entry in &artifact.entries {
            match &entry.source {
                ArtifactSource::File(path) | ArtifactSource::Directory(path) if !path.exists() => {
                    return Err(SinkError::MissingFile {
                        artifact: artifact.name.clone(),
                        path: path.clone(),
                    });
                }
                _ => {}
            }
        }

        let staging_root = self.root.join(STAGING_DIR);
        fs::create_dir_all(&staging_root).map_err(|e| backend(e.to_string()))?;
        let staging = TempDir::new_in(&staging_root).map_err(|e| backend(e.to_string()))?;

        for entry in &artifact.entries {
            let destination = staging.path().join(&entry.name);
            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent).map_err(|e| backend(e.to_string()))?;
            }
            let written = match &entry.source {
                ArtifactSource::File(path) => fs::copy(path, &destination).map(|_| ()),
                ArtifactSource::Directory(path) => copy_tree(path, &destination),
                ArtifactSource::Inline(text) => fs::write(&destination, text),
            };
            written.map_err(|e| backend(format!("entry '{}': {e}", entry.name)))?;
        }

        let manifest = ArtifactManifest {
            name: artifact.name.clone(),
            kind: artifact.kind,
            run_id: artifact.run_id,
            entries: artifact.entries.iter().map(|e| e.name.clone()).collect(),
            tags: artifact.tags.clone(),
            retention_days: artifact.retention_days,
            created_at: artifact.created_at,
            expires_at: artifact.expires_at(),
        };
        let manifest_json =
            serde_json::to_vec_pretty(&manifest).map_err(|e| backend(e.to_string()))?;
        fs::write(staging.path().join(MANIFEST_FILE), manifest_json)
            .map_err(|e| backend(e.to_string()))?;

        let target = self.artifact_dir(artifact.run_id, &artifact.name);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| backend(e.to_string()))?;
        }
        let replaced = target.exists();
        if replaced {
            fs::remove_dir_all(&target).map_err(|e| backend(e.to_string()))?;
        }
        fs::rename(staging.path(), &target).map_err(|e| backend(e.to_string()))?;
        drop(staging);

        debug!(artifact = %artifact.name, path = %target.display(), replaced, "Artifact written");
        Ok(PublishReceipt {
            artifact: artifact.name.clone(),
            run_id: artifact.run_id,
            location: target.display().to_string(),
            replaced,
        })
    }
}

#[async_trait]
impl ArtifactSink for FsArtifactSink {
    async fn publish(&self, artifact: &Artifact) -> Result<PublishReceipt, SinkError> {
        let sink = self.clone();
        let owned = artifact.clone();
        tokio::task::spawn_blocking(move || sink.publish_blocking(&owned))
            .await
            .map_err(|e| SinkError::Backend {
                artifact: artifact.name.clone(),
                reason: e.to_string(),
            })?
    }
}
