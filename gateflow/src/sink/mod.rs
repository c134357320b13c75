//! Artifact sinks: where published artifacts go.

mod local;

pub use local::{ArtifactManifest, FsArtifactSink};

use crate::core::{Artifact, PublishReceipt};
use crate::errors::SinkError;
use async_trait::async_trait;

/// Accepts artifacts whose publish gate evaluated true.
///
/// Publishing is idempotent by (artifact name, run id): a second publish for
/// the same pair replaces the first.
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    /// Publishes an artifact.
    async fn publish(&self, artifact: &Artifact) -> Result<PublishReceipt, SinkError>;
}
