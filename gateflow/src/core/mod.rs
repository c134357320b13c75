//! Core domain model types for gateflow.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Stage state, run state, policy and kind enums
//! - Stage and command results
//! - Artifacts and publish receipts

mod artifact;
mod result;
mod status;

pub use artifact::{Artifact, ArtifactEntry, ArtifactKind, ArtifactSource, PublishReceipt};
pub use result::{
    tail_lines, CacheOutcome, CacheRecord, CommandRecord, FailureKind, SkipReason, StageResult,
};
pub use status::{CommandPhase, FailurePolicy, RunState, StageKind, StageState};
