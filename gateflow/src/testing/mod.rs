//! Testing utilities for gateflow pipelines.
//!
//! This module provides:
//! - A scripted tool runner, an in-memory artifact sink and a cache that never hits
//! - Temporary workspaces and a small sample pipeline
//! - Assertions over run reports

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{assert_not_published, assert_published, assert_stage_state, assert_stages};
pub use fixtures::{sample_pipeline, TestWorkspace};
pub use mocks::{
    NullCacheStore, RecordedInvocation, RecordingArtifactSink, Script, ScriptedToolRunner,
};
