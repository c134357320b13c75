//! Pipeline declaration, planning and execution.
//!
//! This module provides:
//! - Stage, command, output and artifact declarations
//! - A builder that validates them into a [`StageGraph`]
//! - Batch planning over hard and ordering-only edges
//! - The [`PipelineEngine`] that runs a plan and reports on it

mod builder;
mod engine;
mod executor;
mod graph;
mod outputs;
mod report;
mod spec;


pub use builder::PipelineBuilder;
pub use engine::PipelineEngine;
pub use graph::{DisableReason, DisabledStage, ExecutionPlan, StageGraph};
pub use outputs::{references, substitute, OutputMap};
pub use report::{ArtifactOutcome, RunReport, StageCounts};
pub use spec::{ArtifactEntrySpec, ArtifactSpec, CommandSpec, EntrySource, OutputSpec, StageSpec};
