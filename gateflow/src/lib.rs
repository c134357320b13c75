//! # Gateflow
//!
//! A cached, trigger-aware build and verification pipeline for
//! smart-contract artifacts.
//!
//! Gateflow runs a declared graph of stages (toolchain setup, dependency
//! fetch, format, lint, test, build, optimize, coverage, audit) with:
//!
//! - **Dependency-ordered batches**: stages in a batch run concurrently,
//!   and a batch may not contain two writers of the same resource
//! - **Content-addressed caches**: keyed by platform, scope, and the hashes
//!   of lockfiles and sources, with explicit prefix fallbacks
//! - **Trigger gating**: which stages run and which artifacts publish
//!   depends on the event kind and the target branch
//! - **Failure policies**: fatal stages block their dependents; report-only
//!   stages are surfaced without blocking
//! - **Artifact publication**: the optimized binary, coverage report, and
//!   audit log go to an [`sink::ArtifactSink`]
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use gateflow::prelude::*;
//!
//! let graph = PipelineConfig::builtin()?.into_graph()?;
//! let engine = PipelineEngine::new(
//!     graph,
//!     Arc::new(ProcessToolRunner::new()),
//!     Arc::new(FsCacheStore::open("/var/cache/gateflow")?),
//!     Arc::new(FsArtifactSink::new("artifacts")),
//!     ".",
//! );
//!
//! let report = engine
//!     .run(&RunContext::push("main", "4f2a9c1"), Arc::new(CancellationToken::new()))
//!     .await?;
//! println!("{}", RunSummary::from_report(&report).render_text());
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cache;
pub mod cancellation;
pub mod cli;
pub mod config;
pub mod context;
pub mod core;
pub mod errors;
pub mod events;
pub mod observability;
pub mod pipeline;
pub mod runner;
pub mod sink;
pub mod summary;
pub mod testing;
pub mod trigger;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cache::{CacheBinding, CacheKey, CacheStore, FsCacheStore, PrefixLevel};
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::PipelineConfig;
    pub use crate::context::{EventKind, RunContext, SecretSet};
    pub use crate::core::{
        Artifact, ArtifactKind, FailureKind, FailurePolicy, RunState, SkipReason, StageKind,
        StageResult, StageState,
    };
    pub use crate::errors::{
        GateflowError, InfrastructureError, PipelineValidationError, SinkError,
    };
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::pipeline::{
        ArtifactSpec, CommandSpec, OutputSpec, PipelineBuilder, PipelineEngine, RunReport,
        StageGraph, StageSpec,
    };
    pub use crate::runner::{CommandInvocation, CommandOutcome, ProcessToolRunner, ToolRunner};
    pub use crate::sink::{ArtifactSink, FsArtifactSink};
    pub use crate::summary::RunSummary;
    pub use crate::trigger::{TriggerEvaluator, TriggerRule};
    pub use std::sync::Arc;
}
