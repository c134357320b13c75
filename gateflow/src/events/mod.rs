//! Lifecycle events emitted by the engine.
//!
//! Every event has a dotted name from [`names`] and an optional JSON payload.
//! Sinks are passed to the engine explicitly; there is no global sink.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// Event names.
pub mod names {
    /// A run began executing its plan.
    pub const RUN_STARTED: &str = "run.started";
    /// A run settled.
    pub const RUN_COMPLETED: &str = "run.completed";
    /// A stage started its commands.
    pub const STAGE_STARTED: &str = "stage.started";
    /// A stage succeeded.
    pub const STAGE_SUCCEEDED: &str = "stage.succeeded";
    /// A stage failed.
    pub const STAGE_FAILED: &str = "stage.failed";
    /// A stage was skipped.
    pub const STAGE_SKIPPED: &str = "stage.skipped";
    /// A stage was cancelled.
    pub const STAGE_CANCELLED: &str = "stage.cancelled";
    /// A cache lookup found an entry.
    pub const CACHE_HIT: &str = "cache.hit";
    /// A cache lookup found nothing.
    pub const CACHE_MISS: &str = "cache.miss";
    /// A cache entry was stored.
    pub const CACHE_STORED: &str = "cache.stored";
    /// An artifact was accepted by the sink.
    pub const ARTIFACT_PUBLISHED: &str = "artifact.published";
}
