//! Pipeline definitions loaded from YAML.
//!
//! The contract pipeline ships embedded in the binary; a file passed on the
//! command line replaces it wholesale.

mod pipeline;

pub use pipeline::{ArtifactConfig, EntryConfig, PipelineConfig, StageConfig, CONTRACT_PIPELINE};
