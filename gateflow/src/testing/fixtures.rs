//! Temporary workspaces and small pipelines for tests.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

use crate::cache::{CacheBinding, FsCacheStore};
use crate::core::{ArtifactKind, FailurePolicy, StageKind};
use crate::errors::GateflowError;
use crate::pipeline::{
    ArtifactSpec, CommandSpec, EntrySource, OutputSpec, PipelineBuilder, StageGraph, StageSpec,
};
use crate::trigger::TriggerRule;

/// A throwaway checkout plus a cache root, both deleted on drop.
#[derive(Debug)]
pub struct TestWorkspace {
    checkout: TempDir,
    cache: TempDir,
}

impl TestWorkspace {
    /// Creates a checkout with a manifest, a lockfile and one source file.
    pub fn new() -> std::io::Result<Self> {
        let workspace = Self {
            checkout: TempDir::new()?,
            cache: TempDir::new()?,
        };
        workspace.write("Cargo.toml", "[package]\nname = \"contract\"\nversion = \"0.1.0\"\n")?;
        workspace.write("Cargo.lock", "version = 3\n")?;
        workspace.write("src/lib.rs", "pub fn fee() -> u32 { 1 }\n")?;
        Ok(workspace)
    }

    /// The checkout directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.checkout.path()
    }

    /// The cache root.
    #[must_use]
    pub fn cache_root(&self) -> &Path {
        self.cache.path()
    }

    /// Absolute path of a checkout-relative file.
    #[must_use]
    pub fn join(&self, relative: &str) -> PathBuf {
        self.checkout.path().join(relative)
    }

    /// Writes a checkout-relative file, creating parents.
    pub fn write(&self, relative: &str, contents: &str) -> std::io::Result<()> {
        let path = self.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, contents)
    }

    /// Opens a filesystem cache store on the cache root.
    pub fn cache_store(&self) -> Result<Arc<FsCacheStore>, GateflowError> {
        Ok(Arc::new(FsCacheStore::open(self.cache_root())?))
    }
}

/// A five-stage pipeline shaped like the contract pipeline: a fatal
/// `fmt -> lint -> build` chain with a cached `deps` setup stage and an
/// independent continue-and-report `audit` stage.
pub fn sample_pipeline() -> Result<StageGraph, GateflowError> {
    let graph = PipelineBuilder::new("sample")
        .stage(
            StageSpec::new("deps", StageKind::Setup)
                .with_command(CommandSpec::setup("cargo", ["fetch", "--locked"]))
                .with_cache(
                    CacheBinding::new("cargo-registry")
                        .with_path("vendor")
                        .with_lockfile("Cargo.lock"),
                )
                .writes("cargo-home"),
        )?
        .stage(StageSpec::new("fmt", StageKind::Format).with_command(CommandSpec::new("cargo", ["fmt", "--check"])))?
        .stage(
            StageSpec::new("lint", StageKind::Lint)
                .depends_on("fmt")
                .depends_on("deps")
                .with_command(CommandSpec::new("cargo", ["clippy"])),
        )?
        .stage(
            StageSpec::new("build", StageKind::Build)
                .depends_on("lint")
                .with_command(CommandSpec::new("cargo", ["build", "--release"]))
                .with_output(OutputSpec::new("wasm", "target/release/contract.wasm")),
        )?
        .stage(
            StageSpec::new("audit", StageKind::Audit)
                .with_policy(FailurePolicy::ContinueAndReport)
                .with_command(CommandSpec::new("cargo", ["audit"])),
        )?
        .artifact(
            ArtifactSpec::new("contract-wasm", ArtifactKind::Binary, "build")
                .with_entry("contract.wasm", EntrySource::Output("wasm".to_string()))
                .with_publish(TriggerRule::PushToPrimary),
        )
        .artifact(
            ArtifactSpec::new("audit-log", ArtifactKind::AuditLog, "audit")
                .with_entry("audit.log", EntrySource::Captured)
                .with_publish(TriggerRule::PushToPrimary)
                .on_failure(),
        )
        .build()?;
    Ok(graph)
}
