//! Scripted collaborators for engine tests.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use uuid::Uuid;

use crate::cache::{CacheHit, CacheKey, CacheStore, PrefixLevel};
use crate::cancellation::CancellationToken;
use crate::core::{Artifact, ArtifactSource, PublishReceipt};
use crate::errors::{InfrastructureError, SinkError};
use crate::runner::{CommandInvocation, CommandOutcome, ToolRunner};
use crate::sink::ArtifactSink;

#[derive(Debug, Clone)]
enum Reply {
    Exit { code: i32, stdout: String, stderr: String },
    Hang,
    Error(InfrastructureError),
}

/// What a scripted command does when invoked.
#[derive(Debug, Clone)]
pub struct Script {
    reply: Reply,
    files: Vec<(String, String)>,
    delay: Option<Duration>,
}

impl Script {
    /// Exits 0 with no output.
    #[must_use]
    pub fn succeed() -> Self {
        Self::exit(0)
    }

    /// Exits with `code` and no output.
    #[must_use]
    pub fn exit(code: i32) -> Self {
        Self {
            reply: Reply::Exit {
                code,
                stdout: String::new(),
                stderr: String::new(),
            },
            files: Vec::new(),
            delay: None,
        }
    }

    /// Runs until cancelled or until the invocation's timeout elapses.
    #[must_use]
    pub fn hang() -> Self {
        Self {
            reply: Reply::Hang,
            files: Vec::new(),
            delay: None,
        }
    }

    /// Fails to run at all.
    #[must_use]
    pub fn error(error: InfrastructureError) -> Self {
        Self {
            reply: Reply::Error(error),
            files: Vec::new(),
            delay: None,
        }
    }

    /// Sets stdout.
    #[must_use]
    pub fn with_stdout(mut self, text: impl Into<String>) -> Self {
        if let Reply::Exit { stdout, .. } = &mut self.reply {
            *stdout = text.into();
        }
        self
    }

    /// Sets stderr.
    #[must_use]
    pub fn with_stderr(mut self, text: impl Into<String>) -> Self {
        if let Reply::Exit { stderr, .. } = &mut self.reply {
            *stderr = text.into();
        }
        self
    }

    /// Writes a workdir-relative file before replying.
    #[must_use]
    pub fn writes_file(mut self, path: impl Into<String>, contents: impl Into<String>) -> Self {
        self.files.push((path.into(), contents.into()));
        self
    }

    /// Sleeps before replying; cancellation cuts the sleep short.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// One command the scripted runner saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedInvocation {
    /// Issuing stage.
    pub stage: String,
    /// Program and arguments.
    pub command_line: String,
    /// Environment, including injected secrets.
    pub env: BTreeMap<String, String>,
    /// Timeout the engine passed.
    pub timeout: Option<Duration>,
}

/// A [`ToolRunner`] that replies from a script instead of spawning processes.
///
/// Rules match on stage id and a command-line prefix; the most recently
/// added matching rule wins. Unmatched commands succeed silently.
#[derive(Debug, Default)]
pub struct ScriptedToolRunner {
    rules: Mutex<Vec<(String, String, Script)>>,
    invocations: Mutex<Vec<RecordedInvocation>>,
}

impl ScriptedToolRunner {
    /// Creates a runner where every command succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts commands of `stage` whose command line starts with `prefix`.
    #[must_use]
    pub fn on(self, stage: impl Into<String>, prefix: impl Into<String>, script: Script) -> Self {
        self.rules.lock().push((stage.into(), prefix.into(), script));
        self
    }

    /// Every recorded invocation in order.
    #[must_use]
    pub fn invocations(&self) -> Vec<RecordedInvocation> {
        self.invocations.lock().clone()
    }

    /// Command lines run for one stage.
    #[must_use]
    pub fn commands_for(&self, stage: &str) -> Vec<String> {
        self.invocations
            .lock()
            .iter()
            .filter(|i| i.stage == stage)
            .map(|i| i.command_line.clone())
            .collect()
    }

    /// Distinct stages that ran at least one command.
    #[must_use]
    pub fn stages_run(&self) -> HashSet<String> {
        self.invocations.lock().iter().map(|i| i.stage.clone()).collect()
    }

    /// Returns true if a command starting with `prefix` ran in `stage`.
    #[must_use]
    pub fn ran(&self, stage: &str, prefix: &str) -> bool {
        self.commands_for(stage).iter().any(|c| c.starts_with(prefix))
    }

    /// Total number of invocations.
    #[must_use]
    pub fn invocation_count(&self) -> usize {
        self.invocations.lock().len()
    }

    fn script_for(&self, stage: &str, command_line: &str) -> Script {
        self.rules
            .lock()
            .iter()
            .rev()
            .find(|(s, prefix, _)| s == stage && command_line.starts_with(prefix.as_str()))
            .map_or_else(Script::succeed, |(_, _, script)| script.clone())
    }
}

fn write_files(workdir: &Path, files: &[(String, String)]) -> Result<(), InfrastructureError> {
    for (relative, contents) in files {
        let path = workdir.join(relative);
        let workspace_error = |e: std::io::Error| InfrastructureError::Workspace {
            path: path.clone(),
            reason: e.to_string(),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(workspace_error)?;
        }
        std::fs::write(&path, contents).map_err(workspace_error)?;
    }
    Ok(())
}

#[async_trait]
impl ToolRunner for ScriptedToolRunner {
    async fn execute(
        &self,
        invocation: &CommandInvocation,
        cancel: &CancellationToken,
    ) -> Result<CommandOutcome, InfrastructureError> {
        let command_line = invocation.command_line();
        self.invocations.lock().push(RecordedInvocation {
            stage: invocation.stage.clone(),
            command_line: command_line.clone(),
            env: invocation.env.clone(),
            timeout: invocation.timeout,
        });
        let script = self.script_for(&invocation.stage, &command_line);

        if let Some(delay) = script.delay {
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancel.cancelled() => {
                    return Ok(CommandOutcome { cancelled: true, ..CommandOutcome::default() });
                }
            }
        }

        match script.reply {
            Reply::Error(error) => Err(error),
            Reply::Hang => {
                let limit = invocation.timeout.unwrap_or(Duration::from_secs(3600));
                tokio::select! {
                    () = tokio::time::sleep(limit) => Ok(CommandOutcome::timeout()),
                    () = cancel.cancelled() => Ok(CommandOutcome { cancelled: true, ..CommandOutcome::default() }),
                }
            }
            Reply::Exit { code, stdout, stderr } => {
                write_files(&invocation.workdir, &script.files)?;
                Ok(CommandOutcome {
                    exit_code: Some(code),
                    stdout: invocation.redactor.redact(&stdout),
                    stderr: invocation.redactor.redact(&stderr),
                    ..CommandOutcome::default()
                })
            }
        }
    }
}

/// An [`ArtifactSink`] that keeps artifacts in memory, keyed by
/// (name, run id).
#[derive(Debug, Default)]
pub struct RecordingArtifactSink {
    artifacts: DashMap<(String, Uuid), Artifact>,
    calls: AtomicUsize,
    failing: Mutex<HashSet<String>>,
}

impl RecordingArtifactSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every publish of `name` fail.
    #[must_use]
    pub fn failing_on(self, name: impl Into<String>) -> Self {
        self.failing.lock().insert(name.into());
        self
    }

    /// Number of publish calls, including failed and replacing ones.
    #[must_use]
    pub fn publish_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Stored artifact names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.artifacts.iter().map(|e| e.key().0.clone()).collect();
        names.sort();
        names
    }

    /// The stored artifact for (name, run).
    #[must_use]
    pub fn get(&self, name: &str, run_id: Uuid) -> Option<Artifact> {
        self.artifacts
            .get(&(name.to_string(), run_id))
            .map(|e| e.value().clone())
    }

    /// Number of stored artifacts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }
}

#[async_trait]
impl ArtifactSink for RecordingArtifactSink {
    async fn publish(&self, artifact: &Artifact) -> Result<PublishReceipt, SinkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().contains(&artifact.name) {
            return Err(SinkError::Backend {
                artifact: artifact.name.clone(),
                reason: "scripted failure".to_string(),
            });
        }
        for entry in &artifact.entries {
            if let ArtifactSource::File(path) | ArtifactSource::Directory(path) = &entry.source {
                if !path.exists() {
                    return Err(SinkError::MissingFile {
                        artifact: artifact.name.clone(),
                        path: path.clone(),
                    });
                }
            }
        }

        let key = (artifact.name.clone(), artifact.run_id);
        let replaced = self.artifacts.insert(key, artifact.clone()).is_some();
        Ok(PublishReceipt {
            artifact: artifact.name.clone(),
            run_id: artifact.run_id,
            location: format!("memory://{}/{}", artifact.run_id, artifact.name),
            replaced,
        })
    }
}

/// A [`CacheStore`] that never hits and discards stores.
///
/// Keys are still computed by the engine, so hashing errors surface.
#[derive(Debug, Default)]
pub struct NullCacheStore {
    stores: AtomicUsize,
}

impl NullCacheStore {
    /// Creates the store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of discarded store calls.
    #[must_use]
    pub fn store_count(&self) -> usize {
        self.stores.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CacheStore for NullCacheStore {
    async fn lookup(
        &self,
        _key: &CacheKey,
        _fallbacks: &[PrefixLevel],
    ) -> Result<Option<CacheHit>, InfrastructureError> {
        Ok(None)
    }

    async fn restore(&self, _hit: &CacheHit, _destinations: &[PathBuf]) -> Result<(), InfrastructureError> {
        Ok(())
    }

    async fn store(&self, _key: &CacheKey, _sources: &[PathBuf]) -> Result<(), InfrastructureError> {
        self.stores.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
