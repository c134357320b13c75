//! Cache keys and the bindings they are computed from.

use crate::errors::InfrastructureError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Number of hex characters of each hash used in rendered keys.
pub const SHORT_HASH_LEN: usize = 16;

/// A coarser key under which an older cache entry may be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrefixLevel {
    /// Same platform, scope and lockfile hash; any source hash.
    Lockfile,
    /// Same platform and scope; any lockfile or source hash.
    Scope,
}

impl fmt::Display for PrefixLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lockfile => write!(f, "lockfile"),
            Self::Scope => write!(f, "scope"),
        }
    }
}

/// What a stage caches and which inputs its key depends on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheBinding {
    /// Scope name, e.g. `cargo-registry`.
    pub scope: String,
    /// Paths saved and restored, relative to the workdir or `~/`-prefixed.
    pub paths: Vec<String>,
    /// Globs for files whose content forms the lockfile hash.
    #[serde(default)]
    pub lockfiles: Vec<String>,
    /// Globs for files whose content forms the source hash.
    #[serde(default)]
    pub sources: Vec<String>,
    /// Prefix levels tried, in order, after the exact key misses.
    #[serde(default)]
    pub fallbacks: Vec<PrefixLevel>,
}

impl CacheBinding {
    /// Creates a binding with no inputs and no fallbacks.
    #[must_use]
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            paths: Vec::new(),
            lockfiles: Vec::new(),
            sources: Vec::new(),
            fallbacks: Vec::new(),
        }
    }

    /// Adds a cached path.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.paths.push(path.into());
        self
    }

    /// Adds a lockfile glob.
    #[must_use]
    pub fn with_lockfile(mut self, glob: impl Into<String>) -> Self {
        self.lockfiles.push(glob.into());
        self
    }

    /// Adds a source glob.
    #[must_use]
    pub fn with_source(mut self, glob: impl Into<String>) -> Self {
        self.sources.push(glob.into());
        self
    }

    /// Adds a fallback prefix level.
    #[must_use]
    pub fn with_fallback(mut self, level: PrefixLevel) -> Self {
        self.fallbacks.push(level);
        self
    }
}

/// Content-addressed identity of a cached tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    /// Host platform, e.g. `linux-x86_64`.
    pub platform: String,
    /// Cache scope.
    pub scope: String,
    /// Hex SHA-256 over the lockfile inputs.
    pub lockfile_hash: String,
    /// Hex SHA-256 over the source inputs.
    pub source_hash: String,
}

impl CacheKey {
    /// Creates a key from already computed hashes.
    #[must_use]
    pub fn new(
        platform: impl Into<String>,
        scope: impl Into<String>,
        lockfile_hash: impl Into<String>,
        source_hash: impl Into<String>,
    ) -> Self {
        Self {
            platform: platform.into(),
            scope: scope.into(),
            lockfile_hash: lockfile_hash.into(),
            source_hash: source_hash.into(),
        }
    }

    /// Hashes the binding's inputs under `workdir`.
    ///
    /// Files are hashed in sorted relative-path order, so the key does not
    /// depend on directory iteration order.
    ///
    /// # Errors
    ///
    /// Returns [`InfrastructureError::Hashing`] if a glob is malformed or a
    /// matched file cannot be read.
    pub fn compute(
        binding: &CacheBinding,
        workdir: &Path,
        platform: &str,
    ) -> Result<Self, InfrastructureError> {
        let lockfile_hash = hash_inputs(&binding.scope, workdir, &binding.lockfiles)?;
        let source_hash = hash_inputs(&binding.scope, workdir, &binding.sources)?;
        Ok(Self::new(platform, &binding.scope, lockfile_hash, source_hash))
    }

    /// Folds the commands whose effects the cached tree replaces into the
    /// lockfile hash, so editing them invalidates the entry.
    #[must_use]
    pub fn with_setup_commands(mut self, command_lines: &[String]) -> Self {
        if command_lines.is_empty() {
            return self;
        }
        let mut hasher = Sha256::new();
        hasher.update(self.lockfile_hash.as_bytes());
        for line in command_lines {
            hasher.update([0u8]);
            hasher.update(line.as_bytes());
        }
        self.lockfile_hash = hex::encode(hasher.finalize());
        self
    }

    /// The lockfile hash truncated for rendering.
    #[must_use]
    pub fn lock_short(&self) -> &str {
        short(&self.lockfile_hash)
    }

    /// The source hash truncated for rendering.
    #[must_use]
    pub fn source_short(&self) -> &str {
        short(&self.source_hash)
    }

    /// Directory name of the entry under `<platform>/<scope>/`.
    #[must_use]
    pub fn entry_name(&self) -> String {
        format!("{}-{}", self.lock_short(), self.source_short())
    }

    /// Whether an entry named `entry_name` under this key's scope matches `level`.
    #[must_use]
    pub fn matches_prefix(&self, level: PrefixLevel, entry_name: &str) -> bool {
        match level {
            PrefixLevel::Lockfile => entry_name
                .strip_prefix(self.lock_short())
                .is_some_and(|rest| rest.starts_with('-')),
            PrefixLevel::Scope => true,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}",
            self.platform,
            self.scope,
            self.lock_short(),
            self.source_short()
        )
    }
}

/// The platform component of cache keys for this host.
#[must_use]
pub fn host_platform() -> String {
    format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH)
}

fn short(hash: &str) -> &str {
    hash.get(..SHORT_HASH_LEN).unwrap_or(hash)
}

fn hash_inputs(
    scope: &str,
    workdir: &Path,
    patterns: &[String],
) -> Result<String, InfrastructureError> {
    let hashing_error = |reason: String| InfrastructureError::Hashing {
        scope: scope.to_string(),
        reason,
    };

    // The checkout path is literal; only the declared pattern may glob.
    let base = PathBuf::from(glob::Pattern::escape(&workdir.to_string_lossy()));
    let mut files: Vec<PathBuf> = Vec::new();
    for pattern in patterns {
        let full = base.join(pattern);
        let matches = glob::glob(&full.to_string_lossy())
            .map_err(|e| hashing_error(format!("bad glob '{pattern}': {e}")))?;
        for entry in matches {
            let path = entry.map_err(|e| hashing_error(e.to_string()))?;
            if path.is_dir() {
                for item in WalkDir::new(&path).follow_links(false) {
                    let item = item.map_err(|e| hashing_error(e.to_string()))?;
                    if item.file_type().is_file() {
                        files.push(item.into_path());
                    }
                }
            } else if path.is_file() {
                files.push(path);
            }
        }
    }
    files.sort();
    files.dedup();

    let mut hasher = Sha256::new();
    for file in &files {
        let relative = file.strip_prefix(workdir).unwrap_or(file);
        hasher.update(relative.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        let content = fs::read(file)
            .map_err(|e| hashing_error(format!("{}: {e}", file.display())))?;
        hasher.update(&content);
        hasher.update([0u8]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn workspace() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("Cargo.lock"), "lock-v1").unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/lib.rs"), "pub fn a() {}").unwrap();
        dir
    }

    fn binding() -> CacheBinding {
        CacheBinding::new("build-target")
            .with_path("target")
            .with_lockfile("Cargo.lock")
            .with_source("src/**/*.rs")
    }

    #[test]
    fn test_key_is_stable() {
        let dir = workspace();
        let a = CacheKey::compute(&binding(), dir.path(), "linux-x86_64").unwrap();
        let b = CacheKey::compute(&binding(), dir.path(), "linux-x86_64").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.lockfile_hash.len(), 64);
    }

    #[test]
    fn test_source_change_only_changes_source_hash() {
        let dir = workspace();
        let before = CacheKey::compute(&binding(), dir.path(), "linux-x86_64").unwrap();
        fs::write(dir.path().join("src/lib.rs"), "pub fn b() {}").unwrap();
        let after = CacheKey::compute(&binding(), dir.path(), "linux-x86_64").unwrap();

        assert_eq!(before.lockfile_hash, after.lockfile_hash);
        assert_ne!(before.source_hash, after.source_hash);
        assert!(after.matches_prefix(PrefixLevel::Lockfile, &before.entry_name()));
    }

    #[test]
    fn test_setup_commands_change_lockfile_hash_only() {
        let dir = workspace();
        let base = CacheKey::compute(&binding(), dir.path(), "p").unwrap();
        let install = base
            .clone()
            .with_setup_commands(&["cargo install cargo-audit".to_string()]);
        let more = base
            .clone()
            .with_setup_commands(&["cargo install cargo-audit wasm-opt".to_string()]);

        assert_eq!(base.clone().with_setup_commands(&[]), base);
        assert_ne!(install.lockfile_hash, base.lockfile_hash);
        assert_ne!(install.lockfile_hash, more.lockfile_hash);
        assert_eq!(install.source_hash, base.source_hash);
    }

    #[test]
    fn test_rendered_key_format() {
        let key = CacheKey::new("linux-x86_64", "toolchain", "a".repeat(64), "b".repeat(64));
        assert_eq!(
            key.to_string(),
            format!("linux-x86_64-toolchain-{}-{}", "a".repeat(16), "b".repeat(16))
        );
    }

    #[test]
    fn test_lockfile_prefix_does_not_match_other_lockfile() {
        let key = CacheKey::new("p", "s", "1".repeat(64), "2".repeat(64));
        let other = format!("{}-{}", "3".repeat(16), "2".repeat(16));
        assert!(!key.matches_prefix(PrefixLevel::Lockfile, &other));
        assert!(key.matches_prefix(PrefixLevel::Scope, &other));
    }

    #[test]
    fn test_glob_characters_in_workdir_are_literal() {
        let root = TempDir::new().unwrap();
        let checkout = root.path().join("ci[1]");
        fs::create_dir_all(checkout.join("src")).unwrap();
        fs::write(checkout.join("Cargo.lock"), "lock-v1").unwrap();
        fs::write(checkout.join("src/lib.rs"), "pub fn a() {}").unwrap();
        let empty = CacheKey::compute(&CacheBinding::new("build-target"), &checkout, "p").unwrap();

        let before = CacheKey::compute(&binding(), &checkout, "p").unwrap();
        fs::write(checkout.join("Cargo.lock"), "lock-v2").unwrap();
        let after = CacheKey::compute(&binding(), &checkout, "p").unwrap();

        assert_ne!(before.lockfile_hash, empty.lockfile_hash);
        assert_ne!(before.source_hash, empty.source_hash);
        assert_ne!(before.lockfile_hash, after.lockfile_hash);
    }

    #[test]
    fn test_bad_glob_is_hashing_error() {
        let dir = workspace();
        let binding = CacheBinding::new("x").with_source("src/[");
        let err = CacheKey::compute(&binding, dir.path(), "p").unwrap_err();
        assert!(matches!(err, InfrastructureError::Hashing { .. }));
    }
}
