//! Persistent cache store.
//!
//! Entries live at `<root>/<platform>/<scope>/<lock16>-<src16>/` and hold an
//! `entry.json` manifest plus a `tree/` directory with one slot per cached
//! path. An entry directory only becomes visible through a `rename` after its
//! manifest has been written, so lookups see either a complete entry or none.

use super::key::{CacheKey, PrefixLevel};
use crate::errors::InfrastructureError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};
use walkdir::WalkDir;

const ENTRY_FILE: &str = "entry.json";
const TREE_DIR: &str = "tree";
const STAGING_DIR: &str = ".staging";
const TRASH_DIR: &str = ".trash";

/// A cache entry found by [`CacheStore::lookup`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHit {
    /// Key of the entry that was found.
    pub key: CacheKey,
    /// `None` for an exact hit, otherwise the prefix level that matched.
    pub level: Option<PrefixLevel>,
    /// When the entry was stored.
    pub created_at: DateTime<Utc>,
    /// Backend-specific location of the entry.
    pub location: PathBuf,
}

impl CacheHit {
    /// Returns true if the exact key was found.
    #[must_use]
    pub fn is_exact(&self) -> bool {
        self.level.is_none()
    }
}

/// Content-addressed store of directory trees.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Finds the exact key, then tries each fallback level in order.
    ///
    /// Among prefix matches the newest entry wins.
    async fn lookup(
        &self,
        key: &CacheKey,
        fallbacks: &[PrefixLevel],
    ) -> Result<Option<CacheHit>, InfrastructureError>;

    /// Copies the entry's tree back onto `destinations`, slot by slot.
    async fn restore(
        &self,
        hit: &CacheHit,
        destinations: &[PathBuf],
    ) -> Result<(), InfrastructureError>;

    /// Persists `sources` under `key`, replacing any previous entry.
    async fn store(&self, key: &CacheKey, sources: &[PathBuf]) -> Result<(), InfrastructureError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum SlotKind {
    File,
    Directory,
    Absent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntryManifest {
    key: CacheKey,
    created_at: DateTime<Utc>,
    slots: Vec<SlotKind>,
}

/// A [`CacheStore`] on the local filesystem.
#[derive(Debug, Clone)]
pub struct FsCacheStore {
    root: PathBuf,
}

impl FsCacheStore {
    /// Opens (creating if needed) a store rooted at `root`.
    ///
    /// Leftovers of interrupted stores are removed.
    ///
    /// # Errors
    ///
    /// Returns [`InfrastructureError::CacheUnavailable`] if the root cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, InfrastructureError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| InfrastructureError::cache(&root, e))?;
        for leftover in [STAGING_DIR, TRASH_DIR] {
            let path = root.join(leftover);
            match fs::remove_dir_all(&path) {
                Ok(()) => debug!(path = %path.display(), "Swept cache leftovers"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to sweep cache leftovers"),
            }
        }
        Ok(Self { root })
    }

    /// The store root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn scope_dir(&self, key: &CacheKey) -> PathBuf {
        self.root.join(&key.platform).join(&key.scope)
    }

    fn entry_dir(&self, key: &CacheKey) -> PathBuf {
        self.scope_dir(key).join(key.entry_name())
    }

    fn lookup_blocking(
        &self,
        key: &CacheKey,
        fallbacks: &[PrefixLevel],
    ) -> Result<Option<CacheHit>, InfrastructureError> {
        let exact = self.entry_dir(key);
        if let Some(manifest) = read_manifest(&exact)? {
            return Ok(Some(CacheHit {
                key: manifest.key,
                level: None,
                created_at: manifest.created_at,
                location: exact,
            }));
        }

        let scope_dir = self.scope_dir(key);
        let entries = match fs::read_dir(&scope_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(InfrastructureError::cache(&scope_dir, e)),
        };

        let mut candidates: Vec<(String, PathBuf, EntryManifest)> = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| InfrastructureError::cache(&scope_dir, e))?;
            if !entry.file_type().is_ok_and(|t| t.is_dir()) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let path = entry.path();
            if let Some(manifest) = read_manifest(&path)? {
                candidates.push((name, path, manifest));
            }
        }

        for level in fallbacks {
            let newest = candidates
                .iter()
                .filter(|(name, _, _)| key.matches_prefix(*level, name))
                .max_by_key(|(_, _, manifest)| manifest.created_at);
            if let Some((_, path, manifest)) = newest {
                return Ok(Some(CacheHit {
                    key: manifest.key.clone(),
                    level: Some(*level),
                    created_at: manifest.created_at,
                    location: path.clone(),
                }));
            }
        }
        Ok(None)
    }

    fn restore_blocking(
        &self,
        hit: &CacheHit,
        destinations: &[PathBuf],
    ) -> Result<(), InfrastructureError> {
        let manifest = read_manifest(&hit.location)?.ok_or_else(|| {
            InfrastructureError::cache(&hit.location, "entry disappeared before restore")
        })?;
        let tree = hit.location.join(TREE_DIR);

        for (index, (slot, destination)) in manifest.slots.iter().zip(destinations).enumerate() {
            let source = tree.join(index.to_string());
            match slot {
                SlotKind::Absent => {}
                SlotKind::File => {
                    if let Some(parent) = destination.parent() {
                        fs::create_dir_all(parent)
                            .map_err(|e| InfrastructureError::cache(parent, e))?;
                    }
                    fs::copy(&source, destination)
                        .map_err(|e| InfrastructureError::cache(&source, e))?;
                }
                SlotKind::Directory => {
                    copy_tree(&source, destination)
                        .map_err(|e| InfrastructureError::cache(&source, e))?;
                }
            }
        }
        Ok(())
    }

    fn store_blocking(&self, key: &CacheKey, sources: &[PathBuf]) -> Result<(), InfrastructureError> {
        let staging_root = self.root.join(STAGING_DIR);
        fs::create_dir_all(&staging_root)
            .map_err(|e| InfrastructureError::cache(&staging_root, e))?;
        let staging =
            TempDir::new_in(&staging_root).map_err(|e| InfrastructureError::cache(&staging_root, e))?;
        let tree = staging.path().join(TREE_DIR);
        fs::create_dir_all(&tree).map_err(|e| InfrastructureError::cache(&tree, e))?;

        let mut slots = Vec::with_capacity(sources.len());
        for (index, source) in sources.iter().enumerate() {
            let slot_path = tree.join(index.to_string());
            let kind = match fs::symlink_metadata(source) {
                Ok(meta) if meta.is_dir() => {
                    copy_tree(source, &slot_path).map_err(|e| InfrastructureError::cache(source, e))?;
                    SlotKind::Directory
                }
                Ok(_) => {
                    fs::copy(source, &slot_path).map_err(|e| InfrastructureError::cache(source, e))?;
                    SlotKind::File
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => SlotKind::Absent,
                Err(e) => return Err(InfrastructureError::cache(source, e)),
            };
            slots.push(kind);
        }

        let manifest = EntryManifest {
            key: key.clone(),
            created_at: Utc::now(),
            slots,
        };
        let manifest_json = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| InfrastructureError::cache(staging.path(), e))?;
        let manifest_path = staging.path().join(ENTRY_FILE);
        fs::write(&manifest_path, manifest_json)
            .map_err(|e| InfrastructureError::cache(&manifest_path, e))?;

        let target = self.entry_dir(key);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| InfrastructureError::cache(parent, e))?;
        }
        self.publish_entry(staging.path(), &target)?;
        debug!(key = %key, path = %target.display(), "Stored cache entry");
        // The staging directory has been renamed away; dropping `staging`
        // finds nothing left to clean.
        drop(staging);
        Ok(())
    }

    /// Moves a fully written staging directory into place.
    fn publish_entry(&self, staged: &Path, target: &Path) -> Result<(), InfrastructureError> {
        // A concurrent writer may land between the trash move and the rename;
        // retry once so the last writer still wins.
        for _ in 0..2 {
            let trashed = self.move_to_trash(target)?;
            let renamed = fs::rename(staged, target);
            if let Some(trashed) = trashed {
                if let Err(e) = fs::remove_dir_all(&trashed) {
                    warn!(path = %trashed.display(), error = %e, "Failed to remove replaced cache entry");
                }
            }
            match renamed {
                Ok(()) => return Ok(()),
                Err(e) if target.exists() => {
                    debug!(path = %target.display(), error = %e, "Cache entry appeared concurrently, retrying");
                }
                Err(e) => return Err(InfrastructureError::cache(target, e)),
            }
        }
        Err(InfrastructureError::cache(target, "entry kept changing during store"))
    }

    fn move_to_trash(&self, target: &Path) -> Result<Option<PathBuf>, InfrastructureError> {
        if !target.exists() {
            return Ok(None);
        }
        let trash_root = self.root.join(TRASH_DIR);
        fs::create_dir_all(&trash_root).map_err(|e| InfrastructureError::cache(&trash_root, e))?;
        let trashed = trash_root.join(crate::utils::generate_uuid_v7().to_string());
        match fs::rename(target, &trashed) {
            Ok(()) => Ok(Some(trashed)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(InfrastructureError::cache(target, e)),
        }
    }
}

#[async_trait]
impl CacheStore for FsCacheStore {
    async fn lookup(
        &self,
        key: &CacheKey,
        fallbacks: &[PrefixLevel],
    ) -> Result<Option<CacheHit>, InfrastructureError> {
        let store = self.clone();
        let key = key.clone();
        let fallbacks = fallbacks.to_vec();
        tokio::task::spawn_blocking(move || store.lookup_blocking(&key, &fallbacks))
            .await
            .map_err(|e| InfrastructureError::cache(&self.root, e))?
    }

    async fn restore(
        &self,
        hit: &CacheHit,
        destinations: &[PathBuf],
    ) -> Result<(), InfrastructureError> {
        let store = self.clone();
        let hit = hit.clone();
        let destinations = destinations.to_vec();
        tokio::task::spawn_blocking(move || store.restore_blocking(&hit, &destinations))
            .await
            .map_err(|e| InfrastructureError::cache(&self.root, e))?
    }

    async fn store(&self, key: &CacheKey, sources: &[PathBuf]) -> Result<(), InfrastructureError> {
        let store = self.clone();
        let key = key.clone();
        let sources = sources.to_vec();
        tokio::task::spawn_blocking(move || store.store_blocking(&key, &sources))
            .await
            .map_err(|e| InfrastructureError::cache(&self.root, e))?
    }
}

/// Reads an entry manifest; a directory without one is not an entry.
fn read_manifest(entry_dir: &Path) -> Result<Option<EntryManifest>, InfrastructureError> {
    let path = entry_dir.join(ENTRY_FILE);
    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(InfrastructureError::cache(&path, e)),
    };
    match serde_json::from_slice(&bytes) {
        Ok(manifest) => Ok(Some(manifest)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring unreadable cache manifest");
            Ok(None)
        }
    }
}

/// Recursively copies `from` onto `to`, overlaying existing content.
pub fn copy_tree(from: &Path, to: &Path) -> io::Result<()> {
    fs::create_dir_all(to)?;
    for entry in WalkDir::new(from).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        let relative = entry.path().strip_prefix(from).map_err(io::Error::other)?;
        let destination = to.join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&destination)?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &destination)?;
        } else {
            fs::copy(entry.path(), &destination)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(link: &Path, destination: &Path) -> io::Result<()> {
    let target = fs::read_link(link)?;
    match fs::remove_file(destination) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    std::os::unix::fs::symlink(target, destination)
}

#[cfg(not(unix))]
fn copy_symlink(link: &Path, destination: &Path) -> io::Result<()> {
    fs::copy(link, destination).map(|_| ())
}
