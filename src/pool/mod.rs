//! pool
//!
//! The mirror directory manager: maps remote URLs onto on-disk bare
//! repositories and owns their lifecycle.
//!
//! # Architecture
//!
//! Mirrors live under a configured base directory, one per canonical
//! remote URL, named by a stable hash of that URL with a `.git` suffix.
//! [`MirrorPool::resolve`] is the only way to obtain a mirror: it creates
//! the bare database on first access (writing the canonical URL into the
//! database config) and touches the `timestamp` marker on every access.
//!
//! All other components borrow mirrors under locks from the embedded
//! [`locks::LockRegistry`]; the pool itself owns the directories. The
//! compactor consults [`MirrorPool::expired_dirs`] and removes mirrors
//! under the exclusive rm lock.
//!
//! # Invariants
//!
//! - Exactly one directory per canonical URL; credential differences do
//!   not multiply mirrors
//! - `resolve` is idempotent and safe under concurrent callers
//! - A mirror is deleted only past its expiry TTL and with `rm.write`
//!   held, so no lock holder can observe a vanishing directory

pub mod errors;
pub mod locks;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::core::config::PoolConfig;
use crate::core::types::RepoUrl;
use crate::error::Error;
use crate::git::repo::MirrorRepo;
use self::locks::{
    LockRegistry, MirrorReadGuard, MirrorWriteGuard, RmReadGuard, RmWriteGuard,
};

/// Name of the last-access marker file inside a mirror.
pub const TIMESTAMP_FILE: &str = "timestamp";

/// A mirror directory handle.
///
/// Plain identity: holding a `MirrorDir` grants no locks.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MirrorDir {
    path: PathBuf,
}

impl MirrorDir {
    /// The directory path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The directory name (`<hash>.git`).
    pub fn name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("<invalid>")
    }
}

impl std::fmt::Display for MirrorDir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Owner of all mirror directories and their locks.
pub struct MirrorPool {
    config: Arc<PoolConfig>,
    locks: LockRegistry,
    invalidated: Mutex<HashSet<PathBuf>>,
}

impl std::fmt::Debug for MirrorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorPool")
            .field("base_dir", &self.config.base_dir)
            .finish_non_exhaustive()
    }
}

impl MirrorPool {
    /// Create a pool rooted at `config.base_dir`, creating the base
    /// directory if needed.
    pub fn new(config: Arc<PoolConfig>) -> Result<Self, Error> {
        std::fs::create_dir_all(&config.base_dir).map_err(|e| {
            Error::internal(
                format!("create mirror base dir {}", config.base_dir.display()),
                e,
            )
        })?;
        Ok(Self {
            config,
            locks: LockRegistry::new(),
            invalidated: Mutex::new(HashSet::new()),
        })
    }

    /// The pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// The base directory all mirrors live under.
    pub fn base_dir(&self) -> &Path {
        &self.config.base_dir
    }

    /// The directory a URL maps to, without touching the filesystem.
    ///
    /// Deterministic: `<hex(sha256(canonical-url))[..40]>.git`.
    pub fn dir_for(&self, url: &RepoUrl) -> MirrorDir {
        let digest = Sha256::digest(url.canonical().as_bytes());
        let name = format!("{}.git", &hex::encode(digest)[..40]);
        MirrorDir {
            path: self.config.base_dir.join(name),
        }
    }

    /// Map a URL to its mirror, creating the bare database on first
    /// access, and update the last-used timestamp.
    ///
    /// Idempotent under concurrent callers: creation is serialized by a
    /// per-path mutex.
    pub fn resolve(&self, url: &RepoUrl) -> Result<MirrorDir, Error> {
        let dir = self.dir_for(url);
        let _creating = self.locks.creation_lock(dir.path());

        if self.invalidated.lock().contains(dir.path()) {
            tracing::info!(dir = %dir, "re-creating invalidated mirror");
            let _ = std::fs::remove_dir_all(dir.path());
        }

        if !is_valid_mirror(dir.path()) {
            tracing::info!(dir = %dir, url = %url, "creating mirror");
            MirrorRepo::init_bare(dir.path(), url.canonical())?;
        }
        self.invalidated.lock().remove(dir.path());

        self.touch(&dir)?;
        Ok(dir)
    }

    /// Update the last-used marker of a mirror.
    pub fn touch(&self, dir: &MirrorDir) -> Result<(), Error> {
        let stamp = Utc::now().to_rfc3339();
        std::fs::write(dir.path().join(TIMESTAMP_FILE), stamp)
            .map_err(|e| Error::internal(format!("touch {}", dir), e))
    }

    /// When the mirror was last resolved.
    ///
    /// Falls back to the directory mtime when the marker file is missing
    /// or unreadable (a mirror created by older code).
    pub fn last_used(&self, dir: &MirrorDir) -> Option<DateTime<Utc>> {
        let marker = dir.path().join(TIMESTAMP_FILE);
        if let Ok(text) = std::fs::read_to_string(&marker) {
            if let Ok(parsed) = DateTime::parse_from_rfc3339(text.trim()) {
                return Some(parsed.with_timezone(&Utc));
            }
        }
        let metadata = std::fs::metadata(dir.path()).ok()?;
        let modified = metadata.modified().ok()?;
        Some(DateTime::<Utc>::from(modified))
    }

    /// Mirrors whose last use is older than the configured TTL.
    pub fn expired_dirs(&self) -> Vec<MirrorDir> {
        let ttl = chrono::Duration::days(self.config.mirror_expiration_days as i64);
        let now = Utc::now();
        self.all_mirror_dirs()
            .into_iter()
            .filter(|dir| match self.last_used(dir) {
                Some(last) => now - last > ttl,
                None => false,
            })
            .collect()
    }

    /// All `*.git` directories under the base, ignoring transient `.gc`
    /// and `.old` siblings.
    pub fn all_mirror_dirs(&self) -> Vec<MirrorDir> {
        let mut dirs = Vec::new();
        let entries = match std::fs::read_dir(&self.config.base_dir) {
            Ok(entries) => entries,
            Err(_) => return dirs,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(".git") {
                dirs.push(MirrorDir { path });
            }
        }
        dirs.sort_by(|a, b| a.path.cmp(&b.path));
        dirs
    }

    /// Leftover `*.git.gc*` directories from crashed compactions.
    pub fn gc_leftover_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        let entries = match std::fs::read_dir(&self.config.base_dir) {
            Ok(entries) => entries,
            Err(_) => return dirs,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.contains(".git.gc") {
                dirs.push(path);
            }
        }
        dirs.sort();
        dirs
    }

    /// The canonical URL recorded inside a mirror, if readable.
    pub fn url_of(&self, dir: &MirrorDir) -> Option<String> {
        MirrorRepo::open(dir.path()).ok()?.remote_url().ok()
    }

    /// Mark a mirror unusable after a failed delete; the next `resolve`
    /// attempts re-creation.
    pub fn invalidate(&self, dir: &MirrorDir) {
        tracing::warn!(dir = %dir, "mirror invalidated");
        self.invalidated.lock().insert(dir.path().to_path_buf());
    }

    /// Run `f` while deletion/renaming of the mirror is disabled
    /// (`rm.read` held for the whole call).
    pub fn run_with_disabled_remove<T>(
        &self,
        dir: &MirrorDir,
        f: impl FnOnce() -> Result<T, Error>,
    ) -> Result<T, Error> {
        let _guard = self.locks.rm_read_lock(dir.path());
        f()
    }

    /// Shared read access for object readers.
    pub fn read_lock(&self, dir: &MirrorDir) -> MirrorReadGuard {
        self.locks.read_lock(dir.path())
    }

    /// Exclusive write access for fetch and in-place gc.
    pub fn write_lock(&self, dir: &MirrorDir) -> MirrorWriteGuard {
        self.locks.write_lock(dir.path())
    }

    /// Removal protection without read access.
    pub fn rm_read_lock(&self, dir: &MirrorDir) -> RmReadGuard {
        self.locks.rm_read_lock(dir.path())
    }

    /// Exclusive removal access for deletion and renaming.
    pub fn rm_write_lock(&self, dir: &MirrorDir) -> RmWriteGuard {
        self.locks.rm_write_lock(dir.path())
    }

    /// Non-blocking attempt at exclusive removal access.
    pub fn try_rm_write_lock(&self, dir: &MirrorDir) -> Option<RmWriteGuard> {
        self.locks.try_rm_write_lock(dir.path())
    }

    /// Rebuild a handle from a raw directory path (directory listings).
    pub fn dir_from_path(&self, path: PathBuf) -> MirrorDir {
        MirrorDir { path }
    }
}

/// A directory is a usable mirror when its object database exists.
fn is_valid_mirror(path: &Path) -> bool {
    path.join("objects").is_dir() && path.join("HEAD").is_file()
}
