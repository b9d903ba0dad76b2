//! pool::errors
//!
//! The GC error registry and the process-wide native-git failure cell.
//!
//! # Architecture
//!
//! The compactor never propagates failures; it records them here, keyed
//! by mirror directory, and moves on. Entries survive across compaction
//! rounds until the first successful gc of the affected mirror clears
//! them, so the operator view is stable between retries. `retain` prunes
//! entries for mirrors that no longer exist.
//!
//! A separate process-scope cell holds the last failure to run the
//! configured native git executable at all, so an operator UI can surface
//! "your configured git is broken" independently of any one mirror.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

/// One recorded compaction failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcErrorEntry {
    /// Human-readable failure description.
    pub message: String,
    /// Stringified cause chain, when one was attached.
    pub cause: Option<String>,
    /// When the failure was recorded.
    pub timestamp: DateTime<Utc>,
}

/// Per-mirror last-failure registry.
#[derive(Debug, Default)]
pub struct GcErrors {
    entries: RwLock<BTreeMap<PathBuf, GcErrorEntry>>,
}

impl GcErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record (or replace) the failure entry for a mirror.
    pub fn register(&self, dir: &Path, message: impl Into<String>, cause: Option<&dyn std::fmt::Display>) {
        let entry = GcErrorEntry {
            message: message.into(),
            cause: cause.map(|c| c.to_string()),
            timestamp: Utc::now(),
        };
        tracing::warn!(dir = %dir.display(), error = %entry.message, "gc error registered");
        self.entries.write().insert(dir.to_path_buf(), entry);
    }

    /// Clear the entry for a mirror (first successful gc).
    pub fn clear(&self, dir: &Path) {
        self.entries.write().remove(dir);
    }

    /// Drop entries for mirrors not in `current`.
    pub fn retain(&self, current: &[PathBuf]) {
        let mut entries = self.entries.write();
        entries.retain(|dir, _| current.iter().any(|c| c == dir));
    }

    /// Read-only view for status reporting.
    pub fn snapshot(&self) -> BTreeMap<PathBuf, GcErrorEntry> {
        self.entries.read().clone()
    }

    /// The entry for one mirror, if any.
    pub fn get(&self, dir: &Path) -> Option<GcErrorEntry> {
        self.entries.read().get(dir).cloned()
    }
}

/// The last failure to execute the configured native git at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeGitError {
    /// The configured executable path.
    pub git_path: PathBuf,
    /// What went wrong running it.
    pub message: String,
}

/// Process-scope cell for the last native-git execution error.
#[derive(Debug, Default)]
pub struct NativeGitErrorCell {
    inner: RwLock<Option<NativeGitError>>,
}

impl NativeGitErrorCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure to run the executable at `git_path`.
    pub fn set(&self, git_path: impl Into<PathBuf>, message: impl Into<String>) {
        *self.inner.write() = Some(NativeGitError {
            git_path: git_path.into(),
            message: message.into(),
        });
    }

    /// Clear after a successful execution.
    pub fn clear(&self) {
        *self.inner.write() = None;
    }

    /// The last recorded failure, if any.
    pub fn get(&self) -> Option<NativeGitError> {
        self.inner.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dir(name: &str) -> PathBuf {
        PathBuf::from("/mirrors").join(name)
    }

    #[test]
    fn register_and_clear() {
        let errors = GcErrors::new();
        errors.register(&dir("a.git"), "no disk space", None);
        assert!(errors.get(&dir("a.git")).is_some());

        errors.clear(&dir("a.git"));
        assert!(errors.get(&dir("a.git")).is_none());
    }

    #[test]
    fn register_replaces_previous_entry() {
        let errors = GcErrors::new();
        errors.register(&dir("a.git"), "first", None);
        errors.register(&dir("a.git"), "second", None);
        assert_eq!(errors.get(&dir("a.git")).unwrap().message, "second");
        assert_eq!(errors.snapshot().len(), 1);
    }

    #[test]
    fn cause_is_stringified() {
        let errors = GcErrors::new();
        let cause = std::io::Error::new(std::io::ErrorKind::Other, "rename failed");
        errors.register(&dir("a.git"), "swap failed", Some(&cause));
        let entry = errors.get(&dir("a.git")).unwrap();
        assert_eq!(entry.cause.as_deref(), Some("rename failed"));
    }

    #[test]
    fn retain_prunes_dead_mirrors() {
        let errors = GcErrors::new();
        errors.register(&dir("a.git"), "x", None);
        errors.register(&dir("b.git"), "y", None);

        errors.retain(&[dir("b.git")]);
        assert!(errors.get(&dir("a.git")).is_none());
        assert!(errors.get(&dir("b.git")).is_some());
    }

    #[test]
    fn native_git_cell_set_and_clear() {
        let cell = NativeGitErrorCell::new();
        assert!(cell.get().is_none());

        cell.set("/usr/bin/git", "exec format error");
        let err = cell.get().unwrap();
        assert_eq!(err.git_path, PathBuf::from("/usr/bin/git"));

        cell.clear();
        assert!(cell.get().is_none());
    }
}
