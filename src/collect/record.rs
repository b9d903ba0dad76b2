//! collect::record
//!
//! The output shape of change collection: commit-modification records
//! with per-path change kinds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::Oid;

/// What happened to one path in a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    Added,
    Removed,
    Modified,
    Copied,
    Renamed,
    TypeChanged,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ChangeKind::Added => "added",
            ChangeKind::Removed => "removed",
            ChangeKind::Modified => "modified",
            ChangeKind::Copied => "copied",
            ChangeKind::Renamed => "renamed",
            ChangeKind::TypeChanged => "type-changed",
        };
        f.write_str(name)
    }
}

/// One changed path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    /// Repository-relative path; for inlined submodule content the path
    /// is prefixed with the submodule path in the superproject.
    pub path: String,
    pub kind: ChangeKind,
}

impl FileChange {
    pub fn new(path: impl Into<String>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// One commit with its metadata and file changes.
///
/// Produced in reverse-topological order (children before parents) from
/// the `to` state, excluding history reachable from `from`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModificationRecord {
    pub commit: Oid,
    pub parents: Vec<Oid>,
    pub author: String,
    pub author_email: String,
    pub committer: String,
    pub committer_email: String,
    /// Committer timestamp.
    pub timestamp: DateTime<Utc>,
    /// Full commit message.
    pub message: String,
    /// Sorted by path.
    pub file_changes: Vec<FileChange>,
}

impl ModificationRecord {
    /// Whether the commit is a merge.
    pub fn is_merge(&self) -> bool {
        self.parents.len() > 1
    }

    /// The changed paths, in order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.file_changes.iter().map(|c| c.path.as_str())
    }
}
