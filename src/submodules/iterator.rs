//! submodules::iterator
//!
//! Tree-entry ordering when submodules are reinterpreted as directories.
//!
//! # The ordering wrinkle
//!
//! In git tree storage, directory entries sort by `name/` (trailing
//! slash) while submodule entries sort by plain `name`, like files. The
//! three names `a`, `a.c`, `a0c` therefore sort as
//!
//! - `a`, `a.c`, `a0c` when `a` is a submodule
//! - `a.c`, `a`, `a0c` when `a` is a directory (`.` < `/` < `0`)
//!
//! When the walker treats a submodule as a directory (to inline the
//! sub-repository's content), sibling order must follow the directory
//! interpretation or combined diffs mis-align across commits. The
//! positional remap below is a precomputed index array translating
//! effective positions back to storage positions.

use crate::git::repo::GITLINK_FILEMODE;

/// What a tree entry is, as far as ordering is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Submodule,
}

/// One tree entry: name plus ordering-relevant kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntryInfo {
    pub name: String,
    pub kind: EntryKind,
}

impl TreeEntryInfo {
    pub fn new(name: impl Into<String>, kind: EntryKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    /// Sort key in on-disk tree storage.
    fn storage_key(&self) -> String {
        match self.kind {
            EntryKind::Dir => format!("{}/", self.name),
            _ => self.name.clone(),
        }
    }

    /// Sort key when submodules are reinterpreted as directories.
    fn effective_key(&self) -> String {
        match self.kind {
            EntryKind::Dir | EntryKind::Submodule => format!("{}/", self.name),
            EntryKind::File => self.name.clone(),
        }
    }
}

/// Shared traversal surface over both orderings.
pub trait EntryTraversal {
    /// Number of entries.
    fn len(&self) -> usize;

    /// The entry at `pos` in effective (submodule-as-directory) order.
    fn entry_at(&self, pos: usize) -> &TreeEntryInfo;

    /// Whether the tree has no entries.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Entries whose storage order already matches the effective order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectEntries {
    entries: Vec<TreeEntryInfo>,
}

impl EntryTraversal for DirectEntries {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn entry_at(&self, pos: usize) -> &TreeEntryInfo {
        &self.entries[pos]
    }
}

/// Entries that need the positional remap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemappedEntries {
    entries: Vec<TreeEntryInfo>,
    /// `mapping[effective_pos] == storage_pos`.
    mapping: Vec<usize>,
}

impl RemappedEntries {
    /// The index array: effective position to storage position.
    pub fn mapping(&self) -> &[usize] {
        &self.mapping
    }
}

impl EntryTraversal for RemappedEntries {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn entry_at(&self, pos: usize) -> &TreeEntryInfo {
        &self.entries[self.mapping[pos]]
    }
}

/// Tree entries in submodule-as-directory order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmoduleAwareEntries {
    Direct(DirectEntries),
    Remapped(RemappedEntries),
}

impl SubmoduleAwareEntries {
    /// Build from entries given in storage order.
    ///
    /// Falls into the `Direct` variant when no submodule changes its
    /// position, which is the common case.
    pub fn new(entries: Vec<TreeEntryInfo>) -> Self {
        let mapping = positional_remap(&entries);
        match mapping {
            Some(mapping) => Self::Remapped(RemappedEntries { entries, mapping }),
            None => Self::Direct(DirectEntries { entries }),
        }
    }

    /// Build from a git2 tree's immediate entries.
    pub fn from_tree(tree: &git2::Tree<'_>) -> Self {
        let mut entries = Vec::with_capacity(tree.len());
        for entry in tree.iter() {
            let name = entry.name().unwrap_or_default().to_string();
            let kind = if entry.filemode() == GITLINK_FILEMODE {
                EntryKind::Submodule
            } else if entry.kind() == Some(git2::ObjectType::Tree) {
                EntryKind::Dir
            } else {
                EntryKind::File
            };
            entries.push(TreeEntryInfo::new(name, kind));
        }
        // git2 yields entries in storage order already.
        Self::new(entries)
    }

    /// Iterate entries in effective order.
    pub fn iter(&self) -> impl Iterator<Item = &TreeEntryInfo> {
        (0..self.len()).map(move |pos| self.entry_at(pos))
    }
}

impl EntryTraversal for SubmoduleAwareEntries {
    fn len(&self) -> usize {
        match self {
            Self::Direct(entries) => entries.len(),
            Self::Remapped(entries) => entries.len(),
        }
    }

    fn entry_at(&self, pos: usize) -> &TreeEntryInfo {
        match self {
            Self::Direct(entries) => entries.entry_at(pos),
            Self::Remapped(entries) => entries.entry_at(pos),
        }
    }
}

/// Compute the effective-to-storage index array, or `None` when the
/// orders coincide.
///
/// `entries` must be in storage order (sorted by storage key), which is
/// what both the on-disk format and git2 iteration guarantee.
pub fn positional_remap(entries: &[TreeEntryInfo]) -> Option<Vec<usize>> {
    let mut order: Vec<usize> = (0..entries.len()).collect();
    order.sort_by(|&a, &b| entries[a].effective_key().cmp(&entries[b].effective_key()));
    if order.iter().enumerate().all(|(pos, &idx)| pos == idx) {
        None
    } else {
        Some(order)
    }
}
