//! core::state
//!
//! Repository state snapshots: the branch tips of interest at an instant.
//!
//! A snapshot is a value object mapping full ref names to commit ids. Two
//! snapshots (`from`, `to`) define "what changed" for the change collector.
//! A snapshot may reference commits that are not present locally; the fetch
//! coordinator is responsible for materializing them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::types::{expand_ref, Oid};

/// An immutable mapping from full branch ref to commit sha.
///
/// No ordering among branches is implied; the map is sorted only so that
/// iteration (and therefore refspec generation) is deterministic.
///
/// # Example
///
/// ```
/// use mirrorpool::core::state::StateSnapshot;
/// use mirrorpool::core::types::Oid;
///
/// let sha = Oid::new("0123456789abcdef0123456789abcdef01234567").unwrap();
/// let state = StateSnapshot::of([("main", sha.clone())]);
/// assert_eq!(state.get("refs/heads/main"), Some(&sha));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    revisions: BTreeMap<String, Oid>,
}

impl StateSnapshot {
    /// An empty snapshot.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a snapshot from `(ref, sha)` pairs.
    ///
    /// Short branch names are expanded to `refs/heads/...`.
    pub fn of<I, R>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (R, Oid)>,
        R: AsRef<str>,
    {
        let revisions = pairs
            .into_iter()
            .map(|(r, oid)| (expand_ref(r.as_ref()), oid))
            .collect();
        Self { revisions }
    }

    /// Look up the sha for a full ref name.
    pub fn get(&self, full_ref: &str) -> Option<&Oid> {
        self.revisions.get(full_ref)
    }

    /// Iterate `(full_ref, sha)` pairs in deterministic order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Oid)> {
        self.revisions.iter().map(|(r, oid)| (r.as_str(), oid))
    }

    /// All shas referenced by this snapshot, in deterministic order.
    pub fn revisions(&self) -> impl Iterator<Item = &Oid> {
        self.revisions.values()
    }

    /// Branch refs whose tip is the given commit.
    pub fn branches_at(&self, sha: &Oid) -> Vec<String> {
        self.revisions
            .iter()
            .filter(|(_, oid)| *oid == sha)
            .map(|(r, _)| r.clone())
            .collect()
    }

    /// Number of refs in the snapshot.
    pub fn len(&self) -> usize {
        self.revisions.len()
    }

    /// Whether the snapshot has no refs.
    pub fn is_empty(&self) -> bool {
        self.revisions.is_empty()
    }

    /// Union of two snapshots; on conflicting refs `other` wins.
    pub fn merged_with(&self, other: &StateSnapshot) -> StateSnapshot {
        let mut revisions = self.revisions.clone();
        for (r, oid) in &other.revisions {
            revisions.insert(r.clone(), oid.clone());
        }
        Self { revisions }
    }
}

impl<'a> IntoIterator for &'a StateSnapshot {
    type Item = (&'a String, &'a Oid);
    type IntoIter = std::collections::btree_map::Iter<'a, String, Oid>;

    fn into_iter(self) -> Self::IntoIter {
        self.revisions.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oid(byte: char) -> Oid {
        Oid::new(byte.to_string().repeat(40)).unwrap()
    }

    #[test]
    fn short_names_expanded() {
        let state = StateSnapshot::of([("main", oid('a'))]);
        assert!(state.get("refs/heads/main").is_some());
        assert!(state.get("main").is_none());
    }

    #[test]
    fn full_refs_kept() {
        let state = StateSnapshot::of([("refs/tags/v1", oid('b'))]);
        assert_eq!(state.get("refs/tags/v1"), Some(&oid('b')));
    }

    #[test]
    fn iteration_is_deterministic() {
        let state = StateSnapshot::of([("zeta", oid('a')), ("alpha", oid('b'))]);
        let refs: Vec<&str> = state.iter().map(|(r, _)| r).collect();
        assert_eq!(refs, vec!["refs/heads/alpha", "refs/heads/zeta"]);
    }

    #[test]
    fn branches_at_finds_tips() {
        let state = StateSnapshot::of([("a", oid('a')), ("b", oid('a')), ("c", oid('c'))]);
        let branches = state.branches_at(&oid('a'));
        assert_eq!(branches, vec!["refs/heads/a", "refs/heads/b"]);
    }

    #[test]
    fn merged_with_prefers_other() {
        let old = StateSnapshot::of([("main", oid('a'))]);
        let new = StateSnapshot::of([("main", oid('b')), ("dev", oid('c'))]);
        let merged = old.merged_with(&new);
        assert_eq!(merged.get("refs/heads/main"), Some(&oid('b')));
        assert_eq!(merged.len(), 2);
    }
}
