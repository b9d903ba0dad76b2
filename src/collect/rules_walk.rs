//! collect::rules_walk
//!
//! The checkout-rules walker: find the most recent commit whose file
//! changes are visible under a path-inclusion predicate.
//!
//! # Contract
//!
//! History is walked from a start commit backward (reverse-topological).
//! A commit *matches* when applying the rules to its changed-file set
//! (against its first parent; combined across parents for merges) yields
//! a non-empty visible set. The walk:
//!
//! - returns the **first** matching commit encountered
//! - stops descending a line at any stop commit, recording which stops
//!   were reached
//! - with no clean match, reports the first-encountered merge commit
//!   where some but not all parent lines touch visible paths
//!   (`closest_partial_merge`)
//! - records every visited commit so callers can warm caches

use std::collections::BTreeSet;

use git2::Sort;

use crate::core::context::OpContext;
use crate::core::rules::CheckoutRules;
use crate::core::types::Oid;
use crate::error::Error;
use crate::git::repo::MirrorRepo;

/// Outcome of a checkout-rules walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkResult {
    /// The most recent commit visible under the rules, if any.
    pub matching: Option<Oid>,
    /// Stop commits that bounded the walk.
    pub reached_stops: Vec<Oid>,
    /// With no clean match: the first merge where only part of the
    /// parent lines touch visible paths.
    pub closest_partial_merge: Option<Oid>,
    /// Every commit the walk visited, in visit order.
    pub visited: Vec<Oid>,
}

/// Walk from `start` toward `stops`, returning the latest commit whose
/// changes match `rules`.
///
/// An empty `stops` walks to the root. A missing `start` is an error;
/// callers materialize it through the fetch coordinator first.
pub fn latest_matching(
    repo: &MirrorRepo,
    start: &Oid,
    rules: &CheckoutRules,
    stops: &[Oid],
    ctx: &OpContext,
) -> Result<WalkResult, Error> {
    let stop_set: BTreeSet<&Oid> = stops.iter().collect();
    let mut reached: BTreeSet<Oid> = BTreeSet::new();
    let mut visited = Vec::new();
    let mut closest_partial_merge = None;

    if stop_set.contains(start) {
        return Ok(WalkResult {
            matching: None,
            reached_stops: vec![start.clone()],
            closest_partial_merge: None,
            visited,
        });
    }

    let raw = repo.raw();
    let mut revwalk = raw
        .revwalk()
        .map_err(|e| Error::internal("open revision walk", e.message()))?;
    revwalk
        .set_sorting(Sort::TOPOLOGICAL)
        .map_err(|e| Error::internal("set walk sorting", e.message()))?;
    revwalk
        .push(start.to_git2())
        .map_err(|e| Error::internal("mark walk start", e.message()))?;
    for stop in stops {
        // A stop may not exist locally; an unreachable stop is simply
        // never reached.
        let _ = revwalk.hide(stop.to_git2());
    }

    for step in revwalk {
        ctx.check_interrupted()?;
        let oid = step.map_err(|e| Error::internal("advance revision walk", e.message()))?;
        let commit_id = Oid::from(oid);
        visited.push(commit_id.clone());

        let commit = repo.commit(&commit_id)?;
        for parent_id in commit.parent_ids() {
            let parent_id = Oid::from(parent_id);
            if stop_set.contains(&parent_id) {
                reached.insert(parent_id);
            }
        }

        let parents: Vec<git2::Commit<'_>> = commit.parents().collect();
        let mut parent_matches = Vec::with_capacity(parents.len());
        for parent in &parents {
            let changes = super::raw_changes(repo, &commit, Some(parent))?;
            parent_matches.push(rules.accepts_any(changes.keys().map(String::as_str)));
        }

        let matches = if parents.is_empty() {
            let changes = super::raw_changes(repo, &commit, None)?;
            rules.accepts_any(changes.keys().map(String::as_str))
        } else if parents.len() == 1 {
            parent_matches[0]
        } else {
            // Combined semantics: visible against every parent.
            let combined = combined_changes(repo, &commit, &parents)?;
            let combined_match = rules.accepts_any(combined.iter().map(String::as_str));
            if !combined_match
                && closest_partial_merge.is_none()
                && parent_matches.iter().any(|m| *m)
                && parent_matches.iter().any(|m| !*m)
            {
                closest_partial_merge = Some(commit_id.clone());
            }
            combined_match
        };

        if matches {
            return Ok(WalkResult {
                matching: Some(commit_id),
                reached_stops: reached.into_iter().collect(),
                closest_partial_merge: None,
                visited,
            });
        }
    }

    Ok(WalkResult {
        matching: None,
        reached_stops: reached.into_iter().collect(),
        closest_partial_merge,
        visited,
    })
}

/// Paths changed against every parent of a merge.
fn combined_changes(
    repo: &MirrorRepo,
    commit: &git2::Commit<'_>,
    parents: &[git2::Commit<'_>],
) -> Result<BTreeSet<String>, Error> {
    let mut combined: Option<BTreeSet<String>> = None;
    for parent in parents {
        let changes = super::raw_changes(repo, commit, Some(parent))?;
        let paths: BTreeSet<String> = changes.into_keys().collect();
        combined = Some(match combined {
            None => paths,
            Some(previous) => previous.intersection(&paths).cloned().collect(),
        });
    }
    Ok(combined.unwrap_or_default())
}
