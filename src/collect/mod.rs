//! collect
//!
//! The change collector: turns two repository-state snapshots into an
//! ordered sequence of commit-modification records with file-level
//! diffs, routed through submodule resolution.
//!
//! # Algorithm
//!
//! Under removal protection on the mirror, the coordinator materializes
//! `from ∪ to`, then a topological revision walk starts from the `to`
//! tips with the `from` tips marked uninteresting. Children precede
//! parents in the output. Each visited commit is diffed against its
//! parents; for merges only paths that differ from **all** parents are
//! reported (combined-diff semantics), with the change kind taken from
//! the first parent.
//!
//! Changed paths that are submodule pointers are expanded through the
//! resolver: the sub-repository range is diffed and its file changes are
//! inlined with the submodule path as prefix, recursively across
//! nesting.
//!
//! Checkout rules only filter the reported file changes; they never
//! cause history to be omitted.

pub mod record;
pub mod rules_walk;

pub use self::record::{ChangeKind, FileChange, ModificationRecord};
pub use self::rules_walk::{latest_matching, WalkResult};

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use git2::{Delta, DiffFindOptions, DiffOptions, Sort};

use crate::core::context::OpContext;
use crate::core::rules::CheckoutRules;
use crate::core::state::StateSnapshot;
use crate::core::types::{Oid, RepoUrl};
use crate::error::Error;
use crate::fetch::{AuthSettings, FetchCoordinator};
use crate::git::repo::MirrorRepo;
use crate::pool::MirrorPool;
use crate::submodules::{EntryKind, EntryTraversal, SubmoduleAwareEntries, SubmoduleResolver};

/// Nesting bound for submodule expansion; a pointer chain deeper than
/// this is reported un-expanded.
const MAX_SUBMODULE_DEPTH: usize = 16;

/// Collects changes between repository states.
pub struct ChangeCollector {
    pool: Arc<MirrorPool>,
    fetcher: Arc<FetchCoordinator>,
}

impl ChangeCollector {
    pub fn new(pool: Arc<MirrorPool>, fetcher: Arc<FetchCoordinator>) -> Self {
        Self { pool, fetcher }
    }

    /// Collect the ordered modification records between `from` and `to`.
    ///
    /// Boundary behaviors:
    /// - every `from` sha absent locally (even after the fetch) yields an
    ///   empty list with a warning, not an error
    /// - `to` shas still absent after the fetch fail with
    ///   `RevisionNotFound`
    ///
    /// All failures are wrapped with the operation identity; submodule
    /// failures additionally carry the affected branches of `to`.
    pub fn collect_changes(
        &self,
        url: &RepoUrl,
        auth: &AuthSettings,
        from: &StateSnapshot,
        to: &StateSnapshot,
        rules: &CheckoutRules,
        ctx: &OpContext,
    ) -> Result<Vec<ModificationRecord>, Error> {
        let dir = self.pool.resolve(url)?;
        ctx.progress(format!("collecting changes in {}", url.canonical()));

        self.pool.run_with_disabled_remove(&dir, || {
            let result = (|| {
                self.fetcher
                    .ensure_present(&dir, url, auth, &from.merged_with(to), false, ctx)?;

                let repo = Arc::new(MirrorRepo::open(dir.path())?);
                let missing_to: Vec<String> = to
                    .revisions()
                    .filter(|sha| !repo.has_commit(sha))
                    .map(|sha| sha.to_string())
                    .collect();
                if !missing_to.is_empty() {
                    return Err(Error::RevisionNotFound {
                        url: url.canonical().to_string(),
                        missing: missing_to,
                    });
                }

                let _read = self.pool.read_lock(&dir);
                self.walk(&repo, url, auth, from, to, rules, ctx)
            })();

            result.map_err(|e| {
                let branches = repo_branches(to, &e);
                label_submodule_error(e, &branches).with_context(&format!(
                    "{} in {}",
                    ctx.operation(),
                    url.canonical()
                ))
            })
        })
    }

    fn walk(
        &self,
        repo: &Arc<MirrorRepo>,
        url: &RepoUrl,
        auth: &AuthSettings,
        from: &StateSnapshot,
        to: &StateSnapshot,
        rules: &CheckoutRules,
        ctx: &OpContext,
    ) -> Result<Vec<ModificationRecord>, Error> {
        let present_from: Vec<&Oid> =
            from.revisions().filter(|sha| repo.has_commit(sha)).collect();
        if present_from.is_empty() {
            tracing::warn!(
                url = %url,
                "cannot find commits referenced by the from state, will not report any changes"
            );
            return Ok(Vec::new());
        }

        let raw = repo.raw();
        let mut revwalk = raw
            .revwalk()
            .map_err(|e| Error::internal("open revision walk", e.message()))?;
        revwalk
            .set_sorting(Sort::TOPOLOGICAL)
            .map_err(|e| Error::internal("set walk sorting", e.message()))?;
        for sha in to.revisions() {
            revwalk
                .push(sha.to_git2())
                .map_err(|e| Error::internal("mark walk start", e.message()))?;
        }
        for sha in present_from {
            revwalk
                .hide(sha.to_git2())
                .map_err(|e| Error::internal("mark walk uninteresting", e.message()))?;
        }

        let mut records = Vec::new();
        for step in revwalk {
            ctx.check_interrupted()?;
            let oid = step.map_err(|e| Error::internal("advance revision walk", e.message()))?;
            let commit_id = Oid::from(oid);
            let record = self.commit_record(repo, auth, &commit_id, rules, ctx)?;
            records.push(record);
        }
        tracing::debug!(url = %url, records = records.len(), "collected changes");
        Ok(records)
    }

    fn commit_record(
        &self,
        repo: &Arc<MirrorRepo>,
        auth: &AuthSettings,
        commit_id: &Oid,
        rules: &CheckoutRules,
        ctx: &OpContext,
    ) -> Result<ModificationRecord, Error> {
        let commit = repo.commit(commit_id)?;
        let parents: Vec<Oid> = commit.parent_ids().map(Oid::from).collect();

        let resolver = SubmoduleResolver::new(
            Arc::clone(&self.pool),
            Arc::clone(&self.fetcher),
            auth.clone(),
            Arc::clone(repo),
            commit_id.clone(),
        );

        // Combined-diff semantics: a merge reports only paths whose
        // content differs from every parent; kinds come from the first
        // parent's diff.
        let first_parent = commit.parents().next();
        let mut combined = raw_changes(repo, &commit, first_parent.as_ref())?;
        for parent in commit.parents().skip(1) {
            let other = raw_changes(repo, &commit, Some(&parent))?;
            combined.retain(|path, _| other.contains_key(path));
        }

        let mut file_changes = expand_changes(
            &resolver,
            &commit,
            first_parent.as_ref(),
            "",
            combined,
            ctx,
            0,
        )?;

        file_changes.retain(|change| rules.accepts(&change.path));
        file_changes.sort_by(|a, b| a.path.cmp(&b.path));

        let author = commit.author();
        let committer = commit.committer();
        let timestamp = DateTime::<Utc>::from_timestamp(committer.when().seconds(), 0)
            .unwrap_or_else(Utc::now);

        Ok(ModificationRecord {
            commit: commit_id.clone(),
            parents,
            author: author.name().unwrap_or_default().to_string(),
            author_email: author.email().unwrap_or_default().to_string(),
            committer: committer.name().unwrap_or_default().to_string(),
            committer_email: committer.email().unwrap_or_default().to_string(),
            timestamp,
            message: commit.message().unwrap_or_default().to_string(),
            file_changes,
        })
    }
}

/// Raw per-path changes of `commit` against one parent (or against the
/// empty tree for a root commit), before submodule expansion.
fn raw_changes(
    repo: &MirrorRepo,
    commit: &git2::Commit<'_>,
    parent: Option<&git2::Commit<'_>>,
) -> Result<BTreeMap<String, ChangeKind>, Error> {
    let new_tree = commit
        .tree()
        .map_err(|e| Error::internal("read commit tree", e.message()))?;
    let old_tree = match parent {
        Some(parent) => Some(
            parent
                .tree()
                .map_err(|e| Error::internal("read parent tree", e.message()))?,
        ),
        None => None,
    };
    diff_trees(repo, old_tree.as_ref(), &new_tree)
}

fn diff_trees(
    repo: &MirrorRepo,
    old_tree: Option<&git2::Tree<'_>>,
    new_tree: &git2::Tree<'_>,
) -> Result<BTreeMap<String, ChangeKind>, Error> {
    let mut options = DiffOptions::new();
    let mut diff = repo
        .raw()
        .diff_tree_to_tree(old_tree, Some(new_tree), Some(&mut options))
        .map_err(|e| Error::internal("diff trees", e.message()))?;
    let mut find = DiffFindOptions::new();
    find.renames(true).copies(true);
    diff.find_similar(Some(&mut find))
        .map_err(|e| Error::internal("detect renames", e.message()))?;

    let mut changes = BTreeMap::new();
    for delta in diff.deltas() {
        let (file, kind) = match delta.status() {
            Delta::Added => (delta.new_file(), ChangeKind::Added),
            Delta::Deleted => (delta.old_file(), ChangeKind::Removed),
            Delta::Modified => (delta.new_file(), ChangeKind::Modified),
            Delta::Renamed => (delta.new_file(), ChangeKind::Renamed),
            Delta::Copied => (delta.new_file(), ChangeKind::Copied),
            Delta::Typechange => (delta.new_file(), ChangeKind::TypeChanged),
            _ => continue,
        };
        let Some(path) = file.path() else { continue };
        changes.insert(path.to_string_lossy().into_owned(), kind);
    }
    Ok(changes)
}

/// Turn raw path changes into file changes, expanding submodule pointers
/// through the resolver and prefixing inlined paths.
fn expand_changes(
    resolver: &SubmoduleResolver,
    commit: &git2::Commit<'_>,
    parent: Option<&git2::Commit<'_>>,
    prefix: &str,
    changes: BTreeMap<String, ChangeKind>,
    ctx: &OpContext,
    depth: usize,
) -> Result<Vec<FileChange>, Error> {
    let repo = Arc::clone(resolver.repo());
    let mut out = Vec::new();
    for (path, kind) in changes {
        let prefixed = join_path(prefix, &path);
        let new_ptr = repo.gitlink_at(commit, Path::new(&path))?;
        let Some(new_ptr) = new_ptr else {
            out.push(FileChange::new(prefixed, kind));
            continue;
        };
        if depth >= MAX_SUBMODULE_DEPTH {
            tracing::warn!(
                path = %prefixed,
                "submodule nesting exceeds depth bound, reporting pointer change only"
            );
            out.push(FileChange::new(prefixed, kind));
            continue;
        }

        let (sub_repo, sub_commit_id) = resolver.get_submodule_commit(&path, &new_ptr, ctx)?;
        let child = resolver.sub_resolver(&path, Arc::clone(&sub_repo), sub_commit_id.clone());
        let sub_commit = sub_repo.commit(&sub_commit_id)?;

        let old_ptr = match parent {
            Some(parent) => repo.gitlink_at(parent, Path::new(&path))?,
            None => None,
        };
        let old_commit = match old_ptr {
            Some(old) if sub_repo.has_commit(&old) => Some(sub_repo.commit(&old)?),
            _ => None,
        };

        match old_commit {
            Some(old_commit) => {
                let sub_changes = raw_changes(&sub_repo, &sub_commit, Some(&old_commit))?;
                out.extend(expand_changes(
                    &child,
                    &sub_commit,
                    Some(&old_commit),
                    &prefixed,
                    sub_changes,
                    ctx,
                    depth + 1,
                )?);
            }
            None => {
                // Newly-appearing submodule: inline its whole tree as
                // additions, in submodule-as-directory order.
                let tree = sub_commit
                    .tree()
                    .map_err(|e| Error::internal("read submodule tree", e.message()))?;
                list_tree_additions(&child, &tree, &prefixed, "", ctx, depth + 1, &mut out)?;
            }
        }
    }
    Ok(out)
}

/// Append every file under `tree` as an `Added` change, recursing into
/// directories and (via the resolver) into nested submodules.
///
/// Iteration uses the submodule-as-directory ordering so sibling order
/// stays stable against later diffs of the same tree. `prefix` is the
/// path shown in records; `repo_relative` is the path inside the
/// resolver's repository, which is what `.gitmodules` entries key on.
fn list_tree_additions(
    resolver: &SubmoduleResolver,
    tree: &git2::Tree<'_>,
    prefix: &str,
    repo_relative: &str,
    ctx: &OpContext,
    depth: usize,
    out: &mut Vec<FileChange>,
) -> Result<(), Error> {
    let repo = Arc::clone(resolver.repo());
    let entries = SubmoduleAwareEntries::from_tree(tree);
    for pos in 0..entries.len() {
        ctx.check_interrupted()?;
        let info = entries.entry_at(pos);
        let prefixed = join_path(prefix, &info.name);
        let relative = join_path(repo_relative, &info.name);
        match info.kind {
            EntryKind::File => out.push(FileChange::new(prefixed, ChangeKind::Added)),
            EntryKind::Dir => {
                let entry = tree
                    .get_name(&info.name)
                    .ok_or_else(|| Error::internal("tree entry lookup", &info.name))?;
                let object = entry
                    .to_object(repo.raw())
                    .map_err(|e| Error::internal("load subtree", e.message()))?;
                let subtree = object
                    .as_tree()
                    .ok_or_else(|| Error::internal("subtree type", &info.name))?;
                list_tree_additions(resolver, subtree, &prefixed, &relative, ctx, depth, out)?;
            }
            EntryKind::Submodule => {
                if depth >= MAX_SUBMODULE_DEPTH {
                    tracing::warn!(path = %prefixed, "submodule nesting exceeds depth bound");
                    out.push(FileChange::new(prefixed, ChangeKind::Added));
                    continue;
                }
                let entry = tree
                    .get_name(&info.name)
                    .ok_or_else(|| Error::internal("tree entry lookup", &info.name))?;
                let pointer = Oid::from(entry.id());
                let (sub_repo, sub_commit_id) =
                    resolver.get_submodule_commit(&relative, &pointer, ctx)?;
                let grandchild =
                    resolver.sub_resolver(&relative, Arc::clone(&sub_repo), sub_commit_id.clone());
                let sub_commit = sub_repo.commit(&sub_commit_id)?;
                let sub_tree = sub_commit
                    .tree()
                    .map_err(|e| Error::internal("read submodule tree", e.message()))?;
                list_tree_additions(&grandchild, &sub_tree, &prefixed, "", ctx, depth + 1, out)?;
            }
        }
    }
    Ok(())
}

fn join_path(prefix: &str, path: &str) -> String {
    if prefix.is_empty() {
        path.to_string()
    } else {
        format!("{}/{}", prefix, path)
    }
}

/// Branch labels for a submodule failure: the `to` branches pointing at
/// the failing parent commit, when that commit is known.
fn repo_branches(to: &StateSnapshot, error: &Error) -> Vec<String> {
    let commit = match error {
        Error::SubmoduleMissingConfig { identity }
        | Error::SubmoduleMissingEntry { identity }
        | Error::SubmoduleMissingCommit { identity } => &identity.main_commit,
        _ => return Vec::new(),
    };
    match Oid::new(commit.clone()) {
        Ok(oid) => to.branches_at(&oid),
        Err(_) => Vec::new(),
    }
}

fn label_submodule_error(error: Error, branches: &[String]) -> Error {
    if branches.is_empty() {
        error
    } else {
        error.with_affected_branches(branches.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_path_handles_empty_prefix() {
        assert_eq!(join_path("", "src/lib.rs"), "src/lib.rs");
        assert_eq!(join_path("libs/foo", "src/lib.rs"), "libs/foo/src/lib.rs");
    }

    #[test]
    fn branch_labels_found_for_submodule_errors() {
        let sha = Oid::new("a".repeat(40)).unwrap();
        let to = StateSnapshot::of([("main", sha.clone()), ("dev", sha.clone())]);
        let err = Error::SubmoduleMissingCommit {
            identity: crate::error::SubmoduleIdentity {
                main_repo_url: "u".into(),
                main_commit: sha.to_string(),
                submodule_path: "libs/foo".into(),
                submodule_url: None,
                submodule_commit: None,
                affected_branches: Vec::new(),
            },
        };
        let branches = repo_branches(&to, &err);
        assert_eq!(branches, vec!["refs/heads/dev", "refs/heads/main"]);

        let labeled = label_submodule_error(err, &branches);
        match labeled {
            Error::SubmoduleMissingCommit { identity } => {
                assert_eq!(identity.affected_branches.len(), 2);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn non_submodule_errors_get_no_labels() {
        let to = StateSnapshot::empty();
        let err = Error::internal("x", "y");
        assert!(repo_branches(&to, &err).is_empty());
    }
}
