//! submodules
//!
//! The submodule resolver: maps `(parent commit, path)` to a child mirror
//! and the pointer commit inside it, fetching on miss.
//!
//! # Architecture
//!
//! Every submodule URL has its own mirror in the pool; that is also how
//! cycles break — resolving a submodule never recurses into the parent's
//! directory. Relative URLs are resolved against the parent mirror's
//! recorded canonical remote. Nesting is handled by child resolvers
//! scoped to the sub-mirror.
//!
//! # Errors
//!
//! Failures are distinguished precisely so the caller can label them:
//! missing `.gitmodules`, missing entry for the path, and pointer commit
//! absent even after fetching the sub-mirror each carry the full
//! five-part identity (parent URL, parent commit, path, submodule URL,
//! submodule commit).

pub mod config;
pub mod iterator;

pub use self::config::{GitmodulesError, SubmoduleEntry, SubmodulesConfig};
pub use self::iterator::{EntryKind, EntryTraversal, SubmoduleAwareEntries, TreeEntryInfo};

use std::cell::OnceCell;
use std::path::Path;
use std::sync::Arc;

use crate::core::context::OpContext;
use crate::core::types::{Oid, RepoUrl};
use crate::error::{Error, SubmoduleIdentity};
use crate::fetch::{AuthSettings, FetchCoordinator};
use crate::git::repo::MirrorRepo;
use crate::pool::MirrorPool;

/// The well-known config file at the root of a superproject tree.
pub const GITMODULES: &str = ".gitmodules";

/// Resolves submodule pointers of one parent commit.
pub struct SubmoduleResolver {
    pool: Arc<MirrorPool>,
    fetcher: Arc<FetchCoordinator>,
    auth: AuthSettings,
    repo: Arc<MirrorRepo>,
    commit: Oid,
    /// Path of this repository from the walk root; empty for the root,
    /// `libs/foo/nested` for a sub-submodule.
    path_from_root: String,
    parsed: OnceCell<Option<SubmodulesConfig>>,
}

impl SubmoduleResolver {
    /// Resolver for the root repository at `commit`.
    pub fn new(
        pool: Arc<MirrorPool>,
        fetcher: Arc<FetchCoordinator>,
        auth: AuthSettings,
        repo: Arc<MirrorRepo>,
        commit: Oid,
    ) -> Self {
        Self {
            pool,
            fetcher,
            auth,
            repo,
            commit,
            path_from_root: String::new(),
            parsed: OnceCell::new(),
        }
    }

    /// The repository this resolver reads `.gitmodules` from.
    pub fn repo(&self) -> &Arc<MirrorRepo> {
        &self.repo
    }

    /// Path of this repository from the walk root.
    pub fn path_from_root(&self) -> &str {
        &self.path_from_root
    }

    /// The parsed submodule configuration of the commit, when present
    /// and parseable.
    pub fn submodules_config(&self) -> Option<&SubmodulesConfig> {
        self.parsed
            .get_or_init(|| self.load_config())
            .as_ref()
    }

    /// Whether `.gitmodules` registers a submodule at `path`.
    pub fn contains_submodule(&self, path: &str) -> bool {
        self.submodules_config()
            .map(|c| c.find_submodule(path).is_some())
            .unwrap_or(false)
    }

    /// The resolved (absolute) submodule URL for `path`, if registered.
    pub fn submodule_url(&self, path: &str) -> Option<String> {
        let entry_url = self
            .submodules_config()?
            .find_submodule(path)?
            .url
            .clone();
        Some(config::resolve_relative_url(&self.base_url(), &entry_url))
    }

    /// Resolve the pointer at `path` to a commit in the sub-mirror.
    ///
    /// Locates (or creates) the sub-mirror through the pool; fetches all
    /// branches and tags of the sub-remote when the pointer commit is
    /// absent.
    pub fn get_submodule_commit(
        &self,
        path: &str,
        pointer: &Oid,
        ctx: &OpContext,
    ) -> Result<(Arc<MirrorRepo>, Oid), Error> {
        ctx.check_interrupted()?;

        let Some(submodules) = self.submodules_config() else {
            return Err(Error::SubmoduleMissingConfig {
                identity: self.identity(path, None, None),
            });
        };
        let Some(entry) = submodules.find_submodule(path) else {
            return Err(Error::SubmoduleMissingEntry {
                identity: self.identity(path, None, None),
            });
        };

        let resolved = config::resolve_relative_url(&self.base_url(), &entry.url);
        let sub_url = RepoUrl::parse(&resolved).map_err(|e| {
            Error::internal(format!("submodule url '{}'", resolved), e)
        })?;
        tracing::debug!(path, url = %sub_url, "resolving submodule repository");

        let sub_dir = self.pool.resolve(&sub_url)?;
        let sub_repo = MirrorRepo::open(sub_dir.path())?;
        if !sub_repo.has_commit(pointer) {
            tracing::debug!(
                path,
                url = %sub_url,
                commit = %pointer,
                "submodule commit absent, fetching sub-mirror"
            );
            self.fetcher
                .fetch_all_refs(&sub_dir, &sub_url, &self.auth, ctx)?;
        }

        // Re-open after a potential fetch so new packs are visible.
        let sub_repo = MirrorRepo::open(sub_dir.path())?;
        if !sub_repo.has_commit(pointer) {
            return Err(Error::SubmoduleMissingCommit {
                identity: self.identity(path, Some(resolved), Some(pointer.clone())),
            });
        }
        Ok((Arc::new(sub_repo), pointer.clone()))
    }

    /// A child resolver scoped to a sub-mirror at `commit`.
    pub fn sub_resolver(
        &self,
        path: &str,
        sub_repo: Arc<MirrorRepo>,
        commit: Oid,
    ) -> SubmoduleResolver {
        SubmoduleResolver {
            pool: Arc::clone(&self.pool),
            fetcher: Arc::clone(&self.fetcher),
            auth: self.auth.clone(),
            repo: sub_repo,
            commit,
            path_from_root: self.full_path(path),
            parsed: OnceCell::new(),
        }
    }

    /// Path of `path` from the walk root.
    pub fn full_path(&self, path: &str) -> String {
        if self.path_from_root.is_empty() {
            path.to_string()
        } else {
            format!("{}/{}", self.path_from_root, path)
        }
    }

    fn base_url(&self) -> String {
        self.repo.remote_url().unwrap_or_default()
    }

    fn load_config(&self) -> Option<SubmodulesConfig> {
        let commit = self.repo.commit(&self.commit).ok()?;
        let blob = match self.repo.read_blob_at(&commit, Path::new(GITMODULES)) {
            Ok(Some(blob)) => blob,
            Ok(None) => return None,
            Err(e) => {
                tracing::error!(
                    commit = %self.commit,
                    error = %e,
                    "unable to read submodule configuration"
                );
                return None;
            }
        };
        match SubmodulesConfig::parse(&blob) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                tracing::error!(
                    commit = %self.commit,
                    error = %e,
                    "unable to parse submodule configuration"
                );
                None
            }
        }
    }

    fn identity(
        &self,
        path: &str,
        submodule_url: Option<String>,
        submodule_commit: Option<Oid>,
    ) -> SubmoduleIdentity {
        SubmoduleIdentity {
            main_repo_url: self.base_url(),
            main_commit: self.commit.to_string(),
            submodule_path: self.full_path(path),
            submodule_url,
            submodule_commit: submodule_commit.map(|oid| oid.to_string()),
            affected_branches: Vec::new(),
        }
    }
}
