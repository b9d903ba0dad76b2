//! fetch
//!
//! The fetch coordinator: decides whether a fetch is needed for a
//! requested state, deduplicates concurrent fetches, chooses between the
//! native and in-process transports, and retries recoverable failures.
//!
//! # Architecture
//!
//! [`FetchCoordinator::ensure_present`] is the materialization contract:
//! after it returns, every sha of the requested snapshot is locally
//! resolvable (or, with `throw_if_missing_after_fetch`, an error says
//! which are not). Presence is checked under the shared read lock; the
//! fetch itself runs under the mirror's exclusive write lock, which is
//! also what deduplicates concurrent fetches — a second caller blocks,
//! then finds everything present and spawns nothing.
//!
//! # Transport selection
//!
//! Native git is used when a path is configured, the executable passes
//! the version gates, and the URL is enabled by the global flag or the
//! longest matching per-URL prefix override. Everything else goes through
//! the in-process transport. A failed probe of the configured executable
//! is recorded in the process-wide error cell and silently falls back.

pub mod retry;
pub mod transport;

pub use self::transport::AuthSettings;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::core::context::OpContext;
use crate::core::state::StateSnapshot;
use crate::core::types::{Oid, RepoUrl};
use crate::error::Error;
use crate::git::exec::ExecError;
use crate::git::native::{self, NativeGit};
use crate::git::repo::MirrorRepo;
use crate::pool::errors::NativeGitErrorCell;
use crate::pool::{MirrorDir, MirrorPool};

/// Coordinates fetches against pool mirrors.
pub struct FetchCoordinator {
    pool: Arc<MirrorPool>,
    native_error: Arc<NativeGitErrorCell>,
}

impl FetchCoordinator {
    pub fn new(pool: Arc<MirrorPool>) -> Self {
        Self {
            pool,
            native_error: Arc::new(NativeGitErrorCell::new()),
        }
    }

    /// Share an externally-owned native-git error cell (the compactor and
    /// the coordinator report into the same one).
    pub fn with_native_error_cell(pool: Arc<MirrorPool>, cell: Arc<NativeGitErrorCell>) -> Self {
        Self {
            pool,
            native_error: cell,
        }
    }

    /// The process-wide native-git failure cell.
    pub fn native_error_cell(&self) -> &Arc<NativeGitErrorCell> {
        &self.native_error
    }

    /// Make every sha of `state` locally resolvable in `dir`.
    ///
    /// No fetch happens (and no process is spawned) when all shas are
    /// already present. Otherwise the minimal forced refspec set for the
    /// missing refs is fetched under the mirror write lock and presence is
    /// re-verified.
    ///
    /// # Errors
    ///
    /// With `throw_if_missing_after_fetch`, shas still absent after the
    /// fetch produce [`Error::RevisionNotFound`]. Transport failures
    /// follow the retry policy.
    pub fn ensure_present(
        &self,
        dir: &MirrorDir,
        url: &RepoUrl,
        auth: &AuthSettings,
        state: &StateSnapshot,
        throw_if_missing_after_fetch: bool,
        ctx: &OpContext,
    ) -> Result<(), Error> {
        if state.is_empty() {
            return Ok(());
        }

        {
            let _read = self.pool.read_lock(dir);
            if missing_refs(dir, state)?.is_empty() {
                tracing::debug!(dir = %dir, "all revisions present, no fetch needed");
                return Ok(());
            }
        }

        let still_missing = {
            let _write = self.pool.write_lock(dir);
            // A concurrent fetch may have landed while we waited.
            let missing = missing_refs(dir, state)?;
            if missing.is_empty() {
                return Ok(());
            }

            let refspecs: Vec<String> = missing
                .iter()
                .map(|(full_ref, _)| format!("+{r}:{r}", r = full_ref))
                .collect();
            ctx.progress(format!(
                "fetching {} ref(s) for {}",
                refspecs.len(),
                url.canonical()
            ));
            self.fetch_refspecs_locked(dir, url, auth, &refspecs, ctx)?;

            missing_refs(dir, state)?
        };

        if throw_if_missing_after_fetch && !still_missing.is_empty() {
            return Err(Error::RevisionNotFound {
                url: url.canonical().to_string(),
                missing: still_missing.iter().map(|(_, sha)| sha.to_string()).collect(),
            });
        }
        if !still_missing.is_empty() {
            tracing::warn!(
                dir = %dir,
                missing = still_missing.len(),
                "revisions still missing after fetch"
            );
        }
        Ok(())
    }

    /// Fetch explicit refspecs under the mirror write lock.
    pub fn fetch_refspecs(
        &self,
        dir: &MirrorDir,
        url: &RepoUrl,
        auth: &AuthSettings,
        refspecs: &[String],
        ctx: &OpContext,
    ) -> Result<(), Error> {
        let _write = self.pool.write_lock(dir);
        self.fetch_refspecs_locked(dir, url, auth, refspecs, ctx)
    }

    /// Fetch all branches and tags (submodule mirrors, where the pointer
    /// commit may live on any ref).
    pub fn fetch_all_refs(
        &self,
        dir: &MirrorDir,
        url: &RepoUrl,
        auth: &AuthSettings,
        ctx: &OpContext,
    ) -> Result<(), Error> {
        let refspecs = vec![
            "+refs/heads/*:refs/heads/*".to_string(),
            "+refs/tags/*:refs/tags/*".to_string(),
        ];
        self.fetch_refspecs(dir, url, auth, &refspecs, ctx)
    }

    /// List the remote's refs, with the same transport selection and
    /// retry policy as fetching.
    pub fn remote_refs(
        &self,
        dir: &MirrorDir,
        url: &RepoUrl,
        auth: &AuthSettings,
        ctx: &OpContext,
    ) -> Result<BTreeMap<String, Oid>, Error> {
        let config = self.pool.config();
        let native = self.select_native(url, ctx);
        retry::with_retry(
            config.connection_retry_attempts,
            config.connection_retry_interval(),
            ctx,
            || match &native {
                Some(facade) => {
                    let result = facade
                        .ls_remote(dir.path(), url.raw(), false)
                        .total_timeout(Duration::from_secs(config.fetch_idle_timeout_seconds))
                        .run_checked(ctx)
                        .map_err(|e| classify_native(e, url))?;
                    let mut refs = BTreeMap::new();
                    for (name, sha) in native::parse_ls_remote(&result.stdout) {
                        if let Ok(oid) = Oid::new(sha) {
                            refs.insert(name, oid);
                        }
                    }
                    Ok(refs)
                }
                None => transport::remote_refs(dir.path(), url, auth),
            },
        )
    }

    fn fetch_refspecs_locked(
        &self,
        dir: &MirrorDir,
        url: &RepoUrl,
        auth: &AuthSettings,
        refspecs: &[String],
        ctx: &OpContext,
    ) -> Result<(), Error> {
        let config = self.pool.config();
        let native = self.select_native(url, ctx);
        retry::with_retry(
            config.connection_retry_attempts,
            config.connection_retry_interval(),
            ctx,
            || match &native {
                Some(facade) => {
                    ctx.check_interrupted()?;
                    facade
                        .fetch(
                            dir.path(),
                            url.raw(),
                            refspecs,
                            Duration::from_secs(config.fetch_idle_timeout_seconds),
                        )
                        .run_checked(ctx)
                        .map(|_| ())
                        .map_err(|e| classify_native(e, url))
                }
                None => {
                    ctx.check_interrupted()?;
                    transport::fetch(dir.path(), url, auth, refspecs)
                }
            },
        )
    }

    /// Probe for the native transport; `None` means in-process.
    fn select_native(&self, url: &RepoUrl, ctx: &OpContext) -> Option<NativeGit> {
        let config = self.pool.config();
        let git_path = config.path_to_git.as_ref()?;
        if !config.native_operations_enabled_for(url.canonical()) {
            return None;
        }
        match native::detect(git_path, ctx) {
            Ok(facade) if facade.version().supports_fetch_stdin() => {
                self.native_error.clear();
                Some(facade)
            }
            Ok(facade) => {
                tracing::debug!(
                    version = %facade.version(),
                    "native git lacks batched fetch support, using in-process transport"
                );
                None
            }
            Err(e) => {
                self.native_error.set(git_path, e.to_string());
                tracing::warn!(error = %e, "native git probe failed, using in-process transport");
                None
            }
        }
    }
}

/// Refs of `state` whose shas are not locally resolvable, in snapshot
/// order, deduplicated by ref.
fn missing_refs(dir: &MirrorDir, state: &StateSnapshot) -> Result<Vec<(String, Oid)>, Error> {
    let repo = MirrorRepo::open(dir.path())?;
    let mut missing = Vec::new();
    for (full_ref, sha) in state.iter() {
        if !repo.has_commit(sha) {
            missing.push((full_ref.to_string(), sha.clone()));
        }
    }
    Ok(missing)
}

fn classify_native(err: ExecError, url: &RepoUrl) -> Error {
    match err {
        ExecError::Cancelled { reason } => Error::OperationCancelled { reason },
        ExecError::Spawn { command_line, source } => Error::NativeGitUnavailable {
            message: format!("cannot start '{}': {}", command_line, source),
        },
        ExecError::Timeout { command_line, waited, .. } => Error::TransportRecoverable {
            message: format!("'{}' produced no output for {:?}", command_line, waited),
        },
        ExecError::NonZeroExit { stderr_tail, .. } => {
            let lower = stderr_tail.to_ascii_lowercase();
            if lower.contains("authentication failed")
                || lower.contains("could not read username")
                || lower.contains("could not read password")
                || lower.contains("invalid username or password")
                || lower.contains("access denied")
            {
                Error::AuthWrongCredentials {
                    url: url.canonical().to_string(),
                    message: stderr_tail,
                }
            } else if lower.contains("could not resolve host")
                || lower.contains("connection reset")
                || lower.contains("connection timed out")
                || lower.contains("early eof")
                || lower.contains("remote end hung up")
            {
                Error::TransportRecoverable { message: stderr_tail }
            } else {
                Error::TransportPermanent { message: stderr_tail }
            }
        }
    }
}
