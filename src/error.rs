//! Boundary error type and taxonomy.
//!
//! # Architecture
//!
//! Modules define their own narrow error enums (`TypeError`, `ExecError`,
//! `ConfigError`, ...) and convert into [`Error`] at the crate boundary.
//! Consumers match on [`ErrorKind`] to decide policy (retry, surface,
//! record-and-continue) without destructuring every variant.
//!
//! # Policy
//!
//! - The fetch coordinator retries `TransportRecoverable` silently.
//! - The compactor never propagates: failures land in the GC error
//!   registry and the next mirror is processed.
//! - The change collector wraps failures with the enclosing operation
//!   context before re-throwing.

use std::path::PathBuf;

use thiserror::Error;

/// Coarse classification of a failure, used for policy decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Transient transport failure; eligible for automatic retry.
    TransportRecoverable,
    /// Permission denied, invalid certificate, unknown host after retries.
    TransportPermanent,
    /// Credentials rejected; never retried.
    AuthWrongCredentials,
    /// A requested sha is still absent after a fetch.
    RevisionNotFound,
    /// `.gitmodules` is missing in a commit that references a submodule.
    SubmoduleMissingConfig,
    /// `.gitmodules` has no entry for the submodule path.
    SubmoduleMissingEntry,
    /// The submodule pointer commit is absent even after fetching.
    SubmoduleMissingCommit,
    /// Not enough free disk space to compact a mirror.
    GcDiskFull,
    /// A gc child process failed.
    GcProcessFailed,
    /// Directory swap during copy-swap compaction failed.
    GcRenameFailed,
    /// Native git executable missing or its version is too old.
    NativeGitUnavailable,
    /// The operation context was interrupted.
    OperationCancelled,
    /// Unclassified failure.
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::TransportRecoverable => "transport-recoverable",
            ErrorKind::TransportPermanent => "transport-permanent",
            ErrorKind::AuthWrongCredentials => "auth-wrong-credentials",
            ErrorKind::RevisionNotFound => "revision-not-found",
            ErrorKind::SubmoduleMissingConfig => "submodule-missing-config",
            ErrorKind::SubmoduleMissingEntry => "submodule-missing-entry",
            ErrorKind::SubmoduleMissingCommit => "submodule-missing-commit",
            ErrorKind::GcDiskFull => "gc-disk-full",
            ErrorKind::GcProcessFailed => "gc-process-failed",
            ErrorKind::GcRenameFailed => "gc-rename-failed",
            ErrorKind::NativeGitUnavailable => "native-git-unavailable",
            ErrorKind::OperationCancelled => "operation-cancelled",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Identity of a failed submodule resolution.
///
/// Carries enough context for an operator to locate the problem without
/// reproducing the walk: the parent repository and commit, the path of the
/// submodule inside the parent, and (when known) the submodule remote and
/// the pointer commit that could not be found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmoduleIdentity {
    /// Canonical URL of the parent repository.
    pub main_repo_url: String,
    /// Commit in the parent repository whose tree references the submodule.
    pub main_commit: String,
    /// Path of the submodule inside the parent tree.
    pub submodule_path: String,
    /// Resolved submodule remote URL, when the entry was found.
    pub submodule_url: Option<String>,
    /// The pointer commit that was requested, when applicable.
    pub submodule_commit: Option<String>,
    /// Branches of the requesting state snapshot affected by the failure.
    pub affected_branches: Vec<String>,
}

impl std::fmt::Display for SubmoduleIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "repository {} commit {} submodule path '{}'",
            self.main_repo_url, self.main_commit, self.submodule_path
        )?;
        if let Some(url) = &self.submodule_url {
            write!(f, " url {}", url)?;
        }
        if let Some(commit) = &self.submodule_commit {
            write!(f, " commit {}", commit)?;
        }
        if !self.affected_branches.is_empty() {
            write!(f, " (affected branches: {})", self.affected_branches.join(", "))?;
        }
        Ok(())
    }
}

/// Crate boundary error.
#[derive(Debug, Error)]
pub enum Error {
    /// Transient transport failure (connection reset, temporary DNS
    /// failure, handshake timeout).
    #[error("recoverable transport error: {message}")]
    TransportRecoverable { message: String },

    /// Permanent transport failure.
    #[error("transport error: {message}")]
    TransportPermanent { message: String },

    /// Credentials rejected by the remote.
    #[error("authentication failed for {url}: {message}")]
    AuthWrongCredentials { url: String, message: String },

    /// Requested revisions still missing after a fetch.
    #[error("cannot find revisions {missing:?} in repository {url}")]
    RevisionNotFound { url: String, missing: Vec<String> },

    /// No `.gitmodules` in a commit that references a submodule.
    #[error("no .gitmodules found: {identity}")]
    SubmoduleMissingConfig { identity: SubmoduleIdentity },

    /// `.gitmodules` lacks an entry for the path.
    #[error("no .gitmodules entry: {identity}")]
    SubmoduleMissingEntry { identity: SubmoduleIdentity },

    /// Submodule pointer commit absent after fetch.
    #[error("submodule commit not found: {identity}")]
    SubmoduleMissingCommit { identity: SubmoduleIdentity },

    /// Not enough disk space for compaction.
    #[error("not enough disk space to run git gc in {dir}")]
    GcDiskFull { dir: PathBuf },

    /// A gc child process failed.
    #[error("gc failed in {dir}: {message}")]
    GcProcessFailed { dir: PathBuf, message: String },

    /// Directory rename during copy-swap failed.
    #[error("failed to rename {from} to {to}")]
    GcRenameFailed { from: PathBuf, to: PathBuf },

    /// Native git cannot be used.
    #[error("native git unavailable: {message}")]
    NativeGitUnavailable { message: String },

    /// Cooperative cancellation.
    #[error("operation cancelled: {reason}")]
    OperationCancelled { reason: String },

    /// Unclassified failure, with the failing operation named.
    #[error("{context}: {message}")]
    Internal { context: String, message: String },
}

impl Error {
    /// Classify this error for policy decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::TransportRecoverable { .. } => ErrorKind::TransportRecoverable,
            Error::TransportPermanent { .. } => ErrorKind::TransportPermanent,
            Error::AuthWrongCredentials { .. } => ErrorKind::AuthWrongCredentials,
            Error::RevisionNotFound { .. } => ErrorKind::RevisionNotFound,
            Error::SubmoduleMissingConfig { .. } => ErrorKind::SubmoduleMissingConfig,
            Error::SubmoduleMissingEntry { .. } => ErrorKind::SubmoduleMissingEntry,
            Error::SubmoduleMissingCommit { .. } => ErrorKind::SubmoduleMissingCommit,
            Error::GcDiskFull { .. } => ErrorKind::GcDiskFull,
            Error::GcProcessFailed { .. } => ErrorKind::GcProcessFailed,
            Error::GcRenameFailed { .. } => ErrorKind::GcRenameFailed,
            Error::NativeGitUnavailable { .. } => ErrorKind::NativeGitUnavailable,
            Error::OperationCancelled { .. } => ErrorKind::OperationCancelled,
            Error::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Build an `Internal` error naming the failing operation.
    pub fn internal(context: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Error::Internal {
            context: context.into(),
            message: message.to_string(),
        }
    }

    /// Attach the affected branch names to a submodule error.
    ///
    /// Other variants pass through unchanged.
    pub fn with_affected_branches(mut self, branches: Vec<String>) -> Self {
        if let Error::SubmoduleMissingConfig { identity }
        | Error::SubmoduleMissingEntry { identity }
        | Error::SubmoduleMissingCommit { identity } = &mut self
        {
            identity.affected_branches = branches;
        }
        self
    }

    /// Wrap this error with an enclosing operation context.
    ///
    /// Submodule errors keep their identity payload untouched; everything
    /// else gains the context prefix. Used by the change collector so that
    /// failures carry the VCS root identity.
    pub fn with_context(self, context: &str) -> Self {
        match self {
            Error::SubmoduleMissingConfig { .. }
            | Error::SubmoduleMissingEntry { .. }
            | Error::SubmoduleMissingCommit { .. }
            | Error::OperationCancelled { .. } => self,
            Error::Internal { context: inner, message } => Error::Internal {
                context: format!("{}: {}", context, inner),
                message,
            },
            other => Error::Internal {
                context: context.to_string(),
                message: other.to_string(),
            },
        }
    }
}

impl From<git2::Error> for Error {
    fn from(err: git2::Error) -> Self {
        classify_git2(&err)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Internal {
            context: "io".to_string(),
            message: err.to_string(),
        }
    }
}

/// Map a git2 error into the taxonomy.
///
/// Network-class failures are treated as recoverable; rejected credentials
/// and certificate problems are permanent.
pub(crate) fn classify_git2(err: &git2::Error) -> Error {
    use git2::{ErrorClass, ErrorCode};
    match (err.class(), err.code()) {
        (_, ErrorCode::Auth) => Error::AuthWrongCredentials {
            url: String::new(),
            message: err.message().to_string(),
        },
        (ErrorClass::Ssl, _) | (_, ErrorCode::Certificate) => Error::TransportPermanent {
            message: err.message().to_string(),
        },
        (ErrorClass::Net, _) | (ErrorClass::Os, _) => Error::TransportRecoverable {
            message: err.message().to_string(),
        },
        (ErrorClass::Http, _) => Error::TransportRecoverable {
            message: err.message().to_string(),
        },
        _ => Error::Internal {
            context: "git".to_string(),
            message: err.message().to_string(),
        },
    }
}
