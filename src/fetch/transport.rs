//! fetch::transport
//!
//! The in-process transport: fetch and ls-remote through libgit2.
//!
//! # Architecture
//!
//! The coordinator treats this module as a plug-in with the same surface
//! as the native path. Authentication is limited to username/password
//! (token) pairs supplied by the VCS root descriptor; ssh key plumbing
//! lives outside the core.

use std::collections::BTreeMap;
use std::path::Path;

use git2::{CredentialType, Direction, FetchOptions, RemoteCallbacks, Repository};

use crate::core::types::{Oid, RepoUrl};
use crate::error::{classify_git2, Error};

/// Credentials for one remote, as supplied by a VCS root descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthSettings {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl AuthSettings {
    /// No credentials; anonymous or url-embedded access only.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Username/password (or token) credentials.
    pub fn userpass(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    fn callbacks(&self) -> RemoteCallbacks<'_> {
        let mut callbacks = RemoteCallbacks::new();
        callbacks.credentials(move |_url, username_from_url, allowed| {
            if allowed.contains(CredentialType::USER_PASS_PLAINTEXT) {
                if let Some(password) = &self.password {
                    let username = self
                        .username
                        .as_deref()
                        .or(username_from_url)
                        .unwrap_or_default();
                    return git2::Cred::userpass_plaintext(username, password);
                }
            }
            if allowed.contains(CredentialType::USERNAME) {
                if let Some(username) = self.username.as_deref().or(username_from_url) {
                    return git2::Cred::username(username);
                }
            }
            git2::Cred::default()
        });
        callbacks
    }
}

/// Fetch `refspecs` from `url` into the mirror at `mirror_dir`.
pub fn fetch(
    mirror_dir: &Path,
    url: &RepoUrl,
    auth: &AuthSettings,
    refspecs: &[String],
) -> Result<(), Error> {
    let repo = Repository::open(mirror_dir)
        .map_err(|e| Error::internal(format!("open mirror {}", mirror_dir.display()), e.message()))?;
    let mut remote = repo
        .remote_anonymous(url.raw())
        .map_err(|e| classify(e, url))?;

    let mut options = FetchOptions::new();
    options.remote_callbacks(auth.callbacks());

    remote
        .fetch(refspecs, Some(&mut options), None)
        .map_err(|e| classify(e, url))
}

/// List the remote's refs: full ref name to tip sha.
pub fn remote_refs(
    mirror_dir: &Path,
    url: &RepoUrl,
    auth: &AuthSettings,
) -> Result<BTreeMap<String, Oid>, Error> {
    let repo = Repository::open(mirror_dir)
        .map_err(|e| Error::internal(format!("open mirror {}", mirror_dir.display()), e.message()))?;
    let mut remote = repo
        .remote_anonymous(url.raw())
        .map_err(|e| classify(e, url))?;

    let connection = remote
        .connect_auth(Direction::Fetch, Some(auth.callbacks()), None)
        .map_err(|e| classify(e, url))?;
    let mut refs = BTreeMap::new();
    for head in connection.list().map_err(|e| classify(e, url))? {
        refs.insert(head.name().to_string(), Oid::from(head.oid()));
    }
    Ok(refs)
}

fn classify(err: git2::Error, url: &RepoUrl) -> Error {
    match classify_git2(&err) {
        Error::AuthWrongCredentials { message, .. } => Error::AuthWrongCredentials {
            url: url.canonical().to_string(),
            message,
        },
        other => other,
    }
}
