//! git::version
//!
//! Native git version parsing and capability gates.
//!
//! # Invariants
//!
//! - Callers must check [`GitVersion::is_supported`] before using the
//!   native facade, and [`GitVersion::supports_fetch_stdin`] before
//!   batching refspecs over stdin.
//!
//! # Example
//!
//! ```
//! use mirrorpool::git::version::GitVersion;
//!
//! let version = GitVersion::parse("git version 2.40.1").unwrap();
//! assert!(version.is_supported());
//! assert!(version.supports_fetch_stdin());
//! ```

use thiserror::Error;

/// Errors from version parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VersionError {
    #[error("cannot parse git version from: {0}")]
    Unparseable(String),
}

/// A native git version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GitVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

/// The oldest version the pool will drive.
pub const MIN_SUPPORTED: GitVersion = GitVersion {
    major: 2,
    minor: 29,
    patch: 0,
};

/// First version whose `fetch` accepts refspecs on stdin.
pub const FETCH_STDIN: GitVersion = GitVersion {
    major: 2,
    minor: 29,
    patch: 0,
};

impl GitVersion {
    /// Build a version from components.
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    /// Parse `git version` output.
    ///
    /// Tolerates vendor suffixes (`2.40.1.windows.1`, `2.39.3 (Apple
    /// Git-146)`) by reading only the leading numeric components.
    pub fn parse(output: &str) -> Result<Self, VersionError> {
        let output = output.trim();
        let numbers = output
            .strip_prefix("git version")
            .map(str::trim)
            .unwrap_or(output);
        let numeric_end = numbers
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(numbers.len());
        let mut parts = numbers[..numeric_end].split('.');

        let mut component = |required: bool| -> Result<u32, VersionError> {
            match parts.next() {
                Some(text) if !text.is_empty() => text
                    .parse()
                    .map_err(|_| VersionError::Unparseable(output.to_string())),
                _ if required => Err(VersionError::Unparseable(output.to_string())),
                _ => Ok(0),
            }
        };

        Ok(Self {
            major: component(true)?,
            minor: component(true)?,
            patch: component(false)?,
        })
    }

    /// Whether this version is new enough for the pool at all.
    pub fn is_supported(&self) -> bool {
        *self >= MIN_SUPPORTED
    }

    /// Whether `fetch --stdin` batching is available.
    pub fn supports_fetch_stdin(&self) -> bool {
        *self >= FETCH_STDIN
    }
}

impl std::fmt::Display for GitVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
