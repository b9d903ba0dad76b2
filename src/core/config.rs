//! core::config
//!
//! Pool configuration: schema, defaults, and TOML loading.
//!
//! # Overview
//!
//! All tunables of the mirror pool are injected through [`PoolConfig`];
//! components never read ambient global state. The only required field is
//! `base_dir` (where mirrors live); everything else has a server-grade
//! default.
//!
//! # Example
//!
//! ```
//! use mirrorpool::core::config::PoolConfig;
//!
//! let config = PoolConfig::new("/var/lib/ci/git-mirrors");
//! assert_eq!(config.mirror_expiration_days, 7);
//! assert!(!config.native_operations_enabled_for("https://host/proj.git"));
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file '{path}': {message}")]
    ParseError { path: PathBuf, message: String },
}

/// Configuration for the mirror pool and its background compaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Root directory under which all mirrors are created.
    pub base_dir: PathBuf,

    /// Path to the native git executable. `None` disables every native
    /// code path (fetch transport and gc engine selection fall back to
    /// in-process behavior).
    pub path_to_git: Option<PathBuf>,

    /// Global switch for native-git remote operations.
    pub native_git_operations_enabled: bool,

    /// Per-URL-prefix overrides for native operations; the longest
    /// matching prefix wins over the global switch.
    pub native_operations_url_prefixes: BTreeMap<String, bool>,

    /// Compact mirrors in place (under the write lock) instead of the
    /// copy-swap scheme.
    pub run_in_place_gc: bool,

    /// Wall-clock budget for one compaction round, in minutes.
    pub native_gc_quota_minutes: u64,

    /// Age in hours after which files under `monitoring/` are deleted.
    pub monitoring_expiration_hours: u64,

    /// Days without access after which a mirror is removed.
    pub mirror_expiration_days: u64,

    /// Retry attempts for recoverable transport errors.
    pub connection_retry_attempts: u32,

    /// Pause between transport retries, in milliseconds.
    pub connection_retry_interval_millis: u64,

    /// Extra arguments for `git repack` during copy-swap compaction.
    pub repack_args: Vec<String>,

    /// Idle timeout for `git repack`, in seconds.
    pub repack_idle_timeout_seconds: u64,

    /// Idle timeout for `git pack-refs`, in seconds.
    pub pack_refs_idle_timeout_seconds: u64,

    /// Idle timeout for native fetches, in seconds.
    pub fetch_idle_timeout_seconds: u64,

    /// Remove temporary files written for child processes; keep them for
    /// debugging when false.
    pub delete_temp_files: bool,

    /// Name of the per-mirror operator-data subdirectory.
    pub monitoring_dir_name: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::new(),
            path_to_git: None,
            native_git_operations_enabled: false,
            native_operations_url_prefixes: BTreeMap::new(),
            run_in_place_gc: false,
            native_gc_quota_minutes: 60,
            monitoring_expiration_hours: 24,
            mirror_expiration_days: 7,
            connection_retry_attempts: 3,
            connection_retry_interval_millis: 4000,
            repack_args: vec!["-a".to_string(), "-d".to_string()],
            repack_idle_timeout_seconds: 1800,
            pack_refs_idle_timeout_seconds: 300,
            fetch_idle_timeout_seconds: 600,
            delete_temp_files: true,
            monitoring_dir_name: "monitoring".to_string(),
        }
    }
}

impl PoolConfig {
    /// Defaults rooted at `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Self::default()
        }
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Whether native-git remote operations are enabled for a URL.
    ///
    /// The longest configured prefix that matches the URL decides; with no
    /// matching prefix the global switch applies.
    pub fn native_operations_enabled_for(&self, url: &str) -> bool {
        let mut best: Option<(usize, bool)> = None;
        for (prefix, enabled) in &self.native_operations_url_prefixes {
            if url.starts_with(prefix.as_str()) {
                let len = prefix.len();
                if best.map_or(true, |(b, _)| len >= b) {
                    best = Some((len, *enabled));
                }
            }
        }
        match best {
            Some((_, enabled)) => enabled,
            None => self.native_git_operations_enabled,
        }
    }

    /// Retry pause as a `Duration`.
    pub fn connection_retry_interval(&self) -> Duration {
        Duration::from_millis(self.connection_retry_interval_millis)
    }

    /// Wall-clock compaction budget as a `Duration`.
    pub fn gc_quota(&self) -> Duration {
        Duration::from_secs(self.native_gc_quota_minutes * 60)
    }

    /// Idle timeout for gc child processes: one quota worth of silence.
    pub fn gc_idle_timeout(&self) -> Duration {
        self.gc_quota()
    }
}
