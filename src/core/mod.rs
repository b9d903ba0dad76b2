//! core
//!
//! Domain types, configuration, and operation plumbing shared by every
//! component of the mirror pool.
//!
//! # Modules
//!
//! - [`types`] - Validated identifiers: object ids, canonical repository URLs
//! - [`state`] - Repository state snapshots (branch tips of interest)
//! - [`rules`] - Checkout rules (path-inclusion predicate)
//! - [`context`] - Cooperative cancellation and progress reporting
//! - [`config`] - Pool configuration schema and loading

pub mod config;
pub mod context;
pub mod rules;
pub mod state;
pub mod types;

pub use self::config::{ConfigError, PoolConfig};
pub use self::context::{BufferedProgress, NullProgress, OpContext, ProgressSink};
pub use self::rules::{CheckoutRules, RulesError};
pub use self::state::StateSnapshot;
pub use self::types::{expand_ref, Oid, RepoUrl, TypeError};
