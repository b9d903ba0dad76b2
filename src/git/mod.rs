//! git
//!
//! The two git doorways of the pool.
//!
//! # Architecture
//!
//! - [`exec`] - the process runner; the only place a child process is
//!   spawned and waited on
//! - [`native`] - the native-git facade; builds argv + environment for
//!   every supported subcommand and gates features on the detected version
//! - [`version`] - version parsing and capability checks
//! - [`repo`] - the in-process (git2) doorway to a mirror's object
//!   database
//!
//! No other module spawns git or imports git2's repository type directly;
//! consistency of error handling and timeouts depends on it.

pub mod exec;
pub mod native;
pub mod repo;
pub mod version;

pub use self::exec::{escape_echo_argument_windows, ExecError, ExecResult, GitCommand};
pub use self::native::{detect, parse_ls_remote, NativeGit, SubmoduleAction, UpdateRefBatch};
pub use self::repo::{MirrorRepo, GITLINK_FILEMODE, REMOTE_URL_KEY};
pub use self::version::{GitVersion, VersionError, FETCH_STDIN, MIN_SUPPORTED};
