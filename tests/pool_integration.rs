//! Integration tests for the mirror pool and the fetch coordinator.
//!
//! These tests use real git repositories created via tempfile to verify
//! behavior against actual git history and transports.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use tempfile::TempDir;

use mirrorpool::core::config::PoolConfig;
use mirrorpool::core::context::OpContext;
use mirrorpool::core::state::StateSnapshot;
use mirrorpool::core::types::{Oid, RepoUrl};
use mirrorpool::error::Error;
use mirrorpool::fetch::{AuthSettings, FetchCoordinator};
use mirrorpool::git::repo::MirrorRepo;
use mirrorpool::pool::MirrorPool;

/// A local "remote" repository driven through the git CLI.
struct TestRemote {
    dir: TempDir,
    branch: String,
}

impl TestRemote {
    fn new() -> Self {
        let dir = TempDir::new().expect("failed to create temp dir");
        run_git(dir.path(), &["init"]);
        run_git(dir.path(), &["config", "user.email", "test@example.com"]);
        run_git(dir.path(), &["config", "user.name", "Test User"]);

        std::fs::write(dir.path().join("README.md"), "# Test\n").unwrap();
        run_git(dir.path(), &["add", "README.md"]);
        run_git(dir.path(), &["commit", "-m", "initial"]);

        let branch = git_output(dir.path(), &["rev-parse", "--abbrev-ref", "HEAD"]);
        Self { dir, branch }
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn url(&self) -> RepoUrl {
        RepoUrl::parse(format!("file://{}", self.path().display())).unwrap()
    }

    fn branch_ref(&self) -> String {
        format!("refs/heads/{}", self.branch)
    }

    fn commit_file(&self, path: &str, content: &str, message: &str) -> Oid {
        std::fs::write(self.path().join(path), content).unwrap();
        run_git(self.path(), &["add", path]);
        run_git(self.path(), &["commit", "-m", message]);
        self.head()
    }

    fn head(&self) -> Oid {
        Oid::new(git_output(self.path(), &["rev-parse", "HEAD"])).unwrap()
    }
}

fn run_git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git command failed");
    if !output.status.success() {
        panic!(
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }
}

fn git_output(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git command failed");
    assert!(output.status.success());
    String::from_utf8(output.stdout).unwrap().trim().to_string()
}

struct Harness {
    _base: TempDir,
    pool: Arc<MirrorPool>,
    fetcher: FetchCoordinator,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(|_| {})
    }

    fn with_config(adjust: impl FnOnce(&mut PoolConfig)) -> Self {
        let base = TempDir::new().unwrap();
        let mut config = PoolConfig::new(base.path().join("mirrors"));
        adjust(&mut config);
        let pool = Arc::new(MirrorPool::new(Arc::new(config)).unwrap());
        let fetcher = FetchCoordinator::new(Arc::clone(&pool));
        Self {
            _base: base,
            pool,
            fetcher,
        }
    }
}

fn ctx() -> OpContext {
    OpContext::new("test")
}

// =============================================================================
// ensure_present
// =============================================================================

#[test]
fn fetches_missing_revisions() {
    let remote = TestRemote::new();
    let tip = remote.head();
    let harness = Harness::new();

    let dir = harness.pool.resolve(&remote.url()).unwrap();
    let state = StateSnapshot::of([(remote.branch_ref(), tip.clone())]);
    harness
        .fetcher
        .ensure_present(&dir, &remote.url(), &AuthSettings::anonymous(), &state, true, &ctx())
        .unwrap();

    let mirror = MirrorRepo::open(dir.path()).unwrap();
    assert!(mirror.has_commit(&tip));
}

#[test]
fn present_revisions_cause_no_fetch() {
    let remote = TestRemote::new();
    let tip = remote.head();
    let harness = Harness::new();

    let dir = harness.pool.resolve(&remote.url()).unwrap();
    let state = StateSnapshot::of([(remote.branch_ref(), tip.clone())]);
    let url = remote.url();
    harness
        .fetcher
        .ensure_present(&dir, &url, &AuthSettings::anonymous(), &state, true, &ctx())
        .unwrap();

    // Destroy the remote: a second call must not need it.
    drop(remote);
    harness
        .fetcher
        .ensure_present(&dir, &url, &AuthSettings::anonymous(), &state, true, &ctx())
        .unwrap();
}

#[test]
fn missing_after_fetch_is_revision_not_found() {
    let remote = TestRemote::new();
    let harness = Harness::new();

    let dir = harness.pool.resolve(&remote.url()).unwrap();
    let absent = Oid::new("9".repeat(40)).unwrap();
    let state = StateSnapshot::of([(remote.branch_ref(), absent.clone())]);

    let err = harness
        .fetcher
        .ensure_present(&dir, &remote.url(), &AuthSettings::anonymous(), &state, true, &ctx())
        .unwrap_err();
    match err {
        Error::RevisionNotFound { missing, .. } => {
            assert_eq!(missing, vec![absent.to_string()]);
        }
        other => panic!("unexpected: {:?}", other),
    }
}

#[test]
fn missing_tolerated_without_throw_flag() {
    let remote = TestRemote::new();
    let harness = Harness::new();

    let dir = harness.pool.resolve(&remote.url()).unwrap();
    let absent = Oid::new("9".repeat(40)).unwrap();
    let state = StateSnapshot::of([(remote.branch_ref(), absent)]);

    harness
        .fetcher
        .ensure_present(&dir, &remote.url(), &AuthSettings::anonymous(), &state, false, &ctx())
        .unwrap();
}

#[test]
fn fetch_deduplicates_across_threads() {
    let remote = TestRemote::new();
    let tip = remote.head();
    let harness = Harness::with_config(|_| {});
    let harness = Arc::new(harness);

    let dir = harness.pool.resolve(&remote.url()).unwrap();
    let state = StateSnapshot::of([(remote.branch_ref(), tip.clone())]);
    let url = remote.url();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let harness = Arc::clone(&harness);
        let dir = dir.clone();
        let state = state.clone();
        let url = url.clone();
        handles.push(std::thread::spawn(move || {
            harness.fetcher.ensure_present(
                &dir,
                &url,
                &AuthSettings::anonymous(),
                &state,
                true,
                &OpContext::new("test"),
            )
        }));
    }
    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    let mirror = MirrorRepo::open(dir.path()).unwrap();
    assert!(mirror.has_commit(&tip));
}

// =============================================================================
// remote_refs
// =============================================================================

#[test]
fn remote_refs_lists_tips() {
    let remote = TestRemote::new();
    let first = remote.head();
    let second = remote.commit_file("a.txt", "a", "second");

    let harness = Harness::new();
    let dir = harness.pool.resolve(&remote.url()).unwrap();

    let refs = harness
        .fetcher
        .remote_refs(&dir, &remote.url(), &AuthSettings::anonymous(), &ctx())
        .unwrap();
    assert_eq!(refs.get(&remote.branch_ref()), Some(&second));
    assert_ne!(first, second);
}

// =============================================================================
// native transport
// =============================================================================

#[test]
fn native_transport_fetches_when_enabled() {
    let remote = TestRemote::new();
    let tip = remote.head();
    let harness = Harness::with_config(|config| {
        config.path_to_git = Some(PathBuf::from("git"));
        config.native_git_operations_enabled = true;
    });

    let dir = harness.pool.resolve(&remote.url()).unwrap();
    let state = StateSnapshot::of([(remote.branch_ref(), tip.clone())]);
    harness
        .fetcher
        .ensure_present(&dir, &remote.url(), &AuthSettings::anonymous(), &state, true, &ctx())
        .unwrap();

    let mirror = MirrorRepo::open(dir.path()).unwrap();
    assert!(mirror.has_commit(&tip));
    assert!(harness.fetcher.native_error_cell().get().is_none());
}

#[test]
fn broken_native_git_falls_back_to_in_process() {
    let remote = TestRemote::new();
    let tip = remote.head();
    let harness = Harness::with_config(|config| {
        config.path_to_git = Some(PathBuf::from("/no/such/git-binary"));
        config.native_git_operations_enabled = true;
    });

    let dir = harness.pool.resolve(&remote.url()).unwrap();
    let state = StateSnapshot::of([(remote.branch_ref(), tip.clone())]);
    harness
        .fetcher
        .ensure_present(&dir, &remote.url(), &AuthSettings::anonymous(), &state, true, &ctx())
        .unwrap();

    // The fetch succeeded in-process and the probe failure is surfaced.
    let mirror = MirrorRepo::open(dir.path()).unwrap();
    assert!(mirror.has_commit(&tip));
    let cell = harness.fetcher.native_error_cell().get().unwrap();
    assert_eq!(cell.git_path, PathBuf::from("/no/such/git-binary"));
}

// =============================================================================
// cancellation
// =============================================================================

#[test]
fn interrupted_context_cancels_fetch() {
    let remote = TestRemote::new();
    let tip = remote.head();
    let harness = Harness::new();

    let dir = harness.pool.resolve(&remote.url()).unwrap();
    let state = StateSnapshot::of([(remote.branch_ref(), tip)]);

    let ctx = OpContext::new("test");
    ctx.interrupt("server shutdown");
    let err = harness
        .fetcher
        .ensure_present(&dir, &remote.url(), &AuthSettings::anonymous(), &state, true, &ctx)
        .unwrap_err();
    assert!(matches!(err, Error::OperationCancelled { .. }));
}
