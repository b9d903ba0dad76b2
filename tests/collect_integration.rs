//! Integration tests for change collection and the checkout-rules
//! walker, against real git history.

use std::collections::HashMap;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use tempfile::TempDir;

use mirrorpool::collect::{latest_matching, ChangeCollector, ChangeKind, ModificationRecord};
use mirrorpool::core::config::PoolConfig;
use mirrorpool::core::context::OpContext;
use mirrorpool::core::rules::CheckoutRules;
use mirrorpool::core::state::StateSnapshot;
use mirrorpool::core::types::{Oid, RepoUrl};
use mirrorpool::fetch::{AuthSettings, FetchCoordinator};
use mirrorpool::git::repo::MirrorRepo;
use mirrorpool::pool::MirrorPool;

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
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(self.path().join(parent)).unwrap();
            }
        }
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
    collector: ChangeCollector,
}

impl Harness {
    fn new() -> Self {
        let base = TempDir::new().unwrap();
        let config = Arc::new(PoolConfig::new(base.path().join("mirrors")));
        let pool = Arc::new(MirrorPool::new(config).unwrap());
        let fetcher = Arc::new(FetchCoordinator::new(Arc::clone(&pool)));
        let collector = ChangeCollector::new(Arc::clone(&pool), fetcher);
        Self {
            _base: base,
            pool,
            collector,
        }
    }

    fn collect(
        &self,
        remote: &TestRemote,
        from: &StateSnapshot,
        to: &StateSnapshot,
        rules: &CheckoutRules,
    ) -> Vec<ModificationRecord> {
        self.collector
            .collect_changes(
                &remote.url(),
                &AuthSettings::anonymous(),
                from,
                to,
                rules,
                &OpContext::new("collecting changes"),
            )
            .unwrap()
    }
}

fn state(remote: &TestRemote, sha: &Oid) -> StateSnapshot {
    StateSnapshot::of([(remote.branch_ref(), sha.clone())])
}

/// Children must precede parents in the output.
fn assert_reverse_topological(records: &[ModificationRecord]) {
    let index: HashMap<&Oid, usize> = records
        .iter()
        .enumerate()
        .map(|(i, r)| (&r.commit, i))
        .collect();
    for (i, record) in records.iter().enumerate() {
        for parent in &record.parents {
            if let Some(&parent_index) = index.get(parent) {
                assert!(
                    i < parent_index,
                    "commit {} at {} must precede parent {} at {}",
                    record.commit,
                    i,
                    parent,
                    parent_index
                );
            }
        }
    }
}

// =============================================================================
// Linear history
// =============================================================================

#[test]
fn linear_history_yields_ordered_records() {
    let remote = TestRemote::new();
    let a = remote.head();
    let b = remote.commit_file("b.txt", "b", "add b");
    let c = remote.commit_file("c.txt", "c", "add c");

    let harness = Harness::new();
    let records = harness.collect(
        &remote,
        &state(&remote, &a),
        &state(&remote, &c),
        &CheckoutRules::accept_all(),
    );

    assert_eq!(records.len(), 2);
    assert_eq!(records[0].commit, c);
    assert_eq!(records[0].parents, vec![b.clone()]);
    assert_eq!(records[1].commit, b);
    assert_eq!(records[1].parents, vec![a]);
    assert_reverse_topological(&records);

    assert_eq!(records[0].file_changes.len(), 1);
    assert_eq!(records[0].file_changes[0].path, "c.txt");
    assert_eq!(records[0].file_changes[0].kind, ChangeKind::Added);
    assert_eq!(records[1].message.trim(), "add b");
}

#[test]
fn collect_is_idempotent() {
    let remote = TestRemote::new();
    let a = remote.head();
    remote.commit_file("b.txt", "b", "add b");
    let c = remote.commit_file("c.txt", "c", "add c");

    let harness = Harness::new();
    let from = state(&remote, &a);
    let to = state(&remote, &c);
    let rules = CheckoutRules::accept_all();

    let first = harness.collect(&remote, &from, &to, &rules);
    let second = harness.collect(&remote, &from, &to, &rules);
    assert_eq!(first, second);
}

#[test]
fn from_commits_are_excluded() {
    let remote = TestRemote::new();
    let a = remote.head();
    let b = remote.commit_file("b.txt", "b", "add b");
    let c = remote.commit_file("c.txt", "c", "add c");

    let harness = Harness::new();
    let records = harness.collect(
        &remote,
        &state(&remote, &b),
        &state(&remote, &c),
        &CheckoutRules::accept_all(),
    );

    let shas: Vec<&Oid> = records.iter().map(|r| &r.commit).collect();
    assert!(!shas.contains(&&a));
    assert!(!shas.contains(&&b));
    assert_eq!(shas, vec![&c]);
}

#[test]
fn absent_from_state_yields_empty_list() {
    let remote = TestRemote::new();
    let tip = remote.head();

    let harness = Harness::new();
    let unknown = Oid::new("8".repeat(40)).unwrap();
    let records = harness.collect(
        &remote,
        &state(&remote, &unknown),
        &state(&remote, &tip),
        &CheckoutRules::accept_all(),
    );
    assert!(records.is_empty());
}

// =============================================================================
// Merges
// =============================================================================

#[test]
fn merge_produces_combined_diff_records() {
    let remote = TestRemote::new();
    let a = remote.head();
    run_git(remote.path(), &["checkout", "-b", "side"]);
    let c = remote.commit_file("side.txt", "side", "side change");
    run_git(remote.path(), &["checkout", &remote.branch]);
    let b = remote.commit_file("main.txt", "main", "main change");
    run_git(remote.path(), &["merge", "side", "--no-ff", "-m", "merge side"]);
    let m = remote.head();

    let harness = Harness::new();
    let records = harness.collect(
        &remote,
        &state(&remote, &a),
        &state(&remote, &m),
        &CheckoutRules::accept_all(),
    );

    assert_eq!(records.len(), 3);
    assert_eq!(records[0].commit, m);
    assert!(records[0].is_merge());
    assert_eq!(records[0].parents, vec![b.clone(), c.clone()]);
    assert_reverse_topological(&records);

    // Each side's content agrees with one parent, so the combined diff
    // of the merge itself is empty.
    assert!(records[0].file_changes.is_empty());

    let shas: Vec<&Oid> = records.iter().map(|r| &r.commit).collect();
    assert!(shas.contains(&&b));
    assert!(shas.contains(&&c));
}

// =============================================================================
// Checkout rules
// =============================================================================

#[test]
fn rules_filter_changes_but_keep_history() {
    let remote = TestRemote::new();
    let a = remote.head();
    remote.commit_file("docs/guide.md", "g", "docs only");
    let c = remote.commit_file("src/lib.rs", "l", "src change");

    let harness = Harness::new();
    let rules = CheckoutRules::parse("+:src").unwrap();
    let records = harness.collect(&remote, &state(&remote, &a), &state(&remote, &c), &rules);

    // Both commits are reported; only visible paths survive filtering.
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].file_changes.len(), 1);
    assert_eq!(records[0].file_changes[0].path, "src/lib.rs");
    assert!(records[1].file_changes.is_empty());
}

// =============================================================================
// Submodules
// =============================================================================

#[test]
fn submodule_pointer_update_is_expanded() {
    // Sub-repository with two commits.
    let sub = TestRemote::new();
    let s1 = sub.head();
    let s2 = sub.commit_file("sub.txt", "v2", "update sub");

    // Parent repository referencing the sub at s1, then at s2.
    let parent = TestRemote::new();
    let gitmodules = format!(
        "[submodule \"lib\"]\n\tpath = lib\n\turl = file://{}\n",
        sub.path().display()
    );
    std::fs::write(parent.path().join(".gitmodules"), &gitmodules).unwrap();
    run_git(parent.path(), &["add", ".gitmodules"]);
    run_git(
        parent.path(),
        &[
            "update-index",
            "--add",
            "--cacheinfo",
            &format!("160000,{},lib", s1),
        ],
    );
    run_git(parent.path(), &["commit", "-m", "add submodule"]);
    let p1 = parent.head();

    run_git(
        parent.path(),
        &[
            "update-index",
            "--add",
            "--cacheinfo",
            &format!("160000,{},lib", s2),
        ],
    );
    run_git(parent.path(), &["commit", "-m", "bump submodule"]);
    let p2 = parent.head();

    let harness = Harness::new();
    let records = harness.collect(
        &parent,
        &state(&parent, &p1),
        &state(&parent, &p2),
        &CheckoutRules::accept_all(),
    );

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].commit, p2);
    // The pointer change is inlined as the sub-repository's file diff.
    let paths: Vec<&str> = records[0].paths().collect();
    assert_eq!(paths, vec!["lib/sub.txt"]);
    assert_eq!(records[0].file_changes[0].kind, ChangeKind::Added);
}

// =============================================================================
// Checkout-rules walker
// =============================================================================

fn open_mirror(harness: &Harness, remote: &TestRemote) -> MirrorRepo {
    // Materialize the whole branch into the mirror first.
    let dir = harness.pool.resolve(&remote.url()).unwrap();
    let fetcher = FetchCoordinator::new(Arc::clone(&harness.pool));
    fetcher
        .fetch_all_refs(
            &dir,
            &remote.url(),
            &AuthSettings::anonymous(),
            &OpContext::new("test"),
        )
        .unwrap();
    MirrorRepo::open(dir.path()).unwrap()
}

#[test]
fn walker_finds_latest_matching_commit() {
    let remote = TestRemote::new();
    remote.commit_file("src/a.rs", "a", "src change");
    let wanted = remote.head();
    remote.commit_file("docs/b.md", "b", "docs 1");
    let start = remote.commit_file("docs/c.md", "c", "docs 2");

    let harness = Harness::new();
    let mirror = open_mirror(&harness, &remote);
    let rules = CheckoutRules::parse("+:src").unwrap();

    let result = latest_matching(&mirror, &start, &rules, &[], &OpContext::new("test")).unwrap();
    assert_eq!(result.matching, Some(wanted));
    assert!(result.reached_stops.is_empty());
    assert!(result.visited.len() >= 3);
}

#[test]
fn walker_stops_at_stop_revisions() {
    let remote = TestRemote::new();
    let stop = remote.commit_file("src/a.rs", "a", "src change");
    remote.commit_file("docs/b.md", "b", "docs 1");
    let start = remote.commit_file("docs/c.md", "c", "docs 2");

    let harness = Harness::new();
    let mirror = open_mirror(&harness, &remote);
    let rules = CheckoutRules::parse("+:src").unwrap();

    let result = latest_matching(
        &mirror,
        &start,
        &rules,
        std::slice::from_ref(&stop),
        &OpContext::new("test"),
    )
    .unwrap();
    // The only src-touching commit is hidden behind the stop.
    assert_eq!(result.matching, None);
    assert_eq!(result.reached_stops, vec![stop]);
}

#[test]
fn walker_reports_partially_affected_merge() {
    let remote = TestRemote::new();
    remote.head();
    // Side line touches only docs; main line touches src.
    run_git(remote.path(), &["checkout", "-b", "side"]);
    remote.commit_file("docs/d.md", "d", "docs change");
    run_git(remote.path(), &["checkout", &remote.branch]);
    let b = remote.commit_file("src/s.rs", "s", "src change");
    run_git(remote.path(), &["merge", "side", "--no-ff", "-m", "merge side"]);
    let m = remote.head();

    let harness = Harness::new();
    let mirror = open_mirror(&harness, &remote);
    let rules = CheckoutRules::parse("+:src").unwrap();

    // Stopping at the src-touching parent leaves no clean match; the
    // merge is partially affected (one parent diff is visible, one not).
    let result = latest_matching(
        &mirror,
        &m,
        &rules,
        std::slice::from_ref(&b),
        &OpContext::new("test"),
    )
    .unwrap();
    assert_eq!(result.matching, None);
    assert_eq!(result.closest_partial_merge, Some(m));
    assert!(result.reached_stops.contains(&b));
}

#[test]
fn walker_start_in_stops_returns_immediately() {
    let remote = TestRemote::new();
    let tip = remote.head();

    let harness = Harness::new();
    let mirror = open_mirror(&harness, &remote);

    let result = latest_matching(
        &mirror,
        &tip,
        &CheckoutRules::accept_all(),
        std::slice::from_ref(&tip),
        &OpContext::new("test"),
    )
    .unwrap();
    assert_eq!(result.matching, None);
    assert_eq!(result.reached_stops, vec![tip]);
    assert!(result.visited.is_empty());
}
