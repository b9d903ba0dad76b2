//! git::native
//!
//! The native-git facade: assembles argv and environment for every
//! supported subcommand.
//!
//! # Architecture
//!
//! [`NativeGit`] is the single doorway to external git. Each operation is
//! a method that produces a fully-specified [`GitCommand`]; nothing here
//! spawns a process directly, and there are no ambient parameters — the
//! target object database is always passed as `--git-dir`.
//!
//! A facade is obtained through [`detect`], which probes `git version`
//! once per executable path (the result is cached process-wide and
//! re-probed when the configured path changes) and refuses versions older
//! than [`version::MIN_SUPPORTED`].
//!
//! # Capability gates
//!
//! `fetch` batches refspecs over stdin when the detected version supports
//! it and falls back to argv refspecs otherwise. `update-ref --stdin`
//! batching is available unconditionally at the supported baseline.

use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;

use super::exec::GitCommand;
use super::version::{self, GitVersion};
use crate::core::context::OpContext;
use crate::error::Error;

static VERSION_CACHE: Mutex<Option<(PathBuf, GitVersion)>> = Mutex::new(None);

/// Probe the git executable at `git_path` and build a facade over it.
///
/// The probe result is cached per path; a changed path re-probes.
///
/// # Errors
///
/// [`Error::NativeGitUnavailable`] when the executable cannot be run,
/// its output cannot be parsed, or the version is below the supported
/// minimum.
pub fn detect(git_path: &Path, ctx: &OpContext) -> Result<NativeGit, Error> {
    {
        let cache = VERSION_CACHE.lock();
        if let Some((path, version)) = &*cache {
            if path == git_path {
                return Ok(NativeGit {
                    git_path: git_path.to_path_buf(),
                    version: *version,
                });
            }
        }
    }

    let result = GitCommand::new(git_path)
        .arg("version")
        .total_timeout(Duration::from_secs(60))
        .run_checked(ctx)
        .map_err(|e| Error::NativeGitUnavailable {
            message: format!("unable to run git at {}: {}", git_path.display(), e),
        })?;
    let detected =
        GitVersion::parse(&result.stdout).map_err(|e| Error::NativeGitUnavailable {
            message: format!("unable to parse version of git at {}: {}", git_path.display(), e),
        })?;
    if !detected.is_supported() {
        return Err(Error::NativeGitUnavailable {
            message: format!(
                "git at {} has version {}, minimum supported is {}",
                git_path.display(),
                detected,
                version::MIN_SUPPORTED
            ),
        });
    }

    *VERSION_CACHE.lock() = Some((git_path.to_path_buf(), detected));
    tracing::debug!(path = %git_path.display(), version = %detected, "detected native git");
    Ok(NativeGit {
        git_path: git_path.to_path_buf(),
        version: detected,
    })
}

#[cfg(test)]
pub(crate) fn reset_version_cache() {
    *VERSION_CACHE.lock() = None;
}

/// Facade over one detected native git executable.
#[derive(Debug, Clone)]
pub struct NativeGit {
    git_path: PathBuf,
    version: GitVersion,
}

impl NativeGit {
    /// Build a facade without probing; used where the version is already
    /// known (tests, replays of a cached detection).
    pub fn with_version(git_path: impl Into<PathBuf>, version: GitVersion) -> Self {
        Self {
            git_path: git_path.into(),
            version,
        }
    }

    /// The detected version.
    pub fn version(&self) -> GitVersion {
        self.version
    }

    /// Path to the executable.
    pub fn path(&self) -> &Path {
        &self.git_path
    }

    fn command(&self, git_dir: &Path) -> GitCommand {
        GitCommand::new(&self.git_path).arg(format!("--git-dir={}", git_dir.display()))
    }

    /// `git version`
    pub fn version_command(&self) -> GitCommand {
        GitCommand::new(&self.git_path)
            .arg("version")
            .total_timeout(Duration::from_secs(60))
    }

    /// `git init --bare`
    pub fn init_bare(&self, dir: &Path) -> GitCommand {
        GitCommand::new(&self.git_path)
            .arg("init")
            .arg("--bare")
            .arg(dir.display().to_string())
    }

    /// `git clone --mirror <url> <dir>`
    pub fn clone_mirror(&self, url: &str, dir: &Path) -> GitCommand {
        GitCommand::new(&self.git_path)
            .arg("clone")
            .arg("--mirror")
            .arg(url)
            .arg(dir.display().to_string())
    }

    /// `git fetch` with forced refspecs.
    ///
    /// Refspecs travel over stdin (`fetch --stdin`) when the detected
    /// version allows batching, otherwise as argv.
    pub fn fetch(
        &self,
        git_dir: &Path,
        url: &str,
        refspecs: &[String],
        idle_timeout: Duration,
    ) -> GitCommand {
        // Auto-gc after fetch would detach and outlive the runner; the
        // compactor owns maintenance.
        let base = self
            .command(git_dir)
            .arg("-c")
            .arg("gc.auto=0")
            .arg("fetch")
            .arg("--quiet")
            .idle_timeout(idle_timeout)
            .kill_process_tree(true);
        if self.version.supports_fetch_stdin() {
            let mut data = refspecs.join("\n");
            data.push('\n');
            base.arg("--stdin").arg(url).stdin_data(data)
        } else {
            base.arg(url).args(refspecs.iter().cloned())
        }
    }

    /// `git ls-remote <url>`
    pub fn ls_remote(&self, git_dir: &Path, url: &str, show_tags: bool) -> GitCommand {
        let mut cmd = self.command(git_dir).arg("ls-remote");
        if show_tags {
            cmd = cmd.arg("--tags");
        }
        cmd.arg(url)
    }

    /// `git push <url> <refspec>`
    pub fn push(&self, git_dir: &Path, url: &str, refspec: &str) -> GitCommand {
        self.command(git_dir).arg("push").arg(url).arg(refspec)
    }

    /// `git update-ref <ref> <sha>` (or delete with `-d`).
    pub fn update_ref(&self, git_dir: &Path, refname: &str, sha: Option<&str>) -> GitCommand {
        match sha {
            Some(sha) => self.command(git_dir).arg("update-ref").arg(refname).arg(sha),
            None => self.command(git_dir).arg("update-ref").arg("-d").arg(refname),
        }
    }

    /// Batched `git update-ref --stdin`.
    pub fn update_ref_batch(&self, git_dir: &Path) -> UpdateRefBatch {
        UpdateRefBatch {
            command: self.command(git_dir).arg("update-ref").arg("--stdin"),
            lines: String::new(),
        }
    }

    /// `git tag -f <name> <commit>` / `git tag -d <name>`
    pub fn tag(&self, git_dir: &Path, name: &str, commit: Option<&str>) -> GitCommand {
        match commit {
            Some(commit) => self.command(git_dir).arg("tag").arg("-f").arg(name).arg(commit),
            None => self.command(git_dir).arg("tag").arg("-d").arg(name),
        }
    }

    /// `git config --get <key>`
    pub fn config_get(&self, git_dir: &Path, key: &str) -> GitCommand {
        self.command(git_dir).arg("config").arg("--get").arg(key)
    }

    /// `git config <key> <value>`
    pub fn config_set(&self, git_dir: &Path, key: &str, value: &str) -> GitCommand {
        self.command(git_dir).arg("config").arg(key).arg(value)
    }

    /// `git config --list`
    pub fn config_list(&self, git_dir: &Path) -> GitCommand {
        self.command(git_dir).arg("config").arg("--list")
    }

    /// `git remote add <name> <url>`
    pub fn remote_add(&self, git_dir: &Path, name: &str, url: &str) -> GitCommand {
        self.command(git_dir).arg("remote").arg("add").arg(name).arg(url)
    }

    /// `git gc --auto --quiet`, cwd next to the database so relative
    /// alternates resolve; the whole process tree dies on timeout.
    /// Detaching is disabled so the runner observes completion.
    pub fn gc_auto(&self, git_dir: &Path, idle_timeout: Duration) -> GitCommand {
        let cwd = git_dir.parent().unwrap_or(git_dir).to_path_buf();
        self.command(git_dir)
            .arg("-c")
            .arg("gc.autoDetach=false")
            .arg("gc")
            .arg("--auto")
            .arg("--quiet")
            .cwd(cwd)
            .idle_timeout(idle_timeout)
            .kill_process_tree(true)
    }

    /// `git repack <args>` inside `git_dir`.
    pub fn repack(&self, git_dir: &Path, args: &[String], idle_timeout: Duration) -> GitCommand {
        GitCommand::new(&self.git_path)
            .arg("repack")
            .args(args.iter().cloned())
            .cwd(git_dir)
            .idle_timeout(idle_timeout)
            .kill_process_tree(true)
    }

    /// `git pack-refs --all` inside `git_dir`.
    pub fn pack_refs(&self, git_dir: &Path, idle_timeout: Duration) -> GitCommand {
        GitCommand::new(&self.git_path)
            .arg("pack-refs")
            .arg("--all")
            .cwd(git_dir)
            .idle_timeout(idle_timeout)
            .kill_process_tree(true)
    }

    /// `git rev-parse <rev>`
    pub fn rev_parse(&self, git_dir: &Path, rev: &str) -> GitCommand {
        self.command(git_dir).arg("rev-parse").arg(rev)
    }

    /// `git show-ref`
    pub fn show_ref(&self, git_dir: &Path) -> GitCommand {
        self.command(git_dir).arg("show-ref")
    }

    /// `git log` with an explicit format over a revision range.
    pub fn log(&self, git_dir: &Path, format: &str, range: &str) -> GitCommand {
        self.command(git_dir)
            .arg("log")
            .arg(format!("--format={}", format))
            .arg(range)
    }

    /// `git ls-tree <treeish> [path]`
    pub fn ls_tree(&self, git_dir: &Path, treeish: &str, path: Option<&str>) -> GitCommand {
        let cmd = self.command(git_dir).arg("ls-tree").arg(treeish);
        match path {
            Some(path) => cmd.arg(path),
            None => cmd,
        }
    }

    /// `git clean -f -d [-x]` in a working tree.
    pub fn clean(&self, work_tree: &Path, remove_ignored: bool) -> GitCommand {
        let cmd = GitCommand::new(&self.git_path)
            .arg("clean")
            .arg("-f")
            .arg("-d")
            .cwd(work_tree);
        if remove_ignored {
            cmd.arg("-x")
        } else {
            cmd
        }
    }

    /// `git reset --hard <rev>` in a working tree.
    pub fn reset_hard(&self, work_tree: &Path, rev: &str) -> GitCommand {
        GitCommand::new(&self.git_path)
            .arg("reset")
            .arg("--hard")
            .arg(rev)
            .cwd(work_tree)
    }

    /// `git checkout [-f] <rev>` in a working tree.
    pub fn checkout(&self, work_tree: &Path, rev: &str, force: bool) -> GitCommand {
        let cmd = GitCommand::new(&self.git_path).arg("checkout").cwd(work_tree);
        let cmd = if force { cmd.arg("-f") } else { cmd };
        cmd.arg(rev)
    }

    /// `git branch -D <name>`
    pub fn delete_branch(&self, git_dir: &Path, name: &str) -> GitCommand {
        self.command(git_dir).arg("branch").arg("-D").arg(name)
    }

    /// `git submodule init|sync|update` in a working tree.
    pub fn submodule(&self, work_tree: &Path, action: SubmoduleAction) -> GitCommand {
        let cmd = GitCommand::new(&self.git_path).arg("submodule").cwd(work_tree);
        match action {
            SubmoduleAction::Init => cmd.arg("init"),
            SubmoduleAction::Sync => cmd.arg("sync"),
            SubmoduleAction::Update { force } => {
                let cmd = cmd.arg("update");
                if force {
                    cmd.arg("--force")
                } else {
                    cmd
                }
            }
        }
    }

    /// `git update-index --add --cacheinfo <mode>,<sha>,<path>`
    pub fn update_index_cacheinfo(
        &self,
        work_tree: &Path,
        mode: &str,
        sha: &str,
        path: &str,
    ) -> GitCommand {
        GitCommand::new(&self.git_path)
            .arg("update-index")
            .arg("--add")
            .arg("--cacheinfo")
            .arg(format!("{},{},{}", mode, sha, path))
            .cwd(work_tree)
    }

    /// `git diff --name-status <from> <to>`
    pub fn diff_name_status(&self, git_dir: &Path, from: &str, to: &str) -> GitCommand {
        self.command(git_dir)
            .arg("diff")
            .arg("--name-status")
            .arg(from)
            .arg(to)
    }

    /// `git merge [--ff-only] <rev>` in a working tree.
    pub fn merge(&self, work_tree: &Path, rev: &str, ff_only: bool) -> GitCommand {
        let cmd = GitCommand::new(&self.git_path).arg("merge").cwd(work_tree);
        let cmd = if ff_only { cmd.arg("--ff-only") } else { cmd };
        cmd.arg(rev)
    }
}

/// The `git submodule` subcommand to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmoduleAction {
    Init,
    Sync,
    Update { force: bool },
}

/// Builder for `git update-ref --stdin`.
///
/// Commands follow the documented stdin grammar:
///
/// ```text
/// update SP <ref> SP <newvalue> [SP <oldvalue>] LF
/// create SP <ref> SP <newvalue> LF
/// delete SP <ref> [SP <oldvalue>] LF
/// verify SP <ref> [SP <oldvalue>] LF
/// option SP <opt> LF
/// ```
#[derive(Debug)]
pub struct UpdateRefBatch {
    command: GitCommand,
    lines: String,
}

impl UpdateRefBatch {
    /// Queue an update, optionally guarded by the expected old value.
    pub fn update(mut self, refname: &str, value: &str, old: Option<&str>) -> Self {
        match old {
            Some(old) => {
                self.lines
                    .push_str(&format!("update {} {} {}\n", refname, value, old));
            }
            None => self.lines.push_str(&format!("update {} {}\n", refname, value)),
        }
        self
    }

    /// Queue a creation; fails if the ref exists.
    pub fn create(mut self, refname: &str, value: &str) -> Self {
        self.lines.push_str(&format!("create {} {}\n", refname, value));
        self
    }

    /// Queue a deletion, optionally guarded by the expected old value.
    pub fn delete(mut self, refname: &str, old: Option<&str>) -> Self {
        match old {
            Some(old) => self.lines.push_str(&format!("delete {} {}\n", refname, old)),
            None => self.lines.push_str(&format!("delete {}\n", refname)),
        }
        self
    }

    /// Queue a verification of the current value.
    pub fn verify(mut self, refname: &str, old: Option<&str>) -> Self {
        match old {
            Some(old) => self.lines.push_str(&format!("verify {} {}\n", refname, old)),
            None => self.lines.push_str(&format!("verify {}\n", refname)),
        }
        self
    }

    /// Queue an option line (e.g. `no-deref`).
    pub fn option(mut self, option: &str) -> Self {
        self.lines.push_str(&format!("option {}\n", option));
        self
    }

    /// Whether any commands were queued.
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Finish the batch into a runnable command.
    pub fn build(self) -> GitCommand {
        self.command.stdin_data(self.lines)
    }
}

/// Parse `ls-remote` output: `<40-hex sha> TAB <refname>` per line.
pub fn parse_ls_remote(stdout: &str) -> Vec<(String, String)> {
    let mut refs = Vec::new();
    for line in stdout.lines() {
        let line = line.trim();
        if line.len() <= 40 {
            continue;
        }
        let (sha, name) = line.split_at(40);
        if !sha.chars().all(|c| c.is_ascii_hexdigit()) {
            continue;
        }
        refs.push((name.trim().to_string(), sha.to_string()));
    }
    refs
}
