//! cleanup
//!
//! The compactor: periodic, quota-bounded maintenance of all mirrors.
//!
//! # One round
//!
//! 1. Remove expired mirrors (under the exclusive rm lock).
//! 2. Age out files under each mirror's `monitoring/` directory.
//! 3. Delete stale `*.git.gc*` copies left by crashed compactions.
//! 4. For every mirror, shuffled to spread wear and bounded by a
//!    wall-clock quota: check disk space, then compact — either in
//!    place (`git gc --auto --quiet` under the write lock) or via the
//!    copy-swap scheme.
//!
//! Rounds are guarded by a process-wide single permit: when another
//! round is still running, the trigger is skipped with a log line.
//! Failures never propagate; they are recorded per mirror in the GC
//! error registry and the round continues.
//!
//! # Copy-swap
//!
//! A parallel bare repository `<name>.git.gc` is built next to the
//! mirror with `objects/info/alternates` pointing at the original, so
//! `repack` writes a compacted pack without touching the live database.
//! After `pack-refs --all`, the alternates file is removed (the copy
//! becomes standalone) and the directories are swapped under `rm.write`:
//! original → `<name>.git.old`, copy → original. Renames are retried;
//! a failed second rename restores the original from `.old`. The `.old`
//! and leftover copies are deleted outside the lock.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rand::seq::SliceRandom;

use crate::core::context::OpContext;
use crate::error::Error;
use crate::git::native::{self, NativeGit};
use crate::git::repo::MirrorRepo;
use crate::pool::errors::{GcErrors, NativeGitErrorCell};
use crate::pool::{MirrorDir, MirrorPool};

/// Process-wide single permit for compaction rounds.
static CLEANUP_PERMIT: Mutex<()> = Mutex::new(());

const RENAME_ATTEMPTS: u32 = 5;
const RENAME_BACKOFF: std::time::Duration = std::time::Duration::from_millis(100);

/// The periodic compactor.
pub struct Cleanup {
    pool: Arc<MirrorPool>,
    gc_errors: Arc<GcErrors>,
    native_error: Arc<NativeGitErrorCell>,
}

impl Cleanup {
    pub fn new(
        pool: Arc<MirrorPool>,
        gc_errors: Arc<GcErrors>,
        native_error: Arc<NativeGitErrorCell>,
    ) -> Self {
        Self {
            pool,
            gc_errors,
            native_error,
        }
    }

    /// The per-mirror error registry.
    pub fn gc_errors(&self) -> &Arc<GcErrors> {
        &self.gc_errors
    }

    /// Run one compaction round; skips immediately when another round is
    /// in progress anywhere in the process.
    pub fn run(&self, ctx: &OpContext) {
        let Some(_permit) = CLEANUP_PERMIT.try_lock() else {
            tracing::info!("skip git cleanup: another git cleanup round is running");
            return;
        };

        tracing::info!("git cleanup started");
        self.remove_unused_repositories();
        self.cleanup_monitoring_data();
        self.run_gc(ctx);
        tracing::info!("git cleanup finished");
    }

    fn remove_unused_repositories(&self) {
        for dir in self.pool.expired_dirs() {
            tracing::info!(dir = %dir, "removing unused mirror");
            let deleted = {
                let _rm = self.pool.rm_write_lock(&dir);
                std::fs::remove_dir_all(dir.path()).is_ok()
            };
            if deleted {
                self.gc_errors.clear(dir.path());
            } else {
                tracing::error!(dir = %dir, "cannot delete unused mirror");
                self.pool.invalidate(&dir);
            }
        }
    }

    fn cleanup_monitoring_data(&self) {
        tracing::debug!("start cleaning git monitoring data");
        let expiration_hours = self.pool.config().monitoring_expiration_hours;
        for dir in self.pool.all_mirror_dirs() {
            let monitoring = dir.path().join(&self.pool.config().monitoring_dir_name);
            let Ok(entries) = std::fs::read_dir(&monitoring) else {
                continue;
            };
            for entry in entries.flatten() {
                if file_age_hours(&entry.path()).map_or(false, |age| age > expiration_hours) {
                    tracing::debug!(file = %entry.path().display(), "removing old monitoring data");
                    let _ = std::fs::remove_file(entry.path());
                }
            }
        }
        tracing::debug!("finish cleaning git monitoring data");
    }

    fn run_gc(&self, ctx: &OpContext) {
        let start = Instant::now();
        let quota = self.pool.config().gc_quota();

        let stale_copies = self.pool.gc_leftover_dirs();
        if !stale_copies.is_empty() {
            tracing::info!(
                count = stale_copies.len(),
                "found repository copies left by failed gc attempts, removing them"
            );
            for stale in stale_copies {
                let _ = std::fs::remove_dir_all(&stale);
            }
        }

        let mut dirs = self.pool.all_mirror_dirs();
        let current: Vec<PathBuf> = dirs.iter().map(|d| d.path().to_path_buf()).collect();
        self.gc_errors.retain(&current);
        if dirs.is_empty() {
            tracing::debug!("no repositories found");
            // No configured-git problem worth showing without mirrors.
            self.native_error.clear();
            return;
        }

        let Some(git) = self.detect_native(ctx) else {
            tracing::info!("cannot find native git, skip running git gc");
            return;
        };
        let free_disk = fs2::available_space(self.pool.base_dir()).ok();
        tracing::info!(git = %git.path().display(), "git garbage collection started");

        dirs.shuffle(&mut rand::thread_rng());
        let run_in_place = self.pool.config().run_in_place_gc;
        let mut processed = 0usize;
        for dir in &dirs {
            if let Some(url) = self.pool.url_of(dir) {
                tracing::debug!(dir = %dir, url = %url, "mirror remote");
            }
            if enough_disk_space_for_gc(dir, free_disk) {
                if run_in_place {
                    self.run_in_place_gc(&git, dir, ctx);
                } else {
                    self.run_gc_in_copy(&git, dir, start, quota, ctx);
                }
            } else {
                self.gc_errors
                    .register(dir.path(), "Not enough disk space to run git gc", None);
                tracing::warn!(dir = %dir, free_disk, "not enough disk space to run git gc");
            }

            processed += 1;
            if start.elapsed() > quota {
                let rest = dirs.len() - processed;
                if rest > 0 {
                    tracing::info!(
                        skipped = rest,
                        "git garbage collection quota exceeded, skip {} repositories",
                        rest
                    );
                    break;
                }
            }
        }
        tracing::info!(
            duration_ms = start.elapsed().as_millis() as u64,
            "git garbage collection finished"
        );
    }

    /// Probe the configured git; failures land in the process-wide cell.
    fn detect_native(&self, ctx: &OpContext) -> Option<NativeGit> {
        let path = self.pool.config().path_to_git.clone()?;
        match native::detect(&path, ctx) {
            Ok(git) => {
                self.native_error.clear();
                Some(git)
            }
            Err(e) => {
                self.native_error.set(&path, e.to_string());
                tracing::warn!(error = %e, "failed to run configured git");
                None
            }
        }
    }

    fn run_in_place_gc(&self, git: &NativeGit, dir: &MirrorDir, ctx: &OpContext) {
        let _write = self.pool.write_lock(dir);
        let start = Instant::now();
        tracing::info!(dir = %dir, "start in-place git gc");
        let result = git
            .gc_auto(dir.path(), self.pool.config().gc_idle_timeout())
            .run_checked(ctx);
        match result {
            Ok(_) => {
                tracing::info!(
                    dir = %dir,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "finished in-place git gc"
                );
                self.gc_errors.clear(dir.path());
            }
            Err(e) => {
                self.gc_errors
                    .register(dir.path(), "Error while running git gc", Some(&e));
            }
        }
    }

    fn run_gc_in_copy(
        &self,
        git: &NativeGit,
        dir: &MirrorDir,
        round_start: Instant,
        quota: std::time::Duration,
        ctx: &OpContext,
    ) {
        // The write lock taken by the in-place fallback must not be
        // acquired while rm.read is still held here; compute the copy
        // under rm.read, fall back after releasing it.
        let mut compact_failed = false;
        let gc_repo = {
            let _rm_read = self.pool.rm_read_lock(dir);

            if !self.is_gc_needed(dir) {
                tracing::debug!(dir = %dir, "no git gc needed");
                self.gc_errors.clear(dir.path());
                return;
            }

            let gc_repo = match setup_gc_repo(dir.path()) {
                Ok(gc_repo) => gc_repo,
                Err(e) => {
                    self.gc_errors.register(
                        dir.path(),
                        "Failed to create temporary repository for garbage collection",
                        Some(&e),
                    );
                    return;
                }
            };
            tracing::info!(dir = %dir, copy = %gc_repo.display(), "run git gc in dedicated dir");

            match self.compact_copy(git, &gc_repo, ctx) {
                Ok(()) => Some(gc_repo),
                Err(e) => {
                    self.gc_errors
                        .register(dir.path(), "Error while running garbage collection", Some(&e));
                    self.discard_temp_dir(&gc_repo);
                    compact_failed = true;
                    None
                }
            }
        };
        let Some(gc_repo) = gc_repo else {
            // The compacted-copy engine failed; fall back to plain
            // native gc for this mirror while quota remains.
            if compact_failed && round_start.elapsed() < quota {
                self.run_in_place_gc(git, dir, ctx);
            }
            return;
        };

        // Standalone from here: drop the alternates pointer before the
        // copy replaces the original.
        let _ = std::fs::remove_file(gc_repo.join("objects").join("info").join("alternates"));

        let old_dir = match reserve_sibling_dir(dir.path(), ".old") {
            Ok(old_dir) => old_dir,
            Err(e) => {
                self.gc_errors
                    .register(dir.path(), "Error while creating temporary directory", Some(&e));
                self.discard_temp_dir(&gc_repo);
                return;
            }
        };

        {
            let _rm_write = self.pool.rm_write_lock(dir);
            if !rename_with_retries(dir.path(), &old_dir) {
                self.gc_errors.register(
                    dir.path(),
                    format!("Failed to rename {} to {}", dir, old_dir.display()),
                    None,
                );
                self.discard_temp_dir(&gc_repo);
                return;
            }
            if !rename_with_retries(&gc_repo, dir.path()) {
                self.gc_errors.register(
                    dir.path(),
                    format!("Failed to rename {} to {}", gc_repo.display(), dir),
                    None,
                );
                tracing::warn!(dir = %dir, "rename failed, restoring old repository");
                if std::fs::rename(&old_dir, dir.path()).is_err() {
                    tracing::warn!(dir = %dir, "failed to restore old repository");
                }
                self.discard_temp_dir(&gc_repo);
                return;
            }
        }

        // Outside the lock: drop leftovers.
        let _ = std::fs::remove_dir_all(&old_dir);
        let _ = std::fs::remove_dir_all(&gc_repo);
        self.gc_errors.clear(dir.path());
    }

    /// Run `repack` and `pack-refs --all` inside the copy.
    fn compact_copy(&self, git: &NativeGit, gc_repo: &Path, ctx: &OpContext) -> Result<(), Error> {
        let config = self.pool.config();

        let start = Instant::now();
        git.repack(
            gc_repo,
            &config.repack_args,
            std::time::Duration::from_secs(config.repack_idle_timeout_seconds),
        )
        .run_checked(ctx)
        .map_err(|e| Error::GcProcessFailed {
            dir: gc_repo.to_path_buf(),
            message: e.to_string(),
        })?;
        tracing::info!(
            copy = %gc_repo.display(),
            duration_ms = start.elapsed().as_millis() as u64,
            "git repack finished"
        );

        let start = Instant::now();
        git.pack_refs(
            gc_repo,
            std::time::Duration::from_secs(config.pack_refs_idle_timeout_seconds),
        )
        .run_checked(ctx)
        .map_err(|e| Error::GcProcessFailed {
            dir: gc_repo.to_path_buf(),
            message: e.to_string(),
        })?;
        tracing::info!(
            copy = %gc_repo.display(),
            duration_ms = start.elapsed().as_millis() as u64,
            "git pack-refs finished"
        );
        Ok(())
    }

    /// Remove a transient directory, unless temp files are being kept
    /// for debugging (the next round's stale-copy sweep still reclaims
    /// them).
    fn discard_temp_dir(&self, path: &Path) {
        if self.pool.config().delete_temp_files {
            let _ = std::fs::remove_dir_all(path);
        } else {
            tracing::info!(dir = %path.display(), "keeping temporary gc directory for debugging");
        }
    }

    /// The `gc --auto` heuristics, applied without running git: too many
    /// packs or too many (estimated) loose objects.
    fn is_gc_needed(&self, dir: &MirrorDir) -> bool {
        let Ok(repo) = MirrorRepo::open(dir.path()) else {
            return false;
        };
        too_many_packs(&repo) || too_many_loose_objects(&repo)
    }
}

fn too_many_packs(repo: &MirrorRepo) -> bool {
    let limit = repo.config_int("gc.autopacklimit", 50);
    if limit <= 0 {
        return false;
    }
    repo.pack_count() > limit as usize
}

fn too_many_loose_objects(repo: &MirrorRepo) -> bool {
    let mut limit = repo.config_int("gc.auto", 6700);
    if limit == 0 {
        return false;
    }
    if limit == -1 {
        limit = 6700;
    }
    // SHAs are evenly distributed; one bucket scaled by 256 estimates
    // the total.
    let bucket_limit = ((limit + 255) / 256) as usize;
    repo.loose_objects_in_probe_bucket() > bucket_limit
}

fn enough_disk_space_for_gc(dir: &MirrorDir, free_disk: Option<u64>) -> bool {
    let Some(free) = free_disk else {
        return true;
    };
    directory_size(&dir.path().join("objects").join("pack")) < free
}

fn directory_size(path: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    let mut total = 0;
    for entry in entries.flatten() {
        let entry_path = entry.path();
        if entry_path.is_dir() {
            total += directory_size(&entry_path);
        } else if let Ok(metadata) = entry.metadata() {
            total += metadata.len();
        }
    }
    total
}

fn file_age_hours(path: &Path) -> Option<u64> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    let age = std::time::SystemTime::now().duration_since(modified).ok()?;
    Some(age.as_secs() / 3600)
}

/// Build the `<name>.git.gc` copy: bare database, alternates pointing at
/// the original's objects, refs and bookkeeping files carried over.
fn setup_gc_repo(original: &Path) -> Result<PathBuf, Error> {
    let gc_path = reserve_sibling_dir(original, ".gc")?;
    let mut opts = git2::RepositoryInitOptions::new();
    opts.bare(true);
    git2::Repository::init_opts(&gc_path, &opts)
        .map_err(|e| Error::internal("init gc copy", e.message()))?;

    // 'git repack' in a repository with alternates writes the new pack
    // here without touching the repository the alternates point to.
    let objects_info = gc_path.join("objects").join("info");
    std::fs::create_dir_all(&objects_info)?;
    let original_objects = std::fs::canonicalize(original.join("objects"))
        .unwrap_or_else(|_| original.join("objects"));
    std::fs::write(
        objects_info.join("alternates"),
        format!("{}\n", original_objects.display()),
    )?;

    copy_file_if_exists(&original.join("packed-refs"), &gc_path)?;
    copy_file_if_exists(&original.join("timestamp"), &gc_path)?;
    copy_file_if_exists(&original.join("config"), &gc_path)?;
    copy_dir_if_exists(&original.join("refs"), &gc_path)?;
    copy_dir_if_exists(&original.join("monitoring"), &gc_path)?;
    Ok(gc_path)
}

/// Create `<original><suffix>` next to the original, suffixing a counter
/// when the name is taken, and return the empty directory.
fn reserve_sibling_dir(original: &Path, suffix: &str) -> Result<PathBuf, Error> {
    let parent = original.parent().unwrap_or(Path::new("."));
    let base_name = format!(
        "{}{}",
        original.file_name().and_then(|n| n.to_str()).unwrap_or("mirror"),
        suffix
    );

    let mut candidate = parent.join(&base_name);
    let mut counter = 0u32;
    loop {
        match std::fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                counter += 1;
                candidate = parent.join(format!("{}{}", base_name, counter));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn rename_with_retries(from: &Path, to: &Path) -> bool {
    // The reserved target directory must not exist for the rename.
    let _ = std::fs::remove_dir_all(to);
    for attempt in 0..RENAME_ATTEMPTS {
        if std::fs::rename(from, to).is_ok() {
            return true;
        }
        if attempt + 1 < RENAME_ATTEMPTS {
            std::thread::sleep(RENAME_BACKOFF);
        }
    }
    false
}

fn copy_file_if_exists(src: &Path, dst_dir: &Path) -> Result<(), Error> {
    if src.is_file() {
        let name = src.file_name().ok_or_else(|| Error::internal("copy file", "no file name"))?;
        std::fs::copy(src, dst_dir.join(name))?;
    }
    Ok(())
}

fn copy_dir_if_exists(src: &Path, dst_dir: &Path) -> Result<(), Error> {
    if !src.is_dir() {
        return Ok(());
    }
    let name = src.file_name().ok_or_else(|| Error::internal("copy dir", "no dir name"))?;
    copy_dir_recursive(src, &dst_dir.join(name))
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<(), Error> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)?.flatten() {
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        if src_path.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            std::fs::copy(&src_path, &dst_path)?;
        }
    }
    Ok(())
}
