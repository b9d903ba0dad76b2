//! pool::locks
//!
//! Per-mirror two-layer lock sets.
//!
//! # Architecture
//!
//! Every mirror directory has two logical locks:
//!
//! - an outer **rm** lock guarding existence of the directory itself:
//!   `rm.read` is held for the duration of any other lock, `rm.write` is
//!   exclusive and excludes everything (taken only to delete or rename
//!   the directory)
//! - an inner **access** lock: shared `read` for object access, exclusive
//!   `write` for fetches and in-place gc
//!
//! A thread holding any guard is assured the directory exists and will
//! not be renamed underneath it.
//!
//! # Lock order
//!
//! `rm` before `access`, always. Guards release in reverse order on all
//! paths (RAII; field declaration order makes the inner guard drop
//! first). Holding `write` while acquiring `rm.write` on the same mirror
//! is forbidden; the copy-swap sequence in the compactor drops `write`
//! before taking `rm.write`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::lock_api::{ArcMutexGuard, ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawMutex, RawRwLock, RwLock};

type ReadGuard = ArcRwLockReadGuard<RawRwLock, ()>;
type WriteGuard = ArcRwLockWriteGuard<RawRwLock, ()>;

/// The locks of a single mirror directory.
#[derive(Debug, Default)]
struct LockSet {
    rm: Arc<RwLock<()>>,
    access: Arc<RwLock<()>>,
    create: Arc<Mutex<()>>,
}

/// Shared read access to a mirror (holds `rm.read` + `read`).
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct MirrorReadGuard {
    // Declaration order is drop order: inner access lock first, outer rm
    // lock second.
    _access: ReadGuard,
    _rm: ReadGuard,
}

/// Exclusive write access to a mirror (holds `rm.read` + `write`).
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct MirrorWriteGuard {
    _access: WriteGuard,
    _rm: ReadGuard,
}

/// Removal protection: holds `rm.read` only, blocking deletion/renaming.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct RmReadGuard {
    _rm: ReadGuard,
}

/// Exclusive removal access: holds `rm.write`, excluding all other locks.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct RmWriteGuard {
    _rm: WriteGuard,
}

/// Guard serializing creation of one mirror directory.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct CreationGuard {
    _guard: ArcMutexGuard<RawMutex, ()>,
}

/// Registry of lock sets, keyed by mirror directory path.
///
/// Lock sets are created lazily and never discarded: even a deleted
/// mirror may be re-created by the next `resolve`, and parked lock sets
/// are tiny.
#[derive(Debug, Default)]
pub struct LockRegistry {
    sets: Mutex<HashMap<PathBuf, Arc<LockSet>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn set_for(&self, dir: &Path) -> Arc<LockSet> {
        let mut sets = self.sets.lock();
        Arc::clone(sets.entry(dir.to_path_buf()).or_default())
    }

    /// Acquire shared read access (`rm.read` + `read`).
    pub fn read_lock(&self, dir: &Path) -> MirrorReadGuard {
        let set = self.set_for(dir);
        // Recursive acquisition: callers commonly already hold rm.read
        // (run_with_disabled_remove); a queued rm writer must not
        // deadlock the re-acquisition.
        let rm = set.rm.read_arc_recursive();
        let access = set.access.read_arc();
        MirrorReadGuard { _access: access, _rm: rm }
    }

    /// Acquire exclusive write access (`rm.read` + `write`).
    pub fn write_lock(&self, dir: &Path) -> MirrorWriteGuard {
        let set = self.set_for(dir);
        let rm = set.rm.read_arc_recursive();
        let access = set.access.write_arc();
        MirrorWriteGuard { _access: access, _rm: rm }
    }

    /// Acquire removal protection (`rm.read`).
    pub fn rm_read_lock(&self, dir: &Path) -> RmReadGuard {
        let set = self.set_for(dir);
        RmReadGuard { _rm: set.rm.read_arc_recursive() }
    }

    /// Acquire exclusive removal access (`rm.write`).
    pub fn rm_write_lock(&self, dir: &Path) -> RmWriteGuard {
        let set = self.set_for(dir);
        RmWriteGuard { _rm: set.rm.write_arc() }
    }

    /// Try to acquire exclusive removal access without blocking.
    pub fn try_rm_write_lock(&self, dir: &Path) -> Option<RmWriteGuard> {
        let set = self.set_for(dir);
        set.rm.try_write_arc().map(|guard| RmWriteGuard { _rm: guard })
    }

    /// Serialize creation of the mirror at `dir`.
    pub fn creation_lock(&self, dir: &Path) -> CreationGuard {
        let set = self.set_for(dir);
        CreationGuard { _guard: set.create.lock_arc() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn dir() -> PathBuf {
        PathBuf::from("/mirrors/abc.git")
    }

    #[test]
    fn concurrent_readers_allowed() {
        let registry = LockRegistry::new();
        let _a = registry.read_lock(&dir());
        let _b = registry.read_lock(&dir());
    }

    #[test]
    fn writer_excludes_rm_write() {
        let registry = LockRegistry::new();
        let guard = registry.write_lock(&dir());
        // write holds rm.read, so rm.write must not be grantable.
        assert!(registry.try_rm_write_lock(&dir()).is_none());
        drop(guard);
        assert!(registry.try_rm_write_lock(&dir()).is_some());
    }

    #[test]
    fn reader_blocks_rm_write() {
        let registry = LockRegistry::new();
        let guard = registry.read_lock(&dir());
        assert!(registry.try_rm_write_lock(&dir()).is_none());
        drop(guard);
        assert!(registry.try_rm_write_lock(&dir()).is_some());
    }

    #[test]
    fn rm_read_blocks_rm_write() {
        let registry = LockRegistry::new();
        let guard = registry.rm_read_lock(&dir());
        assert!(registry.try_rm_write_lock(&dir()).is_none());
        drop(guard);
        assert!(registry.try_rm_write_lock(&dir()).is_some());
    }

    #[test]
    fn distinct_dirs_are_independent() {
        let registry = LockRegistry::new();
        let _a = registry.write_lock(Path::new("/mirrors/a.git"));
        assert!(registry.try_rm_write_lock(Path::new("/mirrors/b.git")).is_some());
    }

    #[test]
    fn writer_blocks_second_writer() {
        let registry = Arc::new(LockRegistry::new());
        let first = registry.write_lock(&dir());

        let second_acquired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&second_acquired);
        let reg = Arc::clone(&registry);
        let handle = std::thread::spawn(move || {
            let _guard = reg.write_lock(&dir());
            flag.store(true, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(100));
        assert!(!second_acquired.load(Ordering::SeqCst));

        drop(first);
        handle.join().unwrap();
        assert!(second_acquired.load(Ordering::SeqCst));
    }

    #[test]
    fn creation_lock_serializes() {
        let registry = Arc::new(LockRegistry::new());
        let guard = registry.creation_lock(&dir());

        let entered = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&entered);
        let reg = Arc::clone(&registry);
        let handle = std::thread::spawn(move || {
            let _guard = reg.creation_lock(&dir());
            flag.store(true, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(100));
        assert!(!entered.load(Ordering::SeqCst));
        drop(guard);
        handle.join().unwrap();
    }
}
