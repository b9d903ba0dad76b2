//! git::repo
//!
//! In-process doorway to a bare mirror's object database, built on git2.
//!
//! # Architecture
//!
//! Components that read objects (change collector, walkers, submodule
//! resolver, gc heuristics) go through [`MirrorRepo`]; only the fetch
//! transport and the compactor talk to remotes or spawn processes. The
//! on-disk format stays the native object database, bit-compatible with
//! standard tooling.
//!
//! The canonical remote URL of a mirror is stored in the database `config`
//! under `teamcity.remote`; it is written at creation and read back for
//! submodule URL resolution.

use std::path::{Path, PathBuf};

use git2::{Repository, RepositoryInitOptions};

use crate::core::types::Oid;
use crate::error::Error;

/// Git filemode of a gitlink (submodule pointer) tree entry.
pub const GITLINK_FILEMODE: i32 = 0o160000;

/// The config key carrying the canonical remote URL of a mirror.
pub const REMOTE_URL_KEY: &str = "teamcity.remote";

/// An open bare mirror database.
pub struct MirrorRepo {
    path: PathBuf,
    repo: Repository,
}

impl std::fmt::Debug for MirrorRepo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorRepo").field("path", &self.path).finish()
    }
}

impl MirrorRepo {
    /// Open an existing mirror database.
    pub fn open(path: &Path) -> Result<Self, Error> {
        let repo = Repository::open(path)
            .map_err(|e| Error::internal(format!("open repository {}", path.display()), e.message()))?;
        Ok(Self {
            path: path.to_path_buf(),
            repo,
        })
    }

    /// Create an empty bare database and record its canonical remote URL.
    ///
    /// Idempotent: re-initializing an existing database only rewrites the
    /// `teamcity.remote` attribute.
    pub fn init_bare(path: &Path, canonical_url: &str) -> Result<Self, Error> {
        let mut opts = RepositoryInitOptions::new();
        opts.bare(true);
        let repo = Repository::init_opts(path, &opts)
            .map_err(|e| Error::internal(format!("init repository {}", path.display()), e.message()))?;
        repo.config()
            .and_then(|mut config| config.set_str(REMOTE_URL_KEY, canonical_url))
            .map_err(|e| Error::internal(format!("write {} in {}", REMOTE_URL_KEY, path.display()), e.message()))?;
        Ok(Self {
            path: path.to_path_buf(),
            repo,
        })
    }

    /// Path of the database directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The underlying git2 repository.
    pub fn raw(&self) -> &Repository {
        &self.repo
    }

    /// The canonical remote URL recorded at creation.
    pub fn remote_url(&self) -> Result<String, Error> {
        self.repo
            .config()
            .and_then(|config| config.get_string(REMOTE_URL_KEY))
            .map_err(|e| {
                Error::internal(
                    format!("read {} in {}", REMOTE_URL_KEY, self.path.display()),
                    e.message(),
                )
            })
    }

    /// Whether a commit with this id is present and parseable.
    pub fn has_commit(&self, oid: &Oid) -> bool {
        self.repo.find_commit(oid.to_git2()).is_ok()
    }

    /// Look up a commit, mapping absence to `RevisionNotFound`.
    pub fn commit(&self, oid: &Oid) -> Result<git2::Commit<'_>, Error> {
        self.repo.find_commit(oid.to_git2()).map_err(|_| Error::RevisionNotFound {
            url: self.remote_url().unwrap_or_else(|_| self.path.display().to_string()),
            missing: vec![oid.to_string()],
        })
    }

    /// Read the blob at `path` in the tree of `commit`, if present.
    pub fn read_blob_at(&self, commit: &git2::Commit<'_>, path: &Path) -> Result<Option<Vec<u8>>, Error> {
        let tree = commit
            .tree()
            .map_err(|e| Error::internal("read commit tree", e.message()))?;
        let entry = match tree.get_path(path) {
            Ok(entry) => entry,
            Err(e) if e.code() == git2::ErrorCode::NotFound => return Ok(None),
            Err(e) => return Err(Error::internal("look up tree path", e.message())),
        };
        let object = entry
            .to_object(&self.repo)
            .map_err(|e| Error::internal("load tree entry", e.message()))?;
        match object.as_blob() {
            Some(blob) => Ok(Some(blob.content().to_vec())),
            None => Ok(None),
        }
    }

    /// The submodule pointer at `path` in the tree of `commit`, if the
    /// entry is a gitlink.
    pub fn gitlink_at(&self, commit: &git2::Commit<'_>, path: &Path) -> Result<Option<Oid>, Error> {
        let tree = commit
            .tree()
            .map_err(|e| Error::internal("read commit tree", e.message()))?;
        let entry = match tree.get_path(path) {
            Ok(entry) => entry,
            Err(e) if e.code() == git2::ErrorCode::NotFound => return Ok(None),
            Err(e) => return Err(Error::internal("look up tree path", e.message())),
        };
        if entry.filemode() == GITLINK_FILEMODE {
            Ok(Some(Oid::from(entry.id())))
        } else {
            Ok(None)
        }
    }

    /// An integer from the database config, with a default for absence.
    pub fn config_int(&self, key: &str, default: i32) -> i32 {
        self.repo
            .config()
            .and_then(|config| config.get_i32(key))
            .unwrap_or(default)
    }

    /// Number of packs in `objects/pack`, excluding keep-marked ones.
    pub fn pack_count(&self) -> usize {
        let pack_dir = self.path.join("objects").join("pack");
        let entries = match std::fs::read_dir(&pack_dir) {
            Ok(entries) => entries,
            Err(_) => return 0,
        };
        let mut count = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".pack") {
                let keep = pack_dir.join(format!("{}.keep", stem));
                if !keep.exists() {
                    count += 1;
                }
            }
        }
        count
    }

    /// Hex-named loose objects in bucket `objects/17`.
    ///
    /// SHAs distribute evenly, so one bucket estimates the total when
    /// scaled by 256.
    pub fn loose_objects_in_probe_bucket(&self) -> usize {
        let bucket = self.path.join("objects").join("17");
        let entries = match std::fs::read_dir(&bucket) {
            Ok(entries) => entries,
            Err(_) => return 0,
        };
        entries
            .flatten()
            .filter(|entry| {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                name.len() == 38 && name.chars().all(|c| c.is_ascii_hexdigit())
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init(dir: &Path) -> MirrorRepo {
        MirrorRepo::init_bare(dir, "https://host/proj.git").unwrap()
    }

    #[test]
    fn init_bare_writes_remote_url() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("m.git");
        let repo = init(&path);
        assert_eq!(repo.remote_url().unwrap(), "https://host/proj.git");
        assert!(path.join("objects").is_dir());
        assert!(path.join("HEAD").is_file());
        // Bare layout: no working tree.
        assert!(!path.join(".git").exists());
    }

    #[test]
    fn init_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("m.git");
        init(&path);
        let again = MirrorRepo::init_bare(&path, "https://host/proj.git").unwrap();
        assert_eq!(again.remote_url().unwrap(), "https://host/proj.git");
    }

    #[test]
    fn open_missing_fails() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(MirrorRepo::open(&tmp.path().join("absent.git")).is_err());
    }

    #[test]
    fn has_commit_false_on_empty_database() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = init(&tmp.path().join("m.git"));
        let oid = Oid::new("1".repeat(40)).unwrap();
        assert!(!repo.has_commit(&oid));
        assert!(matches!(
            repo.commit(&oid),
            Err(Error::RevisionNotFound { .. })
        ));
    }

    #[test]
    fn pack_count_ignores_keep_marked() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = init(&tmp.path().join("m.git"));
        let pack_dir = repo.path().join("objects").join("pack");
        std::fs::create_dir_all(&pack_dir).unwrap();
        std::fs::write(pack_dir.join("pack-a.pack"), b"").unwrap();
        std::fs::write(pack_dir.join("pack-b.pack"), b"").unwrap();
        std::fs::write(pack_dir.join("pack-b.keep"), b"").unwrap();
        std::fs::write(pack_dir.join("pack-c.idx"), b"").unwrap();
        assert_eq!(repo.pack_count(), 1);
    }

    #[test]
    fn loose_probe_counts_only_hex_names() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = init(&tmp.path().join("m.git"));
        let bucket = repo.path().join("objects").join("17");
        std::fs::create_dir_all(&bucket).unwrap();
        std::fs::write(bucket.join("a".repeat(38)), b"").unwrap();
        std::fs::write(bucket.join("b".repeat(38)), b"").unwrap();
        std::fs::write(bucket.join("tmp_obj_123"), b"").unwrap();
        assert_eq!(repo.loose_objects_in_probe_bucket(), 2);
    }

    #[test]
    fn config_int_default_on_absence() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = init(&tmp.path().join("m.git"));
        assert_eq!(repo.config_int("gc.autopacklimit", 50), 50);
    }
}
