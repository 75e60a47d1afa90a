//! Scoped shared/exclusive advisory file lock.
//!
//! Each repository working directory is guarded by one lock file at
//! `<dirname>/<basename>.fbshipit-lock`. A repository handle acquires the
//! lock shared at construction and holds it for its lifetime; mutating
//! command sequences upgrade to exclusive for their duration and downgrade
//! back to shared afterwards.
//!
//! Release happens on every exit path: explicitly via [`ScopedLock::release`]
//! (which fails loudly on double release), or best-effort on drop.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs2::FileExt;
use tracing::{debug, warn};

use crate::errors::LockError;

/// What `release` does for this handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReleaseBehavior {
    /// Drop the flock entirely (the original shared handle).
    Unlock,
    /// Downgrade back to shared (a handle returned by `get_exclusive`).
    DowngradeToShared,
}

/// An acquired advisory lock on a repository path.
#[derive(Debug)]
pub struct ScopedLock {
    path: PathBuf,
    file: Arc<File>,
    release_behavior: ReleaseBehavior,
    exclusive: bool,
    released: bool,
}

/// The lock file path guarding `repo_path`.
pub fn lock_path_for_repo(repo_path: &Path) -> PathBuf {
    let dir = repo_path.parent().unwrap_or_else(|| Path::new("."));
    let base = repo_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dir.join(format!("{base}.fbshipit-lock"))
}

impl ScopedLock {
    /// Acquire a shared lock on the given lock file, creating it (and its
    /// parent directory) if necessary. Blocks until the lock is granted.
    pub fn create_shared(lock_path: impl Into<PathBuf>) -> Result<Self, LockError> {
        let path = lock_path.into();
        if let Some(dir) = path.parent() {
            if !dir.exists() {
                std::fs::create_dir_all(dir).map_err(|source| LockError::OpenFailed {
                    path: path.display().to_string(),
                    source,
                })?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| LockError::OpenFailed {
                path: path.display().to_string(),
                source,
            })?;

        debug!(path = %path.display(), "acquiring shared lock");
        file.lock_shared().map_err(|source| LockError::FlockFailed {
            operation: "acquire shared",
            path: path.display().to_string(),
            source,
        })?;
        debug!(path = %path.display(), "shared lock acquired");

        Ok(Self {
            path,
            file: Arc::new(file),
            release_behavior: ReleaseBehavior::Unlock,
            exclusive: false,
            released: false,
        })
    }

    /// Acquire a shared lock guarding `repo_path`, deriving the lock file
    /// location with [`lock_path_for_repo`].
    pub fn create_shared_for_repo(repo_path: &Path) -> Result<Self, LockError> {
        Self::create_shared(lock_path_for_repo(repo_path))
    }

    /// Upgrade to an exclusive lock. Blocks until all other holders release.
    ///
    /// Returns a new handle on the same lock file; releasing (or dropping)
    /// it downgrades back to shared. Calling this on an already-exclusive
    /// handle is a no-op upgrade and returns a handle whose release also
    /// downgrades to shared.
    pub fn get_exclusive(&self) -> Result<ScopedLock, LockError> {
        debug!(path = %self.path.display(), "upgrading to exclusive lock");
        self.file
            .lock_exclusive()
            .map_err(|source| LockError::FlockFailed {
                operation: "upgrade to exclusive",
                path: self.path.display().to_string(),
                source,
            })?;
        debug!(path = %self.path.display(), "exclusive lock acquired");
        Ok(ScopedLock {
            path: self.path.clone(),
            file: Arc::clone(&self.file),
            release_behavior: ReleaseBehavior::DowngradeToShared,
            exclusive: true,
            released: false,
        })
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release this handle: downgrade to shared for an exclusive handle,
    /// unlock entirely for the original shared handle. Releasing twice is a
    /// programming error.
    pub fn release(&mut self) -> Result<(), LockError> {
        if self.released {
            return Err(LockError::AlreadyReleased(self.path.display().to_string()));
        }
        match self.release_behavior {
            ReleaseBehavior::DowngradeToShared => {
                debug!(path = %self.path.display(), "downgrading to shared lock");
                self.file
                    .lock_shared()
                    .map_err(|source| LockError::FlockFailed {
                        operation: "downgrade to shared",
                        path: self.path.display().to_string(),
                        source,
                    })?;
            }
            ReleaseBehavior::Unlock => {
                debug!(path = %self.path.display(), "releasing lock");
                FileExt::unlock(&*self.file).map_err(|source| LockError::FlockFailed {
                    operation: "release",
                    path: self.path.display().to_string(),
                    source,
                })?;
            }
        }
        self.released = true;
        Ok(())
    }
}

impl Drop for ScopedLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.release() {
            warn!(path = %self.path.display(), error = %e, "failed to release lock on drop");
        }
    }
}
