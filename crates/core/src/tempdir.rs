//! Scoped temporary directories.
//!
//! Thin wrapper over the `tempfile` crate giving export and patch
//! regeneration a named, auto-removed working area. Removal happens on
//! every exit path via drop; [`ScopedTempDir::keep`] opts out for
//! debugging or for export results the caller wants to hand off.

use std::path::{Path, PathBuf};

use crate::errors::RepoError;

/// A temporary directory that is deleted on drop unless kept.
#[derive(Debug)]
pub struct ScopedTempDir {
    // `None` after `keep()` has taken ownership of the path.
    inner: Option<tempfile::TempDir>,
    kept_path: Option<PathBuf>,
}

impl ScopedTempDir {
    /// Create a fresh directory named `shipit-<component>-*` under the
    /// system temp dir.
    pub fn new(component: &str) -> Result<Self, RepoError> {
        let inner = tempfile::Builder::new()
            .prefix(&format!("shipit-{component}-"))
            .tempdir()?;
        Ok(Self {
            inner: Some(inner),
            kept_path: None,
        })
    }

    pub fn path(&self) -> &Path {
        match (&self.inner, &self.kept_path) {
            (Some(dir), _) => dir.path(),
            (None, Some(path)) => path,
            // One of the two is always populated.
            (None, None) => unreachable!("ScopedTempDir with neither inner nor kept path"),
        }
    }

    /// Disable auto-removal; the directory outlives this handle.
    pub fn keep(&mut self) -> PathBuf {
        if let Some(dir) = self.inner.take() {
            self.kept_path = Some(dir.keep());
        }
        self.path().to_path_buf()
    }
}
