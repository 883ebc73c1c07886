//! RAII guards for scratch artifacts
//!
//! Downloads, clones, and archive normalization all produce intermediate
//! files that must disappear on every exit path, including panics.

use std::path::{Path, PathBuf};

/// Deletes the guarded file on drop unless `keep()` was called.
pub struct TempFileGuard {
    path: PathBuf,
    keep: bool,
}

impl TempFileGuard {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            keep: false,
        }
    }

    /// Disarm the guard; the file survives.
    pub fn keep(&mut self) {
        self.keep = true;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if !self.keep && self.path.exists() {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Like `TempFileGuard`, but removes a whole directory tree.
pub struct TempDirGuard {
    path: PathBuf,
    keep: bool,
}

impl TempDirGuard {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            keep: false,
        }
    }

    #[allow(dead_code)]
    pub fn keep(&mut self) {
        self.keep = true;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempDirGuard {
    fn drop(&mut self) {
        if !self.keep && self.path.exists() {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }
}
