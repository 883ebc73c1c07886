//! On-disk store layout
//!
//! Everything the manager persists lives under `{user_home}/.vscode-wsl-manager/`:
//!
//! ```text
//! distros/
//!   catalog.json
//!   {name}.tar | {name}.tar.gz | {name}.tar.xz
//! images/
//!   {image_name}/
//! images.json
//! cache/
//!   distributions.json
//! terminal-profiles.json
//! ```
//!
//! All JSON files are rewritten atomically (write temp, then rename) so a
//! reader never observes a torn document.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::constants::STORE_DIR_NAME;
use crate::error::Result;

/// Handle to the manager's store directory.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    /// Locate the store under the user profile (`USERPROFILE` on Windows,
    /// `HOME` elsewhere) and make sure its directories exist.
    pub fn from_env() -> Result<Self> {
        let profile = std::env::var("USERPROFILE")
            .or_else(|_| std::env::var("HOME"))
            .unwrap_or_else(|_| ".".to_string());
        Self::at(PathBuf::from(profile).join(STORE_DIR_NAME))
    }

    /// Open a store rooted at an explicit directory.
    pub fn at(root: impl Into<PathBuf>) -> Result<Self> {
        let store = Self { root: root.into() };
        std::fs::create_dir_all(store.distros_dir())?;
        std::fs::create_dir_all(store.images_dir())?;
        std::fs::create_dir_all(store.cache_dir())?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn distros_dir(&self) -> PathBuf {
        self.root.join("distros")
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.distros_dir().join("catalog.json")
    }

    pub fn registry_snapshot_path(&self) -> PathBuf {
        self.cache_dir().join("distributions.json")
    }

    pub fn image_index_path(&self) -> PathBuf {
        self.root.join("images.json")
    }

    pub fn terminal_profiles_path(&self) -> PathBuf {
        self.root.join("terminal-profiles.json")
    }

    /// Install target for an image; owned exclusively by that image.
    pub fn image_install_path(&self, image_name: &str) -> PathBuf {
        self.images_dir().join(image_name)
    }

    /// Canonical template path for a distro, extension chosen by the
    /// normalizer (`.tar`, `.tar.gz`, `.tar.xz`).
    pub fn distro_template_path(&self, name: &str, extension: &str) -> PathBuf {
        self.distros_dir().join(format!("{name}{extension}"))
    }

    /// Find an existing canonical template regardless of compression.
    pub fn find_distro_template(&self, name: &str) -> Option<PathBuf> {
        for ext in [".tar", ".tar.gz", ".tar.xz"] {
            let candidate = self.distro_template_path(name, ext);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        None
    }
}

/// Serialize `value` as pretty JSON and atomically replace `path`.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)?;
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;

    let tmp = parent.join(format!(
        ".{}.tmp",
        path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
    ));
    std::fs::write(&tmp, content.as_bytes())?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Read a JSON document, returning `None` when the file is absent.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
