//! Image index
//!
//! The persisted source of truth for managed images (`images.json`). Every
//! mutation rewrites the document atomically; read-modify-write sequences
//! hold the index mutex for their whole duration. The index is written only
//! after the corresponding WSL registration change has succeeded, so readers
//! see either the pre-state or the post-state of an operation.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::{read_json, write_json_atomic, Store};

/// Index schema version.
const INDEX_VERSION: u32 = 1;

/// Where an image came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ImageSource {
    Distro {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        digest: Option<String>,
    },
    Image {
        id: String,
        name: String,
    },
    ImportedTar {
        path: String,
        digest: String,
    },
    /// Pre-existing WSL registration adopted on first list.
    Legacy,
}

/// Whether the in-image manifest is known to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestPresence {
    Present,
    Absent,
    Unknown,
}

/// Visibility scope for terminal-profile projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Scope {
    Global,
    Workspace { workspace_path: String },
}

impl Default for Scope {
    fn default() -> Self {
        Scope::Global
    }
}

fn default_true() -> bool {
    true
}

/// One managed image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    /// WSL registration name, unique per host.
    pub name: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub source: ImageSource,
    pub created_at: String,
    pub wsl_version: u8,
    /// Install target owned exclusively by this image. `None` for legacy
    /// registrations whose location belongs to whatever installed them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_path: Option<PathBuf>,
    /// Gates terminal-profile projection.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub scope: Scope,
    #[serde(default)]
    pub tags: Vec<String>,
    pub manifest_present: ManifestPresence,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    images: Vec<Image>,
}

/// Handle to the persisted index. Clones share the mutex.
#[derive(Clone)]
pub struct ImageIndex {
    store: Store,
    mutex: Arc<Mutex<()>>,
}

impl ImageIndex {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            mutex: Arc::new(Mutex::new(())),
        }
    }

    pub fn load(&self) -> Result<Vec<Image>> {
        let _lock = self.mutex.lock().unwrap();
        self.load_locked()
    }

    pub fn get(&self, name: &str) -> Result<Option<Image>> {
        Ok(self.load()?.into_iter().find(|i| i.name == name))
    }

    /// Run a read-modify-write under the index mutex and persist the result.
    pub fn update<R>(&self, mutate: impl FnOnce(&mut Vec<Image>) -> R) -> Result<R> {
        let _lock = self.mutex.lock().unwrap();
        let mut images = self.load_locked()?;
        let result = mutate(&mut images);
        write_json_atomic(
            &self.store.image_index_path(),
            &IndexFile {
                version: INDEX_VERSION,
                images,
            },
        )?;
        Ok(result)
    }

    fn load_locked(&self) -> Result<Vec<Image>> {
        Ok(read_json::<IndexFile>(&self.store.image_index_path())?
            .map(|file| file.images)
            .unwrap_or_default())
    }
}
