//! Distro catalog
//!
//! The persisted mapping from distro name to its record: upstream metadata
//! merged with local availability bookkeeping. Refreshes go to the upstream
//! registry at most once per TTL unless forced, and are suppressed entirely
//! while a download holds the download-lock so a concurrent refresh can never
//! clobber availability bits mid-download.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::constants::{CATALOG_TTL, REGISTRY_URL};
use crate::error::{Error, Result};
use crate::registry;
use crate::store::{read_json, write_json_atomic, Store};

/// Built-in fallback table, used when the registry is unreachable and to
/// supplement entries the upstream document does not carry.
const BUILTIN_DISTRIBUTIONS: &str = include_str!("builtin_distributions.json");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    X64,
    Arm64,
    Both,
}

/// One catalog record. Immutable once materialized: a re-download overwrites
/// the template wholesale, nothing mutates it in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Distro {
    pub name: String,
    pub display_name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: String,
    pub architecture: Architecture,
    pub source_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
    #[serde(default)]
    pub available: bool,
    /// Inner container member the template was extracted from, when the
    /// upstream package was a zip container. Auditable via the manifest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_member: Option<String>,
}

/// Shape of `distros/catalog.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CatalogFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fetched_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    default: Option<String>,
    distributions: Vec<Distro>,
}

#[derive(Debug, Deserialize)]
struct BuiltinTable {
    default: String,
    distributions: Vec<Distro>,
}

fn builtin_table() -> BuiltinTable {
    serde_json::from_str(BUILTIN_DISTRIBUTIONS)
        .expect("embedded builtin_distributions.json must parse")
}

/// Clears the download-lock on every exit path.
pub struct DownloadLockGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for DownloadLockGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// The catalog handle. Clones share the download-lock and the store mutex.
#[derive(Clone)]
pub struct Catalog {
    store: Store,
    download_lock: Arc<AtomicBool>,
    file_mutex: Arc<Mutex<()>>,
}

impl Catalog {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            download_lock: Arc::new(AtomicBool::new(false)),
            file_mutex: Arc::new(Mutex::new(())),
        }
    }

    /// All known distros, availability re-checked against the filesystem.
    pub fn list(&self) -> Result<Vec<Distro>> {
        Ok(self.load()?.distributions)
    }

    pub fn get(&self, name: &str) -> Result<Option<Distro>> {
        let wanted = name.to_lowercase();
        Ok(self
            .load()?
            .distributions
            .into_iter()
            .find(|d| d.name == wanted))
    }

    pub fn set_download_lock(&self, locked: bool) {
        self.download_lock.store(locked, Ordering::SeqCst);
    }

    pub fn is_download_locked(&self) -> bool {
        self.download_lock.load(Ordering::SeqCst)
    }

    /// Acquire the download-lock; released when the guard drops.
    pub fn download_lock_guard(&self) -> DownloadLockGuard {
        self.download_lock.store(true, Ordering::SeqCst);
        DownloadLockGuard {
            flag: self.download_lock.clone(),
        }
    }

    /// Refresh from the upstream registry.
    pub async fn refresh(&self, force: bool) -> Result<Vec<Distro>> {
        self.refresh_from(REGISTRY_URL, force).await
    }

    /// Refresh from an explicit registry URL (tests point this at a local
    /// server).
    pub async fn refresh_from(&self, url: &str, force: bool) -> Result<Vec<Distro>> {
        if self.is_download_locked() {
            debug!("catalog refresh suppressed: download in flight");
            return self.list();
        }

        let current = self.load()?;
        if !force {
            if let Some(fetched_at) = current.fetched_at {
                let age = Utc::now().signed_duration_since(fetched_at);
                if age.to_std().map(|a| a < CATALOG_TTL).unwrap_or(true) {
                    debug!("catalog cache is fresh ({age}), skipping upstream fetch");
                    return Ok(current.distributions);
                }
            }
        }

        match registry::fetch(url).await {
            Ok(fetched) => {
                let _file_lock = self.file_mutex.lock().unwrap();
                // Re-check under the mutex: a download may have started while
                // the fetch was in flight.
                if self.is_download_locked() {
                    debug!("catalog refresh discarded: download started mid-fetch");
                    drop(_file_lock);
                    return self.list();
                }

                std::fs::write(self.store.registry_snapshot_path(), &fetched.raw)?;

                let merged = merge(&current.distributions, fetched.distros);
                let file = CatalogFile {
                    fetched_at: Some(Utc::now()),
                    default: fetched.default.or(current.default),
                    distributions: merged,
                };
                write_json_atomic(&self.store.catalog_path(), &file)?;
                info!("catalog refreshed: {} distributions", file.distributions.len());
                Ok(file.distributions)
            }
            Err(e) => {
                warn!("registry unreachable ({e}); serving cached catalog");
                // Make sure a valid catalog document exists even on failure.
                let _file_lock = self.file_mutex.lock().unwrap();
                if read_json::<CatalogFile>(&self.store.catalog_path())?.is_none() {
                    write_json_atomic(&self.store.catalog_path(), &current)?;
                }
                Ok(current.distributions)
            }
        }
    }

    /// Record a downloaded template: pin its digest, mark it available.
    pub fn record_local(&self, name: &str, path: PathBuf, digest: String) -> Result<()> {
        let _file_lock = self.file_mutex.lock().unwrap();
        let mut file = self.load_locked()?;
        let entry = file
            .distributions
            .iter_mut()
            .find(|d| d.name == name.to_lowercase())
            .ok_or_else(|| Error::DistroUnknown(name.to_string()))?;
        entry.local_path = Some(path);
        entry.expected_digest = Some(digest);
        entry.available = true;
        write_json_atomic(&self.store.catalog_path(), &file)
    }

    /// Remember which container member a template came from.
    pub fn record_package_member(&self, name: &str, member: &str) -> Result<()> {
        let _file_lock = self.file_mutex.lock().unwrap();
        let mut file = self.load_locked()?;
        if let Some(entry) = file
            .distributions
            .iter_mut()
            .find(|d| d.name == name.to_lowercase())
        {
            entry.package_member = Some(member.to_string());
        }
        write_json_atomic(&self.store.catalog_path(), &file)
    }

    /// Drop local availability for a distro (template removed or failed).
    pub fn remove_local(&self, name: &str) -> Result<()> {
        let _file_lock = self.file_mutex.lock().unwrap();
        let mut file = self.load_locked()?;
        if let Some(entry) = file
            .distributions
            .iter_mut()
            .find(|d| d.name == name.to_lowercase())
        {
            entry.local_path = None;
            entry.available = false;
        }
        write_json_atomic(&self.store.catalog_path(), &file)
    }

    fn load(&self) -> Result<CatalogFile> {
        let _file_lock = self.file_mutex.lock().unwrap();
        self.load_locked()
    }

    fn load_locked(&self) -> Result<CatalogFile> {
        let mut file = match read_json::<CatalogFile>(&self.store.catalog_path())? {
            Some(file) => file,
            None => {
                let table = builtin_table();
                CatalogFile {
                    fetched_at: None,
                    default: Some(table.default),
                    distributions: table.distributions,
                }
            }
        };

        // A template that vanished from disk is no longer available.
        for distro in &mut file.distributions {
            if distro.available {
                let on_disk = distro
                    .local_path
                    .as_deref()
                    .map(|p| p.is_file())
                    .unwrap_or(false);
                if !on_disk {
                    distro.available = false;
                }
            }
        }

        Ok(file)
    }
}

/// Merge upstream records over the current catalog: upstream wins on source
/// metadata, local-only fields survive, and the builtin table backfills
/// entries the upstream document lacks.
fn merge(current: &[Distro], upstream: Vec<Distro>) -> Vec<Distro> {
    let mut merged: Vec<Distro> = Vec::new();

    for mut entry in upstream {
        if let Some(existing) = current.iter().find(|d| d.name == entry.name) {
            entry.local_path = existing.local_path.clone();
            entry.available = existing.available;
            entry.expected_digest = existing.expected_digest.clone();
            entry.package_member = existing.package_member.clone();
            if entry.version.is_empty() {
                entry.version = existing.version.clone();
            }
            if entry.description.is_empty() {
                entry.description = existing.description.clone();
            }
        }
        merged.push(entry);
    }

    for builtin in builtin_table().distributions {
        if merged.iter().any(|d| d.name == builtin.name) {
            continue;
        }
        let mut entry = builtin;
        if let Some(existing) = current.iter().find(|d| d.name == entry.name) {
            entry.local_path = existing.local_path.clone();
            entry.available = existing.available;
            entry.expected_digest = existing.expected_digest.clone();
            entry.package_member = existing.package_member.clone();
        }
        merged.push(entry);
    }

    // Locally materialized distros survive upstream removals.
    for existing in current {
        if existing.local_path.is_some() && !merged.iter().any(|d| d.name == existing.name) {
            merged.push(existing.clone());
        }
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn catalog_in(dir: &std::path::Path) -> Catalog {
        Catalog::new(Store::at(dir).unwrap())
    }

    #[test]
    fn builtin_table_parses_and_covers_the_basics() {
        let table = builtin_table();
        let names: Vec<_> = table.distributions.iter().map(|d| d.name.as_str()).collect();
        assert!(names.contains(&"alpine"));
        assert!(names.contains(&"ubuntu-22.04"));
        assert!(table
            .distributions
            .iter()
            .all(|d| d.source_url.starts_with("https://")));
        assert!(table.distributions.iter().all(|d| !d.available));
    }

    #[test]
    fn empty_store_lists_builtins() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = catalog_in(dir.path());

        let distros = catalog.list().unwrap();
        assert!(distros.iter().any(|d| d.name == "alpine"));
        assert!(distros.iter().all(|d| !d.available));
    }

    #[test]
    fn record_local_marks_available_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = catalog_in(dir.path());

        let template = dir.path().join("distros/alpine.tar.gz");
        std::fs::write(&template, b"tar").unwrap();
        catalog
            .record_local("alpine", template.clone(), "ab".repeat(32))
            .unwrap();

        let alpine = catalog.get("alpine").unwrap().unwrap();
        assert!(alpine.available);
        assert_eq!(alpine.local_path.as_deref(), Some(template.as_path()));
        assert_eq!(alpine.expected_digest.as_deref(), Some("ab".repeat(32).as_str()));

        // The persisted document is valid JSON.
        let raw = std::fs::read_to_string(dir.path().join("distros/catalog.json")).unwrap();
        serde_json::from_str::<serde_json::Value>(&raw).unwrap();
    }

    #[test]
    fn availability_drops_when_template_vanishes() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = catalog_in(dir.path());

        let template = dir.path().join("distros/alpine.tar.gz");
        std::fs::write(&template, b"tar").unwrap();
        catalog.record_local("alpine", template.clone(), "d".repeat(64)).unwrap();
        std::fs::remove_file(&template).unwrap();

        let alpine = catalog.get("alpine").unwrap().unwrap();
        assert!(!alpine.available);
    }

    #[test]
    fn record_local_unknown_distro_fails() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = catalog_in(dir.path());
        let err = catalog
            .record_local("no-such", dir.path().join("x.tar"), "d".repeat(64))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::DistroUnknown);
    }

    #[tokio::test]
    async fn refresh_merges_and_preserves_local_bits() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/registry.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"Default": "alpine", "Distributions": [
                    {"Name": "alpine", "FriendlyName": "Alpine (upstream)",
                     "Amd64WslUrl": "https://upstream/alpine.wsl"}
                ]}"#,
            ))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let catalog = catalog_in(dir.path());

        let template = dir.path().join("distros/alpine.tar.gz");
        std::fs::write(&template, b"tar").unwrap();
        catalog.record_local("alpine", template.clone(), "e".repeat(64)).unwrap();

        let distros = catalog
            .refresh_from(&format!("{}/registry.json", server.uri()), true)
            .await
            .unwrap();

        let alpine = distros.iter().find(|d| d.name == "alpine").unwrap();
        // Upstream metadata won...
        assert_eq!(alpine.display_name, "Alpine (upstream)");
        assert_eq!(alpine.source_url, "https://upstream/alpine.wsl");
        // ...local bookkeeping survived.
        assert!(alpine.available);
        assert_eq!(alpine.local_path.as_deref(), Some(template.as_path()));
        assert_eq!(alpine.expected_digest.as_deref(), Some("e".repeat(64).as_str()));

        // Builtin entries missing upstream were backfilled.
        assert!(distros.iter().any(|d| d.name == "ubuntu-22.04"));

        // Raw snapshot cached.
        assert!(dir.path().join("cache/distributions.json").is_file());
    }

    #[tokio::test]
    async fn refresh_respects_ttl() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/registry.json"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"{"Distributions": []}"#),
            )
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let catalog = catalog_in(dir.path());
        let url = format!("{}/registry.json", server.uri());

        catalog.refresh_from(&url, true).await.unwrap();
        // Within the TTL, a non-forced refresh serves the cache.
        catalog.refresh_from(&url, false).await.unwrap();
    }

    #[tokio::test]
    async fn download_lock_suppresses_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/registry.json"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(
                    r#"{"Distributions": [{"Name": "alpine",
                        "Amd64WslUrl": "https://clobber/alpine.wsl"}]}"#,
                ),
            )
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let catalog = catalog_in(dir.path());

        let _guard = catalog.download_lock_guard();
        let distros = catalog
            .refresh_from(&format!("{}/registry.json", server.uri()), true)
            .await
            .unwrap();

        // The cached (builtin) record is untouched.
        let alpine = distros.iter().find(|d| d.name == "alpine").unwrap();
        assert!(alpine.source_url.contains("alpinelinux.org"));
    }

    #[tokio::test]
    async fn lock_guard_releases_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = catalog_in(dir.path());

        {
            let _guard = catalog.download_lock_guard();
            assert!(catalog.is_download_locked());
        }
        assert!(!catalog.is_download_locked());

        catalog.set_download_lock(true);
        assert!(catalog.is_download_locked());
        catalog.set_download_lock(false);
        assert!(!catalog.is_download_locked());
    }

    #[tokio::test]
    async fn refresh_failure_keeps_a_valid_catalog() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/registry.json"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let catalog = catalog_in(dir.path());

        let distros = catalog
            .refresh_from(&format!("{}/registry.json", server.uri()), true)
            .await
            .unwrap();
        assert!(distros.iter().any(|d| d.name == "alpine"));

        let raw = std::fs::read_to_string(dir.path().join("distros/catalog.json")).unwrap();
        serde_json::from_str::<serde_json::Value>(&raw).unwrap();
    }

    #[test]
    fn remove_local_clears_bits() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = catalog_in(dir.path());

        let template = dir.path().join("distros/alpine.tar.gz");
        std::fs::write(&template, b"tar").unwrap();
        catalog.record_local("alpine", template, "f".repeat(64)).unwrap();
        catalog.remove_local("alpine").unwrap();

        let alpine = catalog.get("alpine").unwrap().unwrap();
        assert!(!alpine.available);
        assert!(alpine.local_path.is_none());
    }
}
