//! Image manager
//!
//! CRUD over managed WSL images: import from a distro template, clone from
//! an existing image, import from a user tar, export, delete, and property
//! updates. The WSL registration set and the persisted index are kept in
//! agreement: the index is written only after the CLI mutation succeeded, a
//! failure after `--import` triggers a compensating `--unregister`, and
//! `list()` reconciles both worlds, adopting legacy registrations.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use lazy_static::lazy_static;
use log::{info, warn};
use uuid::Uuid;
use wsl_core::parse_list_verbose;

use crate::cancel::CancelToken;
use crate::catalog::Catalog;
use crate::distro::sha256_file;
use crate::error::{Error, Result};
use crate::index::{Image, ImageIndex, ImageSource, ManifestPresence, Scope};
use crate::manifest::{
    build_for_clone, build_for_new_image, Layer, LayerKind, Manifest, ManifestEngine,
    ManifestSource, SourceKind,
};
use crate::profiles::{FileProfileSink, Projector};
use crate::store::Store;
use crate::validation::{validate_name, validate_tar_path};
use crate::wsl::executor::WslCommandExecutor;

lazy_static! {
    /// Per-image mutexes: no two operations may mutate the same image
    /// concurrently.
    static ref IMAGE_LOCKS: Mutex<HashMap<String, Arc<Mutex<()>>>> = Mutex::new(HashMap::new());
}

fn image_lock(name: &str) -> Arc<Mutex<()>> {
    IMAGE_LOCKS
        .lock()
        .unwrap()
        .entry(name.to_string())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

/// Options shared by the image-creating operations.
#[derive(Debug, Clone)]
pub struct CreateImageOptions {
    pub display_name: Option<String>,
    pub description: Option<String>,
    /// Gates terminal-profile projection; on by default.
    pub enable_terminal: bool,
    pub scope: Scope,
    pub wsl_version: Option<u8>,
    /// One-shot provisioning script run as root after import.
    pub post_install: Option<String>,
    pub cancel: CancelToken,
}

impl Default for CreateImageOptions {
    fn default() -> Self {
        Self {
            display_name: None,
            description: None,
            enable_terminal: true,
            scope: Scope::Global,
            wsl_version: None,
            post_install: None,
            cancel: CancelToken::new(),
        }
    }
}

/// Index-only property updates.
#[derive(Debug, Clone, Default)]
pub struct UpdateProperties {
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub enabled: Option<bool>,
    pub tags: Option<Vec<String>>,
}

/// `get_info` result: the record plus best-effort facts from inside the
/// image.
#[derive(Debug, Clone)]
pub struct ImageInfo {
    pub image: Image,
    pub os: Option<String>,
    pub kernel: Option<String>,
    pub memory: Option<String>,
}

pub struct ImageManager {
    store: Store,
    catalog: Catalog,
    index: ImageIndex,
    executor: Arc<dyn WslCommandExecutor>,
    manifests: ManifestEngine,
    projector: Projector,
}

impl ImageManager {
    pub fn new(store: Store, catalog: Catalog, executor: Arc<dyn WslCommandExecutor>) -> Self {
        let index = ImageIndex::new(store.clone());
        let manifests = ManifestEngine::new(executor.clone());
        let projector = Projector::new(Box::new(FileProfileSink::new(
            store.terminal_profiles_path(),
        )));
        Self {
            store,
            catalog,
            index,
            executor,
            manifests,
            projector,
        }
    }

    // ==================== Creation ====================

    /// Import a fresh image from an available distro template.
    pub fn create_from_distro(
        &self,
        distro_name: &str,
        new_image_name: &str,
        opts: &CreateImageOptions,
    ) -> Result<Image> {
        let distro_name = validate_name(distro_name)?.as_str().to_lowercase();
        let image_name = validate_name(new_image_name)?;

        let distro = self
            .catalog
            .get(&distro_name)?
            .ok_or_else(|| Error::DistroUnknown(distro_name.clone()))?;
        if !distro.available {
            return Err(Error::DistroUnavailable(distro_name.clone()));
        }
        let template = distro
            .local_path
            .clone()
            .or_else(|| self.store.find_distro_template(&distro_name))
            .ok_or_else(|| Error::DistroUnavailable(distro_name.clone()))?;

        let source = ManifestSource {
            kind: SourceKind::Distro,
            reference: distro.name.clone(),
            digest: distro.expected_digest.clone(),
            detail: distro.package_member.clone(),
        };
        let index_source = ImageSource::Distro {
            name: distro.name.clone(),
            digest: distro.expected_digest.clone(),
        };

        self.import_image(image_name.as_str(), &template, source, index_source, opts)
    }

    /// Import an image from a user-supplied tar.
    pub fn import_tar(
        &self,
        tar_path: &str,
        new_image_name: &str,
        opts: &CreateImageOptions,
    ) -> Result<Image> {
        let image_name = validate_name(new_image_name)?;
        let tar = validate_tar_path(tar_path, true)?;
        let digest = sha256_file(&tar)?;

        let source = ManifestSource {
            kind: SourceKind::ImportedTar,
            reference: tar.to_string_lossy().into_owned(),
            digest: Some(digest.clone()),
            detail: None,
        };
        let index_source = ImageSource::ImportedTar {
            path: tar.to_string_lossy().into_owned(),
            digest,
        };

        self.import_image(image_name.as_str(), &tar, source, index_source, opts)
    }

    /// Clone an existing image by exporting and re-importing it.
    pub fn clone_image(
        &self,
        src_image_name: &str,
        new_image_name: &str,
        opts: &CreateImageOptions,
    ) -> Result<Image> {
        let src = validate_name(src_image_name)?;
        let new = validate_name(new_image_name)?;

        // Lock both images in name order to keep lock acquisition total.
        let mut lock_names = [src.as_str(), new.as_str()];
        lock_names.sort_unstable();
        let first = image_lock(lock_names[0]);
        let second = image_lock(lock_names[1]);
        let _first = first.lock().unwrap();
        let _second = second.lock().unwrap();

        let registrations = self.registrations()?;
        let src_registration = registrations
            .iter()
            .find(|r| r.name == src.as_str())
            .ok_or_else(|| Error::ImageNotFound(src.as_str().to_string()))?;
        self.ensure_free(new.as_str(), &registrations)?;

        opts.cancel.check()?;

        let temp_tar = std::env::temp_dir().join(format!(
            "wsl-manager-clone-{}-{}.tar",
            std::process::id(),
            new.as_str()
        ));
        let temp_guard = crate::temp_file_guard::TempFileGuard::new(&temp_tar);

        self.executor
            .export(src.as_str(), &temp_tar.to_string_lossy())?
            .into_result()?;

        opts.cancel.check()?;

        let parent_manifest = self.manifests.read_from(src.as_str())?;

        let install_path = self.store.image_install_path(new.as_str());
        std::fs::create_dir_all(&install_path)?;
        let version = opts.wsl_version.unwrap_or(src_registration.version);
        validate_wsl_version(version)?;

        let imported = self
            .executor
            .import(
                new.as_str(),
                &install_path.to_string_lossy(),
                &temp_tar.to_string_lossy(),
                Some(version),
            )?
            .into_result();
        if let Err(e) = imported {
            let _ = std::fs::remove_dir_all(&install_path);
            return Err(e);
        }
        drop(temp_guard);

        let manifest = match &parent_manifest {
            Some(parent) => build_for_clone(new.as_str(), parent),
            // Legacy parents carry no manifest; the child starts a fresh one.
            None => build_for_new_image(
                new.as_str(),
                ManifestSource {
                    kind: SourceKind::Image,
                    reference: src.as_str().to_string(),
                    digest: None,
                    detail: None,
                },
            ),
        };

        let finish = self.finish_import(new.as_str(), &manifest, opts);
        if let Err(e) = finish {
            self.compensate_failed_import(new.as_str(), &install_path);
            return Err(e);
        }

        let image = self.build_record(
            new.as_str(),
            ImageSource::Image {
                id: parent_manifest
                    .as_ref()
                    .map(|p| p.image_id.clone())
                    .unwrap_or_else(|| "unknown".to_string()),
                name: src.as_str().to_string(),
            },
            version,
            install_path,
            opts,
        );
        self.index.update(|images| images.push(image.clone()))?;
        self.sync_profiles()?;

        info!("cloned {} into {}", src.as_str(), new.as_str());
        Ok(image)
    }

    /// Shared import path for distro templates and user tars.
    fn import_image(
        &self,
        name: &str,
        tarball: &std::path::Path,
        manifest_source: ManifestSource,
        index_source: ImageSource,
        opts: &CreateImageOptions,
    ) -> Result<Image> {
        let lock = image_lock(name);
        let _lock = lock.lock().unwrap();

        let registrations = self.registrations()?;
        self.ensure_free(name, &registrations)?;

        opts.cancel.check()?;

        let install_path = self.store.image_install_path(name);
        std::fs::create_dir_all(&install_path)?;
        let version = opts.wsl_version.unwrap_or(2);
        validate_wsl_version(version)?;

        let imported = self
            .executor
            .import(
                name,
                &install_path.to_string_lossy(),
                &tarball.to_string_lossy(),
                Some(version),
            )?
            .into_result();
        if let Err(e) = imported {
            let _ = std::fs::remove_dir_all(&install_path);
            return Err(e);
        }

        let manifest = build_for_new_image(name, manifest_source);
        let finish = self.finish_import(name, &manifest, opts);
        if let Err(e) = finish {
            self.compensate_failed_import(name, &install_path);
            return Err(e);
        }

        let image = self.build_record(name, index_source, version, install_path, opts);
        // Index last: a crash before this point leaves at most a stray
        // registration, reconciled on the next list().
        self.index.update(|images| images.push(image.clone()))?;
        self.sync_profiles()?;

        info!("created image {name}");
        Ok(image)
    }

    /// Post-import steps that must all succeed before the image exists for
    /// the index: manifest write, then optional provisioning.
    fn finish_import(
        &self,
        name: &str,
        manifest: &Manifest,
        opts: &CreateImageOptions,
    ) -> Result<()> {
        opts.cancel.check()?;
        self.manifests.write_into(name, manifest)?;

        if let Some(script) = &opts.post_install {
            opts.cancel.check()?;
            self.executor
                .exec_in(name, Some("root"), script)?
                .into_result()?;
            self.manifests.append_layer(
                name,
                Layer {
                    kind: LayerKind::BootstrapScript,
                    id: Uuid::new_v4().to_string(),
                    at: Utc::now().to_rfc3339(),
                    detail: Some(serde_json::json!({ "script": script })),
                },
            )?;
        }
        Ok(())
    }

    fn compensate_failed_import(&self, name: &str, install_path: &std::path::Path) {
        warn!("rolling back failed import of {name}");
        if let Ok(output) = self.executor.unregister(name) {
            if !output.success() {
                warn!("compensating unregister of {name} failed: {}", output.stderr);
            }
        }
        let _ = std::fs::remove_dir_all(install_path);
    }

    fn build_record(
        &self,
        name: &str,
        source: ImageSource,
        version: u8,
        install_path: PathBuf,
        opts: &CreateImageOptions,
    ) -> Image {
        Image {
            name: name.to_string(),
            display_name: opts
                .display_name
                .clone()
                .unwrap_or_else(|| name.to_string()),
            description: opts.description.clone(),
            source,
            created_at: Utc::now().to_rfc3339(),
            wsl_version: version,
            install_path: Some(install_path),
            enabled: opts.enable_terminal,
            scope: opts.scope.clone(),
            tags: Vec::new(),
            manifest_present: ManifestPresence::Present,
        }
    }

    // ==================== Export / delete / update ====================

    /// Export an image to a tar. Does not mutate the index.
    pub fn export_image(&self, name: &str, out_path: &str, cancel: &CancelToken) -> Result<()> {
        let name = validate_name(name)?;
        let out = validate_tar_path(out_path, false)?;

        let registrations = self.registrations()?;
        if !registrations.iter().any(|r| r.name == name.as_str()) {
            return Err(Error::ImageNotFound(name.as_str().to_string()));
        }

        cancel.check()?;
        self.executor
            .export(name.as_str(), &out.to_string_lossy())?
            .into_result()?;

        if cancel.is_cancelled() {
            let _ = std::fs::remove_file(&out);
            return Err(Error::Cancelled);
        }
        info!("exported {} to {}", name.as_str(), out.display());
        Ok(())
    }

    /// Unregister an image, remove its install directory, drop it from the
    /// index.
    pub fn delete_image(&self, name: &str) -> Result<()> {
        let name = validate_name(name)?;
        let lock = image_lock(name.as_str());
        let _lock = lock.lock().unwrap();

        // Stop it first; a running instance holds its filesystem open.
        let _ = self.executor.terminate(name.as_str());
        self.executor.unregister(name.as_str())?.into_result()?;

        let entry = self.index.get(name.as_str())?;
        if let Some(path) = entry.as_ref().and_then(|i| i.install_path.clone()) {
            let _ = std::fs::remove_dir_all(path);
        }
        self.index
            .update(|images| images.retain(|i| i.name != name.as_str()))?;
        self.sync_profiles()?;

        info!("deleted image {}", name.as_str());
        Ok(())
    }

    /// Index-only mutation; never touches the image filesystem.
    pub fn update_properties(&self, name: &str, props: &UpdateProperties) -> Result<Image> {
        let name = validate_name(name)?;

        let updated = self.index.update(|images| {
            let image = images.iter_mut().find(|i| i.name == name.as_str())?;
            if let Some(display_name) = &props.display_name {
                image.display_name = display_name.clone();
            }
            if let Some(description) = &props.description {
                image.description = Some(description.clone());
            }
            if let Some(enabled) = props.enabled {
                image.enabled = enabled;
            }
            if let Some(tags) = &props.tags {
                image.tags = tags.clone();
            }
            Some(image.clone())
        })?;

        let image = updated.ok_or_else(|| Error::ImageNotFound(name.as_str().to_string()))?;
        self.sync_profiles()?;
        Ok(image)
    }

    // ==================== Listing & info ====================

    /// Reconciled view: index entries whose registration vanished are
    /// dropped; unknown registrations are adopted as legacy images.
    pub fn list(&self) -> Result<Vec<Image>> {
        let registrations = self.registrations()?;
        let mut changed = false;

        let images = self.index.update(|images| {
            let before = images.len();
            images.retain(|image| registrations.iter().any(|r| r.name == image.name));
            changed |= images.len() != before;

            for registration in &registrations {
                if images.iter().any(|i| i.name == registration.name) {
                    continue;
                }
                changed = true;
                images.push(Image {
                    name: registration.name.clone(),
                    display_name: registration.name.clone(),
                    description: None,
                    source: ImageSource::Legacy,
                    created_at: Utc::now().to_rfc3339(),
                    wsl_version: registration.version,
                    install_path: None,
                    enabled: true,
                    scope: Scope::Global,
                    tags: Vec::new(),
                    manifest_present: ManifestPresence::Unknown,
                });
            }
            images.clone()
        })?;

        if changed {
            self.sync_profiles()?;
        }
        Ok(images)
    }

    pub fn get(&self, name: &str) -> Result<Image> {
        let name = validate_name(name)?;
        self.list()?
            .into_iter()
            .find(|i| i.name == name.as_str())
            .ok_or_else(|| Error::ImageNotFound(name.as_str().to_string()))
    }

    /// The image record plus `uname -r`, `/etc/os-release`, and `free -h`
    /// facts; each probe failure degrades to `None`.
    pub fn get_info(&self, name: &str) -> Result<ImageInfo> {
        let image = self.get(name)?;

        let kernel = self.probe(&image.name, "uname -r").map(|s| s.trim().to_string());
        let os = self
            .probe(&image.name, "cat /etc/os-release")
            .and_then(|out| parse_os_release(&out));
        let memory = self.probe(&image.name, "free -h").and_then(|out| {
            out.lines()
                .find(|l| l.starts_with("Mem:"))
                .map(|l| l.trim().to_string())
        });

        Ok(ImageInfo {
            image,
            os,
            kernel,
            memory,
        })
    }

    /// Read the manifest of a managed image.
    pub fn read_manifest(&self, name: &str) -> Result<Option<Manifest>> {
        let name = validate_name(name)?;
        self.manifests.read_from(name.as_str())
    }

    /// Re-project terminal profiles from the current index.
    pub fn sync_profiles(&self) -> Result<()> {
        let images = self.index.load()?;
        self.projector.project(&images)?;
        Ok(())
    }

    /// The currently published terminal profiles.
    pub fn published_profiles(&self) -> Result<Vec<crate::profiles::TerminalProfile>> {
        self.projector.current()
    }

    /// WSL host version string, when the host answers `wsl --version`.
    pub fn host_version(&self) -> Option<String> {
        let output = self.executor.version().ok()?;
        if !output.success() {
            return None;
        }
        extract_wsl_version(&output.stdout)
    }

    /// Distribution names offered by `wsl --list --online`.
    pub fn list_online_distributions(&self) -> Result<Vec<String>> {
        let output = self.executor.list_online()?.into_result()?;
        Ok(parse_online_listing(&output.stdout))
    }

    // ==================== Internals ====================

    fn probe(&self, name: &str, command: &str) -> Option<String> {
        match self.executor.exec_in(name, None, command) {
            Ok(output) if output.success() => Some(output.stdout),
            Ok(output) => {
                warn!("probe '{command}' in {name} failed: {}", output.stderr);
                None
            }
            Err(e) => {
                warn!("probe '{command}' in {name} failed: {e}");
                None
            }
        }
    }

    fn registrations(&self) -> Result<Vec<wsl_core::Registration>> {
        let output = self.executor.list_verbose()?;
        let combined = format!("{}\n{}", output.stdout, output.stderr).to_lowercase();
        // An empty host is a valid state, not an error.
        if combined.contains("no installed distributions") {
            return Ok(Vec::new());
        }
        let output = output.into_result()?;
        Ok(parse_list_verbose(&output.stdout))
    }

    fn ensure_free(&self, name: &str, registrations: &[wsl_core::Registration]) -> Result<()> {
        if registrations.iter().any(|r| r.name == name) || self.index.get(name)?.is_some() {
            return Err(Error::ImageExists(name.to_string()));
        }
        Ok(())
    }
}

fn validate_wsl_version(version: u8) -> Result<()> {
    if version == 1 || version == 2 {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "WSL version must be 1 or 2, got {version}"
        )))
    }
}

/// Pull the version out of `wsl --version` output ("WSL version: 2.3.26.0").
fn extract_wsl_version(output: &str) -> Option<String> {
    for line in output.lines() {
        let line = line.trim();
        if line.to_lowercase().starts_with("wsl") && line.contains(':') {
            if let Some(version) = line.split(':').nth(1) {
                let version = version.trim();
                if !version.is_empty() {
                    return Some(version.to_string());
                }
            }
        }
    }
    None
}

/// Parse `wsl --list --online`: names start after the NAME header row.
fn parse_online_listing(output: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut found_header = false;
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.contains("NAME") || line.contains("----") {
            found_header = true;
            continue;
        }
        if found_header {
            if let Some(name) = line.split_whitespace().next() {
                names.push(name.to_string());
            }
        }
    }
    names
}

fn parse_os_release(output: &str) -> Option<String> {
    for key in ["PRETTY_NAME=", "NAME="] {
        for line in output.lines() {
            if let Some(value) = line.strip_prefix(key) {
                return Some(value.trim_matches('"').to_string());
            }
        }
    }
    None
}
