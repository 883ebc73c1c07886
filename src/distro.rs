//! Distro downloader
//!
//! Orchestrates the HTTP downloader, the archive normalizer, and the catalog
//! to materialize a distro template: fetch the upstream package to a scratch
//! file, normalize it to a canonical tar, verify its digest, and only then
//! let it appear under its canonical name. The download-lock is held from
//! before the first filesystem effect until the operation leaves, on every
//! exit path.

use std::io::Read;
use std::path::Path;

use log::{info, warn};
use sha2::{Digest, Sha256};

use crate::archive;
use crate::catalog::{Catalog, Distro};
use crate::download::{self, DownloadOptions, ProgressObserver};
use crate::error::{Error, Result};
use crate::store::Store;
use crate::temp_file_guard::{TempDirGuard, TempFileGuard};
use crate::validation::validate_name;

/// Downloader over a store and its catalog.
pub struct DistroDownloader {
    store: Store,
    catalog: Catalog,
}

impl DistroDownloader {
    pub fn new(store: Store, catalog: Catalog) -> Self {
        Self { store, catalog }
    }

    /// Download and materialize the template for `name`.
    ///
    /// On success the canonical tar exists under `distros/` and the catalog
    /// marks the distro available with its digest recorded. On any failure
    /// the scratch package, the extraction workdir, and any partial canonical
    /// tar are gone.
    pub async fn download_distro(
        &self,
        name: &str,
        observer: &dyn ProgressObserver,
        opts: &DownloadOptions,
    ) -> Result<Distro> {
        let name = validate_name(name)?.as_str().to_lowercase();
        let distro = self
            .catalog
            .get(&name)?
            .ok_or_else(|| Error::DistroUnknown(name.clone()))?;

        // Held until return; suppresses concurrent catalog refreshes.
        let _lock = self.catalog.download_lock_guard();

        let scratch_path = self.store.distros_dir().join(format!(".{name}.pkg"));
        let scratch = TempFileGuard::new(&scratch_path);

        let downloaded =
            download::download(&distro.source_url, scratch.path(), observer, opts).await?;

        opts.cancel.check()?;

        let workdir = TempDirGuard::new(self.store.distros_dir().join(format!(".{name}.extract")));
        let normalized = archive::normalize_to_tar(scratch.path(), workdir.path())?;
        archive::verify_tar_template(&normalized.path)?;

        let digest = if normalized.path == scratch.path() {
            downloaded.sha256
        } else {
            sha256_file(&normalized.path)?
        };

        if let Some(expected) = &distro.expected_digest {
            if !expected.eq_ignore_ascii_case(&digest) {
                warn!("digest mismatch for {name}: expected {expected}, got {digest}");
                self.discard_canonical(&name)?;
                self.catalog.remove_local(&name)?;
                return Err(Error::IntegrityFailed {
                    expected: expected.to_lowercase(),
                    actual: digest,
                });
            }
        }

        opts.cancel.check()?;

        // Verified; now (and only now) give it the canonical name. A stale
        // template with a different compression must not linger.
        self.discard_canonical(&name)?;
        let canonical = self.store.distro_template_path(&name, normalized.extension);
        std::fs::rename(&normalized.path, &canonical)?;

        self.catalog
            .record_local(&name, canonical.clone(), digest.clone())?;
        if let Some(member) = &normalized.inner_member {
            self.catalog.record_package_member(&name, member)?;
        }

        info!(
            "distro {name} materialized at {} (sha256 {digest})",
            canonical.display()
        );

        self.catalog
            .get(&name)?
            .ok_or_else(|| Error::Internal(format!("{name} vanished from catalog")))
    }

    /// Remove a materialized template and its availability record.
    pub fn remove_distro(&self, name: &str) -> Result<()> {
        let name = validate_name(name)?.as_str().to_lowercase();
        if self.catalog.get(&name)?.is_none() {
            return Err(Error::DistroUnknown(name));
        }
        self.discard_canonical(&name)?;
        self.catalog.remove_local(&name)?;
        info!("distro {name} removed from the store");
        Ok(())
    }

    fn discard_canonical(&self, name: &str) -> Result<()> {
        while let Some(existing) = self.store.find_distro_template(name) {
            std::fs::remove_file(existing)?;
        }
        Ok(())
    }
}

/// Streaming SHA-256 of a file.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::download::DownloadProgress;
    use std::io::Write;
    use std::sync::Mutex;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn tar_gz_bytes() -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let data = b"NAME=Alpine";
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "etc/os-release", &data[..]).unwrap();
        let tar = builder.into_inner().unwrap();

        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&tar).unwrap();
        encoder.finish().unwrap()
    }

    fn appxbundle_bytes() -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        let options: zip::write::SimpleFileOptions = Default::default();
        writer.start_file("AppxManifest.xml", options).unwrap();
        writer.write_all(b"<xml/>").unwrap();
        writer.start_file("install.tar.gz", options).unwrap();
        writer.write_all(&tar_gz_bytes()).unwrap();
        writer.finish().unwrap().into_inner()
    }

    fn sha256_hex(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        format!("{:x}", hasher.finalize())
    }

    /// Seed a catalog whose entry points at the mock server.
    fn seed_catalog(store: &Store, name: &str, url: &str, digest: Option<&str>) {
        let digest_field = digest
            .map(|d| format!(r#""expected_digest": "{d}","#))
            .unwrap_or_default();
        let doc = format!(
            r#"{{"distributions": [{{
                "name": "{name}",
                "display_name": "{name}",
                "architecture": "x64",
                {digest_field}
                "source_url": "{url}"
            }}]}}"#
        );
        std::fs::write(store.catalog_path(), doc).unwrap();
    }

    struct Recorder(Mutex<Vec<DownloadProgress>>);
    impl ProgressObserver for Recorder {
        fn on_progress(&self, p: DownloadProgress) {
            self.0.lock().unwrap().push(p);
        }
    }

    #[tokio::test]
    async fn first_run_download_materializes_template() {
        let server = MockServer::start().await;
        let body = tar_gz_bytes();
        Mock::given(method("GET"))
            .and(path("/alpine.tar.gz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = Store::at(dir.path()).unwrap();
        let catalog = Catalog::new(store.clone());
        seed_catalog(&store, "alpine", &format!("{}/alpine.tar.gz", server.uri()), None);

        let downloader = DistroDownloader::new(store.clone(), catalog.clone());
        let recorder = Recorder(Mutex::new(Vec::new()));
        let distro = downloader
            .download_distro("alpine", &recorder, &DownloadOptions::default())
            .await
            .unwrap();

        assert!(distro.available);
        assert_eq!(distro.expected_digest.as_deref(), Some(sha256_hex(&body).as_str()));
        let canonical = store.distros_dir().join("alpine.tar.gz");
        assert!(canonical.is_file());
        assert_eq!(distro.local_path.as_deref(), Some(canonical.as_path()));

        // Progress ended at 100% and byte counts never decreased.
        let events = recorder.0.lock().unwrap();
        assert_eq!(events.last().unwrap().percent, Some(100.0));
        assert!(events.windows(2).all(|w| w[0].downloaded <= w[1].downloaded));

        // No scratch artifacts remain.
        assert!(!store.distros_dir().join(".alpine.pkg").exists());
        assert!(!store.distros_dir().join(".alpine.extract").exists());
        assert!(!catalog.is_download_locked());
    }

    #[tokio::test]
    async fn zip_wrapped_package_is_unwrapped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ubuntu.appxbundle"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(appxbundle_bytes()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = Store::at(dir.path()).unwrap();
        let catalog = Catalog::new(store.clone());
        seed_catalog(
            &store,
            "ubuntu-22.04",
            &format!("{}/ubuntu.appxbundle", server.uri()),
            None,
        );

        let downloader = DistroDownloader::new(store.clone(), catalog.clone());
        let distro = downloader
            .download_distro("ubuntu-22.04", &(), &DownloadOptions::default())
            .await
            .unwrap();

        // The canonical template is the inner tar-gz, not the bundle.
        let canonical = store.distros_dir().join("ubuntu-22.04.tar.gz");
        assert!(canonical.is_file());
        let head = std::fs::read(&canonical).unwrap();
        assert_eq!(&head[..2], &[0x1F, 0x8B]);

        // Digest covers the final canonical tar.
        assert_eq!(
            distro.expected_digest.unwrap(),
            sha256_hex(&tar_gz_bytes())
        );

        // Scratch bundle is gone; the chosen member is on record.
        assert!(!store.distros_dir().join(".ubuntu-22.04.pkg").exists());
        let ubuntu = catalog.get("ubuntu-22.04").unwrap().unwrap();
        assert_eq!(ubuntu.package_member.as_deref(), Some("install.tar.gz"));
    }

    #[tokio::test]
    async fn digest_mismatch_is_integrity_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/alpine.tar.gz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(tar_gz_bytes()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = Store::at(dir.path()).unwrap();
        let catalog = Catalog::new(store.clone());
        seed_catalog(
            &store,
            "alpine",
            &format!("{}/alpine.tar.gz", server.uri()),
            Some(&"0".repeat(64)),
        );

        let downloader = DistroDownloader::new(store.clone(), catalog.clone());
        let err = downloader
            .download_distro("alpine", &(), &DownloadOptions::default())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), crate::error::ErrorKind::IntegrityFailed);
        assert!(store.find_distro_template("alpine").is_none());
        assert!(!catalog.get("alpine").unwrap().unwrap().available);
        assert!(!catalog.is_download_locked());
    }

    #[tokio::test]
    async fn unknown_distro_fails_before_any_network() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::at(dir.path()).unwrap();
        let catalog = Catalog::new(store.clone());

        let downloader = DistroDownloader::new(store, catalog);
        let err = downloader
            .download_distro("no-such-distro", &(), &DownloadOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::DistroUnknown);
    }

    #[tokio::test]
    async fn invalid_name_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::at(dir.path()).unwrap();
        let catalog = Catalog::new(store.clone());

        let downloader = DistroDownloader::new(store, catalog);
        let err = downloader
            .download_distro("alpine; rm -rf /", &(), &DownloadOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn cancellation_leaves_no_canonical_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/alpine.tar.gz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(tar_gz_bytes()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = Store::at(dir.path()).unwrap();
        let catalog = Catalog::new(store.clone());
        seed_catalog(&store, "alpine", &format!("{}/alpine.tar.gz", server.uri()), None);

        let opts = DownloadOptions::default();
        opts.cancel.cancel();

        let downloader = DistroDownloader::new(store.clone(), catalog.clone());
        let err = downloader
            .download_distro("alpine", &(), &opts)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), crate::error::ErrorKind::Cancelled);
        assert!(store.find_distro_template("alpine").is_none());
        assert!(!catalog.is_download_locked());
    }

    #[tokio::test]
    async fn remove_distro_clears_template_and_record() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/alpine.tar.gz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(tar_gz_bytes()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = Store::at(dir.path()).unwrap();
        let catalog = Catalog::new(store.clone());
        seed_catalog(&store, "alpine", &format!("{}/alpine.tar.gz", server.uri()), None);

        let downloader = DistroDownloader::new(store.clone(), catalog.clone());
        downloader
            .download_distro("alpine", &(), &DownloadOptions::default())
            .await
            .unwrap();
        assert!(store.find_distro_template("alpine").is_some());

        downloader.remove_distro("alpine").unwrap();
        assert!(store.find_distro_template("alpine").is_none());
        assert!(!catalog.get("alpine").unwrap().unwrap().available);
    }

    #[test]
    fn sha256_file_matches_in_memory_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, b"digest me").unwrap();
        assert_eq!(sha256_file(&path).unwrap(), sha256_hex(b"digest me"));
    }
}
