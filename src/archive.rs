//! Archive normalization
//!
//! Upstream packages arrive in heterogeneous formats: raw tars, gzipped or
//! xz tars (which WSL imports directly), and zip containers (`.appx`,
//! `.appxbundle`, store packages) wrapping an inner rootfs tar. This module
//! sniffs the file magic and produces a canonical tar template, recording
//! which inner member was chosen when a container had to be unwrapped.

use std::fs;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::error::{Error, Result};

const ZIP_MAGIC: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];
const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];
const XZ_MAGIC: [u8; 6] = [0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00];
const USTAR_MAGIC: &[u8; 5] = b"ustar";
const USTAR_OFFSET: u64 = 257;

/// Sniffed package format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageFormat {
    Zip,
    Gzip,
    Xz,
    Tar,
}

impl PackageFormat {
    /// Canonical template extension for pass-through formats.
    pub fn template_extension(self) -> &'static str {
        match self {
            PackageFormat::Gzip => ".tar.gz",
            PackageFormat::Xz => ".tar.xz",
            _ => ".tar",
        }
    }
}

/// Result of normalization: a tar (possibly compressed) ready to become a
/// distro template.
#[derive(Debug, Clone)]
pub struct NormalizedArchive {
    pub path: PathBuf,
    pub extension: &'static str,
    /// Zip container member the tar came from, if the package was a container.
    pub inner_member: Option<String>,
}

/// Sniff the format of a file from its magic bytes. Files with no recognized
/// magic are treated as raw tars (WSL accepts headerless tars).
pub fn sniff_format(path: &Path) -> Result<PackageFormat> {
    let mut file = fs::File::open(path)?;
    let mut head = [0u8; 6];
    let read = read_up_to(&mut file, &mut head)?;

    if read >= 4 && head[..4] == ZIP_MAGIC {
        return Ok(PackageFormat::Zip);
    }
    if read >= 2 && head[..2] == GZIP_MAGIC {
        return Ok(PackageFormat::Gzip);
    }
    if read >= 6 && head == XZ_MAGIC {
        return Ok(PackageFormat::Xz);
    }

    if file.seek(SeekFrom::Start(USTAR_OFFSET)).is_ok() {
        let mut ustar = [0u8; 5];
        if read_up_to(&mut file, &mut ustar)? == 5 && &ustar == USTAR_MAGIC {
            return Ok(PackageFormat::Tar);
        }
    }

    Ok(PackageFormat::Tar)
}

/// Normalize a downloaded package into a canonical tar.
///
/// Pass-through for tar/gzip/xz; zip containers are searched for an inner
/// rootfs tar which is extracted into `workdir`.
pub fn normalize_to_tar(input: &Path, workdir: &Path) -> Result<NormalizedArchive> {
    let format = sniff_format(input)?;
    debug!("{} sniffed as {format:?}", input.display());

    match format {
        PackageFormat::Zip => extract_rootfs_from_container(input, workdir),
        other => Ok(NormalizedArchive {
            path: input.to_path_buf(),
            extension: other.template_extension(),
            inner_member: None,
        }),
    }
}

/// Cheap corruption check on a canonical template: the first tar entry header
/// must parse. Xz templates are only magic-checked (no xz decoder in-tree).
pub fn verify_tar_template(path: &Path) -> Result<()> {
    match sniff_format(path)? {
        PackageFormat::Tar => {
            let file = fs::File::open(path)?;
            read_first_entry(tar::Archive::new(file), path)
        }
        PackageFormat::Gzip => {
            let file = fs::File::open(path)?;
            let decoder = flate2::read::GzDecoder::new(file);
            read_first_entry(tar::Archive::new(decoder), path)
        }
        PackageFormat::Xz => Ok(()),
        PackageFormat::Zip => Err(Error::Internal(format!(
            "{} is still a zip container after normalization",
            path.display()
        ))),
    }
}

fn read_first_entry<R: Read>(mut archive: tar::Archive<R>, path: &Path) -> Result<()> {
    let mut entries = archive
        .entries()
        .map_err(|e| Error::Internal(format!("{} is not a tar: {e}", path.display())))?;
    match entries.next() {
        Some(Ok(_)) => Ok(()),
        Some(Err(e)) => Err(Error::Internal(format!(
            "{} has a corrupt tar header: {e}",
            path.display()
        ))),
        None => Err(Error::Internal(format!("{} is an empty tar", path.display()))),
    }
}

// ==================== Zip container handling ====================

#[derive(Debug, Clone)]
struct Candidate {
    name: String,
    size: u64,
    /// Name of the nested container this entry lives in, when not top-level.
    nested_in: Option<String>,
}

/// Does this basename look like a rootfs tar (`install*.tar*`, `rootfs*.tar*`)?
fn is_rootfs_candidate(entry_name: &str) -> bool {
    let base = entry_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(entry_name)
        .to_lowercase();
    (base.starts_with("install") || base.starts_with("rootfs")) && base.contains(".tar")
}

/// Bundle members that may themselves wrap the rootfs (`.appx` inside an
/// `.appxbundle`).
fn is_nested_container(entry_name: &str) -> bool {
    let lower = entry_name.to_lowercase();
    lower.ends_with(".appx") || lower.ends_with(".zip")
}

/// Preference: `install.tar.gz` > `install.tar` > largest.
fn pick_candidate(mut candidates: Vec<Candidate>) -> Option<Candidate> {
    if candidates.is_empty() {
        return None;
    }
    let basename = |c: &Candidate| -> String {
        c.name
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(&c.name)
            .to_lowercase()
    };
    if let Some(exact) = candidates.iter().find(|c| basename(c) == "install.tar.gz") {
        return Some(exact.clone());
    }
    if let Some(exact) = candidates.iter().find(|c| basename(c) == "install.tar") {
        return Some(exact.clone());
    }
    candidates.sort_by_key(|c| std::cmp::Reverse(c.size));
    candidates.into_iter().next()
}

fn extract_rootfs_from_container(input: &Path, workdir: &Path) -> Result<NormalizedArchive> {
    fs::create_dir_all(workdir)?;

    let file = fs::File::open(input)?;
    let mut zip = zip::ZipArchive::new(io::BufReader::new(file))
        .map_err(|e| Error::Internal(format!("cannot open container {}: {e}", input.display())))?;

    let mut candidates = Vec::new();
    let mut nested = Vec::new();
    for i in 0..zip.len() {
        let entry = zip
            .by_index(i)
            .map_err(|e| Error::Internal(format!("container entry {i}: {e}")))?;
        let name = entry.name().to_string();
        if is_rootfs_candidate(&name) {
            candidates.push(Candidate {
                name,
                size: entry.size(),
                nested_in: None,
            });
        } else if is_nested_container(&name) {
            nested.push(name);
        }
    }

    // appxbundles wrap per-architecture .appx files; descend one level when
    // the rootfs was not at the top.
    if candidates.is_empty() {
        for container_name in &nested {
            let inner_path = extract_zip_entry(&mut zip, container_name, workdir)?;
            let inner_file = fs::File::open(&inner_path)?;
            let mut inner_zip = zip::ZipArchive::new(io::BufReader::new(inner_file))
                .map_err(|e| Error::Internal(format!("nested container {container_name}: {e}")))?;
            for i in 0..inner_zip.len() {
                let entry = inner_zip
                    .by_index(i)
                    .map_err(|e| Error::Internal(format!("nested entry {i}: {e}")))?;
                let name = entry.name().to_string();
                if is_rootfs_candidate(&name) {
                    candidates.push(Candidate {
                        name,
                        size: entry.size(),
                        nested_in: Some(container_name.clone()),
                    });
                }
            }
        }
    }

    let chosen = pick_candidate(candidates).ok_or_else(|| {
        Error::ArchiveNoRootfs(
            input
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| input.display().to_string()),
        )
    })?;
    info!(
        "container {}: selected inner member {}{}",
        input.display(),
        chosen.name,
        chosen
            .nested_in
            .as_deref()
            .map(|n| format!(" (inside {n})"))
            .unwrap_or_default()
    );

    let extracted = match &chosen.nested_in {
        None => extract_zip_entry(&mut zip, &chosen.name, workdir)?,
        Some(container_name) => {
            let inner_path = workdir.join(sanitized_basename(container_name));
            let inner_file = fs::File::open(&inner_path)?;
            let mut inner_zip = zip::ZipArchive::new(io::BufReader::new(inner_file))
                .map_err(|e| Error::Internal(format!("nested container {container_name}: {e}")))?;
            extract_zip_entry(&mut inner_zip, &chosen.name, workdir)?
        }
    };

    let extension = sniff_format(&extracted)?.template_extension();
    let inner_member = match &chosen.nested_in {
        None => chosen.name.clone(),
        Some(container) => format!("{container}/{}", chosen.name),
    };

    Ok(NormalizedArchive {
        path: extracted,
        extension,
        inner_member: Some(inner_member),
    })
}

fn extract_zip_entry<R: Read + Seek>(
    zip: &mut zip::ZipArchive<R>,
    entry_name: &str,
    workdir: &Path,
) -> Result<PathBuf> {
    let mut entry = zip
        .by_name(entry_name)
        .map_err(|e| Error::Internal(format!("container member {entry_name}: {e}")))?;

    let out_path = workdir.join(sanitized_basename(entry_name));
    let mut out = fs::File::create(&out_path)?;
    io::copy(&mut entry, &mut out)?;
    Ok(out_path)
}

/// Flatten a zip entry name to a safe basename inside the workdir.
fn sanitized_basename(entry_name: &str) -> String {
    entry_name
        .rsplit(['/', '\\'])
        .next()
        .filter(|b| !b.is_empty() && *b != "." && *b != "..")
        .unwrap_or("member")
        .to_string()
}

fn read_up_to(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// A minimal tar holding one file.
    fn tar_bytes() -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let data = b"root filesystem contents";
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "etc/os-release", &data[..]).unwrap();
        builder.into_inner().unwrap()
    }

    fn tar_gz_bytes() -> Vec<u8> {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&tar_bytes()).unwrap();
        encoder.finish().unwrap()
    }

    fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(io::Cursor::new(Vec::new()));
        let options: zip::write::SimpleFileOptions = Default::default();
        for (name, data) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn write_temp(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn sniffs_all_magics() {
        let dir = tempfile::tempdir().unwrap();

        let zip = write_temp(dir.path(), "p.appxbundle", &zip_bytes(&[("a", b"x")]));
        assert_eq!(sniff_format(&zip).unwrap(), PackageFormat::Zip);

        let gz = write_temp(dir.path(), "p.tar.gz", &tar_gz_bytes());
        assert_eq!(sniff_format(&gz).unwrap(), PackageFormat::Gzip);

        let xz = write_temp(dir.path(), "p.tar.xz", &[0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00, 1, 2]);
        assert_eq!(sniff_format(&xz).unwrap(), PackageFormat::Xz);

        let tar = write_temp(dir.path(), "p.tar", &tar_bytes());
        assert_eq!(sniff_format(&tar).unwrap(), PackageFormat::Tar);

        // No recognizable magic falls back to raw tar.
        let raw = write_temp(dir.path(), "p.bin", b"??");
        assert_eq!(sniff_format(&raw).unwrap(), PackageFormat::Tar);
    }

    #[test]
    fn passthrough_formats_keep_their_path() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");

        let gz = write_temp(dir.path(), "d.tar.gz", &tar_gz_bytes());
        let normalized = normalize_to_tar(&gz, &work).unwrap();
        assert_eq!(normalized.path, gz);
        assert_eq!(normalized.extension, ".tar.gz");
        assert!(normalized.inner_member.is_none());

        let tar = write_temp(dir.path(), "d.tar", &tar_bytes());
        let normalized = normalize_to_tar(&tar, &work).unwrap();
        assert_eq!(normalized.extension, ".tar");
    }

    #[test]
    fn unwraps_zip_container_with_install_tar_gz() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        let bundle = zip_bytes(&[
            ("AppxManifest.xml", b"<xml/>"),
            ("install.tar.gz", &tar_gz_bytes()),
        ]);
        let pkg = write_temp(dir.path(), "distro.appxbundle", &bundle);

        let normalized = normalize_to_tar(&pkg, &work).unwrap();
        assert_eq!(normalized.extension, ".tar.gz");
        assert_eq!(normalized.inner_member.as_deref(), Some("install.tar.gz"));
        assert!(normalized.path.starts_with(&work));
        // The extracted member is itself gzip.
        assert_eq!(sniff_format(&normalized.path).unwrap(), PackageFormat::Gzip);
    }

    #[test]
    fn prefers_install_tar_gz_over_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        let big = vec![0u8; 4096];
        let bundle = zip_bytes(&[
            ("rootfs_arm64.tar.gz", &big),
            ("install.tar", &tar_bytes()),
            ("install.tar.gz", &tar_gz_bytes()),
        ]);
        let pkg = write_temp(dir.path(), "multi.appx", &bundle);

        let normalized = normalize_to_tar(&pkg, &work).unwrap();
        assert_eq!(normalized.inner_member.as_deref(), Some("install.tar.gz"));
    }

    #[test]
    fn falls_back_to_largest_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        let small = vec![1u8; 10];
        let large = vec![2u8; 1000];
        let bundle = zip_bytes(&[
            ("rootfs_x64.tar.xz", &large),
            ("rootfs_arm64.tar.xz", &small),
        ]);
        let pkg = write_temp(dir.path(), "arch.appx", &bundle);

        let normalized = normalize_to_tar(&pkg, &work).unwrap();
        assert_eq!(normalized.inner_member.as_deref(), Some("rootfs_x64.tar.xz"));
    }

    #[test]
    fn descends_into_nested_appx() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        let inner_appx = zip_bytes(&[
            ("AppxManifest.xml", b"<xml/>"),
            ("install.tar.gz", &tar_gz_bytes()),
        ]);
        let bundle = zip_bytes(&[
            ("AppxMetadata/bundle.xml", b"<xml/>"),
            ("distro_x64.appx", &inner_appx),
        ]);
        let pkg = write_temp(dir.path(), "nested.appxbundle", &bundle);

        let normalized = normalize_to_tar(&pkg, &work).unwrap();
        assert_eq!(
            normalized.inner_member.as_deref(),
            Some("distro_x64.appx/install.tar.gz")
        );
        assert_eq!(normalized.extension, ".tar.gz");
    }

    #[test]
    fn container_without_rootfs_fails() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        let bundle = zip_bytes(&[("readme.txt", b"no tar here")]);
        let pkg = write_temp(dir.path(), "empty.appx", &bundle);

        let err = normalize_to_tar(&pkg, &work).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ArchiveNoRootfs);
    }

    #[test]
    fn candidate_matcher_rules() {
        assert!(is_rootfs_candidate("install.tar.gz"));
        assert!(is_rootfs_candidate("x64/install_amd64.tar"));
        assert!(is_rootfs_candidate("rootfs-2024.tar.xz"));
        assert!(!is_rootfs_candidate("AppxManifest.xml"));
        assert!(!is_rootfs_candidate("installer.exe"));
        assert!(!is_rootfs_candidate("tarball-notes.txt"));
    }

    #[test]
    fn verify_accepts_real_templates_and_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();

        let tar = write_temp(dir.path(), "good.tar", &tar_bytes());
        assert!(verify_tar_template(&tar).is_ok());

        let gz = write_temp(dir.path(), "good.tar.gz", &tar_gz_bytes());
        assert!(verify_tar_template(&gz).is_ok());

        let empty = write_temp(dir.path(), "empty.tar", &[]);
        assert!(verify_tar_template(&empty).is_err());
    }
}
