//! Input validation
//!
//! Every externally supplied name and filesystem path passes through here
//! before it can reach a subprocess argument or a file API. Names failing
//! validation never spawn anything.

use std::path::{Component, Path, PathBuf};

use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

/// Validation error types
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("required value missing: {0}")]
    Missing(String),
}

lazy_static! {
    static ref NAME_RE: Regex = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]{0,63}$").unwrap();
}

const WINDOWS_DEVICE_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

const SHELL_METACHARACTERS: &[char] =
    &[';', '&', '|', '`', '$', '(', ')', '<', '>', '\'', '"'];

/// A validated identifier, safe to pass as a subprocess argument.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Name(String);

impl Name {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Name {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Name {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Validate a distro or image name.
///
/// Rule: `^[A-Za-z0-9][A-Za-z0-9_.-]{0,63}$`, and never a Windows reserved
/// device name.
pub fn validate_name(s: &str) -> Result<Name, ValidationError> {
    if s.is_empty() {
        return Err(ValidationError::Missing("name".into()));
    }

    if !NAME_RE.is_match(s) {
        return Err(ValidationError::InvalidName(format!(
            "'{}' must start with a letter or digit and contain only letters, digits, '_', '.', '-' (max 64 chars)",
            sanitize_for_display(s)
        )));
    }

    if is_windows_device_name(s) {
        return Err(ValidationError::InvalidName(format!(
            "'{s}' is a reserved Windows device name"
        )));
    }

    Ok(Name(s.to_string()))
}

/// Validate a tar file path supplied by the user (import/export targets).
pub fn validate_tar_path(s: &str, must_exist: bool) -> Result<PathBuf, ValidationError> {
    let path = validate_path_text(s)?;

    let lower = s.to_lowercase();
    if !(lower.ends_with(".tar")
        || lower.ends_with(".tar.gz")
        || lower.ends_with(".tgz")
        || lower.ends_with(".tar.xz"))
    {
        return Err(ValidationError::InvalidPath(format!(
            "'{}' does not look like a tar archive (.tar, .tar.gz, .tgz, .tar.xz)",
            sanitize_for_display(s)
        )));
    }

    if must_exist {
        path.canonicalize()
            .map_err(|_| ValidationError::InvalidPath(format!("'{}' does not exist", sanitize_for_display(s))))
    } else {
        Ok(path)
    }
}

/// Validate a directory path; optionally create it.
pub fn validate_dir_path(s: &str, create_if_missing: bool) -> Result<PathBuf, ValidationError> {
    let path = validate_path_text(s)?;

    if create_if_missing {
        std::fs::create_dir_all(&path).map_err(|e| {
            ValidationError::InvalidPath(format!(
                "cannot create '{}': {e}",
                sanitize_for_display(s)
            ))
        })?;
    } else if !path.is_dir() {
        return Err(ValidationError::InvalidPath(format!(
            "'{}' is not a directory",
            sanitize_for_display(s)
        )));
    }

    Ok(path)
}

/// Require `path` to stay inside `root` after canonicalization.
pub fn ensure_within(path: &Path, root: &Path) -> Result<(), ValidationError> {
    let canonical = path
        .canonicalize()
        .map_err(|_| ValidationError::InvalidPath(format!("{} does not exist", path.display())))?;
    let canonical_root = root
        .canonicalize()
        .map_err(|_| ValidationError::InvalidPath(format!("{} does not exist", root.display())))?;

    if canonical.starts_with(&canonical_root) {
        Ok(())
    } else {
        Err(ValidationError::InvalidPath(format!(
            "{} escapes {}",
            canonical.display(),
            canonical_root.display()
        )))
    }
}

/// Strip control characters and collapse line terminators so raw subprocess
/// or HTTP output is safe to show in a terminal message.
pub fn sanitize_for_display(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn validate_path_text(s: &str) -> Result<PathBuf, ValidationError> {
    if s.is_empty() {
        return Err(ValidationError::Missing("path".into()));
    }

    if s.contains('\0') {
        return Err(ValidationError::InvalidPath("path contains NUL".into()));
    }

    if s.contains('\n') || s.contains('\r') {
        return Err(ValidationError::InvalidPath(
            "path contains line terminators".into(),
        ));
    }

    if s.chars().any(|c| SHELL_METACHARACTERS.contains(&c)) {
        return Err(ValidationError::InvalidPath(format!(
            "'{}' contains shell metacharacters",
            sanitize_for_display(s)
        )));
    }

    // URI schemes are not filesystem paths; a lone drive-letter colon is.
    if let Some(idx) = s.find("://") {
        if idx > 1 {
            return Err(ValidationError::InvalidPath(format!(
                "'{}' looks like a URI, not a path",
                sanitize_for_display(s)
            )));
        }
    }

    let path = PathBuf::from(s);

    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(ValidationError::InvalidPath(
                    "path contains a '..' component".into(),
                ));
            }
            Component::Normal(part) => {
                let part = part.to_string_lossy();
                if is_windows_device_name(&part) {
                    return Err(ValidationError::InvalidPath(format!(
                        "'{part}' is a reserved Windows device name"
                    )));
                }
            }
            _ => {}
        }
    }

    Ok(path)
}

/// Device-name check on a single component, extension-insensitive
/// (`CON.txt` is still `CON` to Windows).
fn is_windows_device_name(component: &str) -> bool {
    let stem = component.split('.').next().unwrap_or(component);
    let upper = stem.trim().to_uppercase();
    WINDOWS_DEVICE_NAMES.contains(&upper.as_str())
}
