//! Unified error handling
//!
//! One error type for the whole manager, carrying the failure taxonomy that
//! the CLI front-end maps to exit codes. Classifier helpers fold raw
//! subprocess and HTTP failures into the taxonomy; user-visible messages go
//! through `validation::sanitize_for_display` before leaving this module.

use thiserror::Error;

use crate::constants::STDERR_TAIL_LIMIT;
use crate::validation::sanitize_for_display;

/// Structured detail for a failed subprocess invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandDetail {
    pub program: String,
    pub argv: Vec<String>,
    pub exit_code: Option<i32>,
    /// Last 4 KiB of stderr, sanitized for display.
    pub stderr_tail: String,
}

impl std::fmt::Display for CommandDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {:?} exited with {:?}: {}",
            self.program, self.argv, self.exit_code, self.stderr_tail
        )
    }
}

/// Application-wide error type, one variant per taxonomy kind.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("WSL is not installed or not on PATH: {0}")]
    HostSubsystemMissing(String),

    #[error("Image not found: {0}")]
    ImageNotFound(String),

    #[error("Image already exists: {0}")]
    ImageExists(String),

    #[error("Unknown distribution: {0}")]
    DistroUnknown(String),

    #[error("Distribution not available locally: {0}")]
    DistroUnavailable(String),

    #[error("Source unavailable: {url} (status {status:?})")]
    SourceUnavailable { url: String, status: Option<u16> },

    #[error("Network error: {0}")]
    TransientNetwork(String),

    #[error("Integrity check failed: expected sha256 {expected}, got {actual}")]
    IntegrityFailed { expected: String, actual: String },

    #[error("No rootfs tar found inside archive: {0}")]
    ArchiveNoRootfs(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Command failed: {0}")]
    Command(CommandDetail),
}

/// Taxonomy kinds, used for exit-code mapping and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    HostSubsystemMissing,
    ImageNotFound,
    ImageExists,
    DistroUnknown,
    DistroUnavailable,
    SourceUnavailable,
    TransientNetwork,
    IntegrityFailed,
    ArchiveNoRootfs,
    Timeout,
    Cancelled,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::HostSubsystemMissing(_) => ErrorKind::HostSubsystemMissing,
            Error::ImageNotFound(_) => ErrorKind::ImageNotFound,
            Error::ImageExists(_) => ErrorKind::ImageExists,
            Error::DistroUnknown(_) => ErrorKind::DistroUnknown,
            Error::DistroUnavailable(_) => ErrorKind::DistroUnavailable,
            Error::SourceUnavailable { .. } => ErrorKind::SourceUnavailable,
            Error::TransientNetwork(_) => ErrorKind::TransientNetwork,
            Error::IntegrityFailed { .. } => ErrorKind::IntegrityFailed,
            Error::ArchiveNoRootfs(_) => ErrorKind::ArchiveNoRootfs,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Internal(_) => ErrorKind::Internal,
            Error::Command(_) => ErrorKind::Internal,
        }
    }

    /// Exit code contract for the CLI front-end.
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::Validation => 1,
            ErrorKind::ImageNotFound | ErrorKind::DistroUnknown | ErrorKind::DistroUnavailable => 2,
            ErrorKind::SourceUnavailable => 3,
            ErrorKind::IntegrityFailed | ErrorKind::ArchiveNoRootfs => 4,
            ErrorKind::HostSubsystemMissing => 5,
            ErrorKind::TransientNetwork | ErrorKind::Timeout => 6,
            ErrorKind::Cancelled => 7,
            ErrorKind::ImageExists | ErrorKind::Internal => 1,
        }
    }

    /// Retryable kinds are retried by the downloader with back-off; everything
    /// else escalates immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::TransientNetwork | ErrorKind::Timeout)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<crate::validation::ValidationError> for Error {
    fn from(error: crate::validation::ValidationError) -> Self {
        Error::Validation(error.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Internal(format!("I/O error: {error}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Internal(format!("JSON error: {error}"))
    }
}

// ==================== Classifiers ====================

/// Fold a non-zero WSL CLI exit into the taxonomy using its stderr.
///
/// The WSL CLI localizes some messages, so matching is best-effort on the
/// English phrasings; anything unrecognized stays a structured command error.
pub fn classify_wsl_failure(
    program: &str,
    argv: &[String],
    exit_code: Option<i32>,
    stderr: &str,
) -> Error {
    let tail = stderr_tail(stderr);
    let lower = tail.to_lowercase();

    if lower.contains("is not recognized")
        || lower.contains("cannot find")
        || lower.contains("no such file")
        || lower.contains("system cannot find")
    {
        return Error::HostSubsystemMissing(tail);
    }

    let is_unregister = argv.iter().any(|a| a == "--unregister");
    if is_unregister && (lower.contains("not found") || lower.contains("there is no distribution")) {
        let name = argv
            .iter()
            .skip_while(|a| *a != "--unregister")
            .nth(1)
            .cloned()
            .unwrap_or_default();
        return Error::ImageNotFound(name);
    }

    let is_import = argv.iter().any(|a| a == "--import");
    if is_import && lower.contains("already exists") {
        let name = argv
            .iter()
            .skip_while(|a| *a != "--import")
            .nth(1)
            .cloned()
            .unwrap_or_default();
        return Error::ImageExists(name);
    }

    Error::Command(CommandDetail {
        program: program.to_string(),
        argv: argv.to_vec(),
        exit_code,
        stderr_tail: tail,
    })
}

/// Fold an HTTP status or transport failure into the taxonomy.
pub fn classify_http_status(url: &str, status: u16) -> Error {
    if (400..500).contains(&status) {
        Error::SourceUnavailable {
            url: url.to_string(),
            status: Some(status),
        }
    } else {
        Error::TransientNetwork(format!("{url} returned status {status}"))
    }
}

pub fn classify_http_transport(url: &str, error: &reqwest::Error) -> Error {
    if error.is_timeout() {
        Error::Timeout(format!("request to {url} timed out"))
    } else {
        Error::TransientNetwork(sanitize_for_display(&error.to_string()))
    }
}

fn stderr_tail(stderr: &str) -> String {
    let sanitized = sanitize_for_display(stderr.trim());
    if sanitized.len() <= STDERR_TAIL_LIMIT {
        return sanitized;
    }
    let mut start = sanitized.len() - STDERR_TAIL_LIMIT;
    while !sanitized.is_char_boundary(start) {
        start += 1;
    }
    sanitized[start..].to_string()
}
