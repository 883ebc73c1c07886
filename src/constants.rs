//! Application constants
//!
//! Centralizes hardcoded values for easier maintenance.

use std::time::Duration;

// ==================== Application Metadata ====================

/// Tool identifier, recorded as `created_by` in image manifests.
pub const TOOL_ID: &str = "vscode-wsl-manager";

/// Store directory name under the user profile.
pub const STORE_DIR_NAME: &str = ".vscode-wsl-manager";

/// User-Agent for all HTTP requests.
pub const USER_AGENT: &str = "vscode-wsl-manager/0.1";

// ==================== In-image Paths ====================

/// Fixed path of the provenance manifest inside every managed image.
pub const MANIFEST_PATH: &str = "/etc/vscode-wsl-manager.json";

// ==================== Upstream Registry ====================

/// Microsoft's distribution registry, the upstream source of the catalog.
pub const REGISTRY_URL: &str =
    "https://raw.githubusercontent.com/microsoft/WSL/master/distributions/DistributionInfo.json";

/// Catalog cache lifetime before a non-forced refresh goes upstream.
pub const CATALOG_TTL: Duration = Duration::from_secs(24 * 60 * 60);

// ==================== Timeouts ====================

/// Short WSL commands (`--list`, `--unregister`, in-guest probes).
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// `--import` and `--export` move whole filesystems.
pub const IMPORT_EXPORT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// HEAD size probe; a failure here never blocks the download itself.
pub const HEAD_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum redirect hops followed by the downloader.
pub const MAX_REDIRECTS: usize = 10;

/// Download retry defaults: exponential back-off starting at 1 s.
pub const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Stderr carried on subprocess errors is capped to this many bytes.
pub const STDERR_TAIL_LIMIT: usize = 4096;
