//! Provenance manifests
//!
//! Every managed image carries a JSON document at a fixed in-image path
//! recording where it came from: its source, its ancestor images (lineage),
//! and an append-only list of provenance layers. Reads and writes go through
//! the WSL executor as in-guest shell one-liners, never through host-side
//! UNC paths. Serialization is canonical: UTF-8, sorted keys, LF endings.
//! Unknown fields survive a read-modify-write round trip.

use std::sync::Arc;

use chrono::Utc;
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::constants::{MANIFEST_PATH, TOOL_ID};
use crate::error::{Error, Result};
use crate::wsl::executor::WslCommandExecutor;

/// Current manifest schema version.
pub const MANIFEST_VERSION: u32 = 1;

/// Where an image's content came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    Distro,
    Image,
    ImportedTar,
    Legacy,
}

/// Provenance event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LayerKind {
    Distro,
    Clone,
    Environment,
    BootstrapScript,
    Settings,
    Custom,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestSource {
    pub kind: SourceKind,
    #[serde(rename = "ref")]
    pub reference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    /// Auditing detail, e.g. the container member a template was unwrapped
    /// from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// One ancestor image, root-most first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageEntry {
    pub id: String,
    pub name: String,
    pub kind: SourceKind,
    pub at: String,
}

/// One provenance event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    pub kind: LayerKind,
    pub id: String,
    pub at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

/// The in-image provenance document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub manifest_version: u32,
    pub image_id: String,
    pub image_name: String,
    pub created_at: String,
    pub created_by: String,
    pub source: ManifestSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub lineage: Vec<LineageEntry>,
    #[serde(default)]
    pub layers: Vec<Layer>,
    /// Fields written by a newer tool version; preserved on round-trip.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn new_image_id() -> String {
    Uuid::new_v4().to_string()
}

/// Build the manifest for an image freshly imported from a distro template
/// or a user-supplied tar. Lineage starts empty; the single layer records the
/// initial import.
pub fn build_for_new_image(image_name: &str, source: ManifestSource) -> Manifest {
    let at = now();
    let mut detail = serde_json::Map::new();
    detail.insert("name".to_string(), Value::String(source.reference.clone()));
    if let Some(digest) = &source.digest {
        detail.insert("digest".to_string(), Value::String(digest.clone()));
    }
    if let Some(member) = &source.detail {
        detail.insert("member".to_string(), Value::String(member.clone()));
    }

    let image_id = new_image_id();
    Manifest {
        manifest_version: MANIFEST_VERSION,
        image_id: image_id.clone(),
        image_name: image_name.to_string(),
        created_at: at.clone(),
        created_by: TOOL_ID.to_string(),
        source,
        parent_id: None,
        lineage: Vec::new(),
        layers: vec![Layer {
            kind: LayerKind::Distro,
            id: image_id,
            at,
            detail: Some(Value::Object(detail)),
        }],
        extra: serde_json::Map::new(),
    }
}

/// Build the manifest for a clone: the parent's lineage plus the parent
/// itself, the parent's layers plus a CLONE layer pointing back at it.
pub fn build_for_clone(image_name: &str, parent: &Manifest) -> Manifest {
    let at = now();

    let mut lineage = parent.lineage.clone();
    lineage.push(LineageEntry {
        id: parent.image_id.clone(),
        name: parent.image_name.clone(),
        kind: SourceKind::Image,
        at: at.clone(),
    });

    let mut layers = parent.layers.clone();
    layers.push(Layer {
        kind: LayerKind::Clone,
        id: parent.image_id.clone(),
        at: at.clone(),
        detail: Some(serde_json::json!({ "parent": parent.image_name })),
    });

    Manifest {
        manifest_version: MANIFEST_VERSION,
        image_id: new_image_id(),
        image_name: image_name.to_string(),
        created_at: at,
        created_by: TOOL_ID.to_string(),
        source: ManifestSource {
            kind: SourceKind::Image,
            reference: parent.image_name.clone(),
            digest: None,
            detail: None,
        },
        parent_id: Some(parent.image_id.clone()),
        lineage,
        layers,
        extra: serde_json::Map::new(),
    }
}

/// Canonical bytes: sorted keys (serde_json maps are ordered), LF endings,
/// trailing newline.
pub fn to_canonical_json(manifest: &Manifest) -> Result<Vec<u8>> {
    let value = serde_json::to_value(manifest)?;
    let mut text = serde_json::to_string_pretty(&value)?;
    text.push('\n');
    Ok(text.into_bytes())
}

/// Engine reading and writing manifests inside images.
pub struct ManifestEngine {
    executor: Arc<dyn WslCommandExecutor>,
}

impl ManifestEngine {
    pub fn new(executor: Arc<dyn WslCommandExecutor>) -> Self {
        Self { executor }
    }

    /// Write the manifest into the image, as root, via stdin.
    pub fn write_into(&self, image_name: &str, manifest: &Manifest) -> Result<()> {
        let bytes = to_canonical_json(manifest)?;
        let path = shell_escape::unix::escape(MANIFEST_PATH.into());
        self.executor
            .exec_in_with_stdin(image_name, Some("root"), &format!("cat > {path}"), &bytes)?
            .into_result()?;
        Ok(())
    }

    /// Read the manifest, or `None` when the image has none (legacy images).
    ///
    /// Presence is probed with a fixed-sentinel `test -f` so the answer does
    /// not depend on host-side path translation.
    pub fn read_from(&self, image_name: &str) -> Result<Option<Manifest>> {
        let path = shell_escape::unix::escape(MANIFEST_PATH.into());
        let probe = self
            .executor
            .exec_in(
                image_name,
                Some("root"),
                &format!("test -f {path} && echo EXISTS || echo NOT_FOUND"),
            )?
            .into_result()?;

        match probe.stdout.trim() {
            "NOT_FOUND" => return Ok(None),
            "EXISTS" => {}
            other => {
                return Err(Error::Internal(format!(
                    "unexpected manifest probe output: {other}"
                )))
            }
        }

        let read = self
            .executor
            .exec_in(image_name, Some("root"), &format!("cat {path}"))?
            .into_result()?;

        let manifest: Manifest = serde_json::from_str(&read.stdout)
            .map_err(|e| Error::Internal(format!("manifest in {image_name} is malformed: {e}")))?;
        if manifest.manifest_version > MANIFEST_VERSION {
            warn!(
                "manifest in {image_name} has version {} (newer than {MANIFEST_VERSION})",
                manifest.manifest_version
            );
        }
        Ok(Some(manifest))
    }

    /// Append one provenance layer (read-modify-write).
    pub fn append_layer(&self, image_name: &str, layer: Layer) -> Result<()> {
        let mut manifest = self.read_from(image_name)?.ok_or_else(|| {
            Error::Internal(format!("image {image_name} has no manifest to append to"))
        })?;
        manifest.layers.push(layer);
        self.write_into(image_name, &manifest)
    }
}
