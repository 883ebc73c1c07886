//! Terminal-profile projection
//!
//! Derives launch-profile descriptors from the enabled subset of images and
//! publishes them through a sink. The projector is idempotent: publishing an
//! unchanged set writes nothing, and it only ever touches the profile
//! document it owns, so removing an image removes exactly its profile and
//! nothing else.

use std::path::PathBuf;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::index::{Image, Scope};
use crate::store::{read_json, write_json_atomic};

/// One launch profile. `argv` is a ready-to-spawn argument vector; no shell
/// string is ever published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalProfile {
    pub id: String,
    pub label: String,
    pub argv: Vec<String>,
    pub enabled: bool,
    pub scope: Scope,
}

impl TerminalProfile {
    fn for_image(image: &Image) -> Self {
        Self {
            id: format!("wsl-manager.{}", image.name),
            label: image.display_name.clone(),
            argv: vec!["wsl".to_string(), "-d".to_string(), image.name.clone()],
            enabled: true,
            scope: image.scope.clone(),
        }
    }
}

/// Where profiles get published. The file sink is the default; the editor
/// layer can substitute its own.
pub trait ProfileSink: Send + Sync {
    fn read_current(&self) -> Result<Vec<TerminalProfile>>;
    fn publish(&self, profiles: &[TerminalProfile]) -> Result<()>;
}

/// Publishes profiles as a JSON fragment document owned by the manager.
pub struct FileProfileSink {
    path: PathBuf,
}

impl FileProfileSink {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ProfileFragment {
    profiles: Vec<TerminalProfile>,
}

impl ProfileSink for FileProfileSink {
    fn read_current(&self) -> Result<Vec<TerminalProfile>> {
        Ok(read_json::<ProfileFragment>(&self.path)?
            .map(|f| f.profiles)
            .unwrap_or_default())
    }

    fn publish(&self, profiles: &[TerminalProfile]) -> Result<()> {
        write_json_atomic(
            &self.path,
            &ProfileFragment {
                profiles: profiles.to_vec(),
            },
        )
    }
}

/// Outcome of one projection pass.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ProjectionOutcome {
    pub added: usize,
    pub removed: usize,
    pub unchanged: bool,
}

/// The projector itself.
pub struct Projector {
    sink: Box<dyn ProfileSink>,
}

impl Projector {
    pub fn new(sink: Box<dyn ProfileSink>) -> Self {
        Self { sink }
    }

    /// Compute the deterministic profile set for `images` and publish it if
    /// it differs from what is currently published.
    pub fn project(&self, images: &[Image]) -> Result<ProjectionOutcome> {
        let mut desired: Vec<TerminalProfile> = images
            .iter()
            .filter(|image| image.enabled)
            .map(TerminalProfile::for_image)
            .collect();
        desired.sort_by(|a, b| a.id.cmp(&b.id));

        let current = self.sink.read_current()?;
        if current == desired {
            debug!("terminal profiles unchanged ({} entries)", desired.len());
            return Ok(ProjectionOutcome {
                added: 0,
                removed: 0,
                unchanged: true,
            });
        }

        let added = desired
            .iter()
            .filter(|p| !current.iter().any(|c| c.id == p.id))
            .count();
        let removed = current
            .iter()
            .filter(|c| !desired.iter().any(|p| p.id == c.id))
            .count();

        self.sink.publish(&desired)?;
        info!(
            "terminal profiles published: {} total (+{added}, -{removed})",
            desired.len()
        );
        Ok(ProjectionOutcome {
            added,
            removed,
            unchanged: false,
        })
    }

    /// The currently published set.
    pub fn current(&self) -> Result<Vec<TerminalProfile>> {
        self.sink.read_current()
    }
}
