use crate::{write_atomic, OriginKind, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Version of the metadata document layout.
pub const METADATA_FORMAT_VERSION: u32 = 1;

/// Owner-only: the document reveals where an origin's data lives.
const METADATA_MODE: u32 = 0o600;

/// Metadata document written next to every origin's backing path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginMetadata {
    /// Identifier of the tool that created the origin.
    pub creator_tag: String,
    /// Layout version of this document.
    pub format_version: u32,
    /// Registered origin name.
    pub origin_name: String,
    /// Absolute backing path of the origin.
    pub backing_path: PathBuf,
    /// Origin type at creation time.
    pub kind: OriginKind,
}

impl OriginMetadata {
    /// Build a metadata document for a freshly created origin.
    pub fn new(creator_tag: &str, origin_name: &str, backing_path: &Path, kind: OriginKind) -> Self {
        Self {
            creator_tag: creator_tag.to_string(),
            format_version: METADATA_FORMAT_VERSION,
            origin_name: origin_name.to_string(),
            backing_path: backing_path.to_path_buf(),
            kind,
        }
    }

    /// Location of the metadata document for a backing path.
    ///
    /// The document is a hidden sibling (`.<name>.origin.json`) so it never
    /// shows up inside a mounted directory origin.
    pub fn path_for(backing_path: &Path) -> PathBuf {
        let name = backing_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let file_name = format!(".{}.origin.json", name);
        match backing_path.parent() {
            Some(parent) => parent.join(file_name),
            None => PathBuf::from(file_name),
        }
    }

    /// Persist the document next to its backing path.
    pub fn write(&self) -> Result<PathBuf> {
        let path = Self::path_for(&self.backing_path);
        let data = serde_json::to_vec_pretty(self)?;
        write_atomic(&path, &data, Some(METADATA_MODE))?;
        Ok(path)
    }

    /// Read the metadata document of a backing path.
    pub fn read(backing_path: &Path) -> Result<Self> {
        let data = fs::read(Self::path_for(backing_path))?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Remove the metadata document of a backing path if present.
    pub fn remove(backing_path: &Path) -> Result<()> {
        match fs::remove_file(Self::path_for(backing_path)) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}
