use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// File-name prefix that marks an archive as a read-only origin.
pub const READ_ONLY_PREFIX: &str = "ro_";

/// Prefix of every mount key.
const MOUNT_KEY_PREFIX: &str = "_mount";

/// How an origin's backing path is served when mounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OriginKind {
    /// A plain directory, served in place.
    Directory,
    /// A read-only archive, served as-is and never rewritten.
    Archive,
    /// An archive unpacked to a staging directory on mount and repacked on unmount.
    LazyArchive,
}

impl OriginKind {
    /// Whether the backing path of this kind is an archive file.
    pub fn is_archive(self) -> bool {
        matches!(self, OriginKind::Archive | OriginKind::LazyArchive)
    }
}

impl fmt::Display for OriginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OriginKind::Directory => "directory",
            OriginKind::Archive => "archive",
            OriginKind::LazyArchive => "lazy_archive",
        };
        f.write_str(s)
    }
}

/// Container format of an archive-backed origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    Tar,
    TarGz,
    TarBz2,
}

impl ArchiveFormat {
    // Longest suffixes first so `.tar.gz` never matches as `.tar`.
    const SUFFIXES: [(&'static str, ArchiveFormat); 4] = [
        (".tar.gz", ArchiveFormat::TarGz),
        (".tar.bz2", ArchiveFormat::TarBz2),
        (".zip", ArchiveFormat::Zip),
        (".tar", ArchiveFormat::Tar),
    ];

    /// Detect the archive format from a path's file name.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Option<Self> {
        let name = path.as_ref().file_name()?.to_string_lossy().to_lowercase();
        Self::SUFFIXES
            .iter()
            .find(|(suffix, _)| name.len() > suffix.len() && name.ends_with(suffix))
            .map(|(_, format)| *format)
    }

    /// The canonical file-name suffix, including the leading dot.
    pub fn suffix(self) -> &'static str {
        match self {
            ArchiveFormat::Zip => ".zip",
            ArchiveFormat::Tar => ".tar",
            ArchiveFormat::TarGz => ".tar.gz",
            ArchiveFormat::TarBz2 => ".tar.bz2",
        }
    }
}

/// Classify a path as a directory, read-only archive or lazy archive.
///
/// A path that does not exist yet is optimistically reported as
/// [`OriginKind::Directory`]; only callers about to create it should accept
/// that answer.
pub fn classify<P: AsRef<Path>>(path: P) -> Result<OriginKind> {
    let path = path.as_ref();

    if ArchiveFormat::from_path(path).is_some() {
        let read_only = path
            .file_name()
            .map(|name| name.to_string_lossy().starts_with(READ_ONLY_PREFIX))
            .unwrap_or(false);
        return Ok(if read_only {
            OriginKind::Archive
        } else {
            OriginKind::LazyArchive
        });
    }

    if let Some(ext) = path.extension() {
        return Err(Error::UnsupportedExtension(ext.to_string_lossy().to_string()));
    }

    match path.metadata() {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(OriginKind::Directory),
        Err(e) => Err(Error::IoError(e)),
        Ok(meta) if meta.is_dir() => Ok(OriginKind::Directory),
        Ok(_) => Err(Error::NotAFilesystem(path.to_path_buf())),
    }
}

/// Derive the mount key for an origin name.
///
/// The extension separator is normalized so `photos.zip` and its mount key
/// never look like a file name. Every site that correlates an origin with its
/// mount goes through this function.
pub fn mount_key_for(name: &str) -> String {
    format!("{}{}", MOUNT_KEY_PREFIX, name.replace('.', "_"))
}
