//! The seam between origin orchestration and the filesystem that serves a mount.
//!
//! A [`FilesystemProvider`] binds a source directory to a mount point and
//! returns an [`AttachedFilesystem`] that serves requests until it is
//! detached in-process or the kernel ends the session.

use log::{debug, warn};
use origin_format::OriginKind;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// This build carries no filesystem provider.
    #[error("no filesystem provider available (built without the `fuse` feature)")]
    Unsupported,

    /// The provider could not bind to the mount point.
    #[error("failed to attach {} at {}: {reason}", .source_path.display(), .mount_point.display())]
    AttachFailed {
        source_path: std::path::PathBuf,
        mount_point: std::path::PathBuf,
        reason: String,
    },

    /// The OS refused to detach the mount point.
    #[error("failed to detach {}: {reason}", .mount_point.display())]
    DetachFailed {
        mount_point: std::path::PathBuf,
        reason: String,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Builds filesystems that serve an origin's contents at a mount point.
pub trait FilesystemProvider: Send + Sync {
    /// Serve `source` at `mount_point`.
    ///
    /// `source` is the backing directory for directory origins, the staging
    /// directory for lazy archives and the archive file for read-only archives.
    fn attach(
        &self,
        source: &Path,
        kind: OriginKind,
        mount_point: &Path,
    ) -> Result<Box<dyn AttachedFilesystem>, ProviderError>;
}

/// A filesystem currently bound to a mount point.
pub trait AttachedFilesystem {
    /// `false` once the session has ended, e.g. after an external unmount.
    fn is_attached(&self) -> bool;

    /// Detach from the mount point and stop serving.
    fn detach(self: Box<Self>) -> io::Result<()>;
}

/// Provider used when no real filesystem backend is compiled in.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedProvider;

impl FilesystemProvider for UnsupportedProvider {
    fn attach(
        &self,
        _source: &Path,
        _kind: OriginKind,
        _mount_point: &Path,
    ) -> Result<Box<dyn AttachedFilesystem>, ProviderError> {
        Err(ProviderError::Unsupported)
    }
}

/// The provider this build should use for real mounts.
pub fn default_provider() -> Arc<dyn FilesystemProvider> {
    #[cfg(feature = "fuse")]
    {
        Arc::new(crate::fuse::FuseProvider::default())
    }
    #[cfg(not(feature = "fuse"))]
    {
        Arc::new(UnsupportedProvider)
    }
}

/// Whether something is mounted at `path`.
///
/// A mount point lives on a different device than its parent. A path that
/// cannot be inspected at all (for example a FUSE endpoint whose server died)
/// is reported as mounted so that it still gets detached.
pub fn is_mount_point(path: &Path) -> bool {
    let meta = match path.metadata() {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return false,
        Err(_) => return true,
    };
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => return false,
    };
    match parent.metadata() {
        Ok(parent_meta) => parent_meta.dev() != meta.dev(),
        Err(_) => false,
    }
}

/// Ask the OS to detach `mount_point`, falling back to a lazy detach.
///
/// Returns `Ok(false)` when nothing was mounted there (already detached).
pub fn os_detach(mount_point: &Path) -> Result<bool, ProviderError> {
    if !is_mount_point(mount_point) {
        debug!("{} is not mounted; nothing to detach", mount_point.display());
        return Ok(false);
    }

    let (primary, fallback) = detach_commands(mount_point);
    if run(&primary)? {
        return Ok(true);
    }

    warn!(
        "Detach of {} failed, attempting lazy detach",
        mount_point.display()
    );
    if run(&fallback)? || !is_mount_point(mount_point) {
        return Ok(true);
    }

    Err(ProviderError::DetachFailed {
        mount_point: mount_point.to_path_buf(),
        reason: format!("`{}` and `{}` both failed", primary.join(" "), fallback.join(" ")),
    })
}

fn run(argv: &[String]) -> Result<bool, ProviderError> {
    debug!("Running {}", argv.join(" "));
    match Command::new(&argv[0]).args(&argv[1..]).status() {
        Ok(status) => Ok(status.success()),
        // The tool is missing entirely; let the fallback have a go.
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            warn!("{} not found", argv[0]);
            Ok(false)
        }
        Err(e) => Err(ProviderError::Io(e)),
    }
}

fn detach_commands(mount_point: &Path) -> (Vec<String>, Vec<String>) {
    let target = mount_point.to_string_lossy().to_string();

    #[cfg(target_os = "macos")]
    {
        (
            vec!["umount".to_string(), target.clone()],
            vec![
                "diskutil".to_string(),
                "unmount".to_string(),
                "force".to_string(),
                target,
            ],
        )
    }

    #[cfg(not(target_os = "macos"))]
    {
        (
            vec!["fusermount".to_string(), "-u".to_string(), target.clone()],
            vec!["fusermount".to_string(), "-uz".to_string(), target],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_plain_directory_is_not_a_mount_point() {
        let dir = tempdir().unwrap();
        let child = dir.path().join("mnt");
        std::fs::create_dir(&child).unwrap();
        assert!(!is_mount_point(&child));
        assert!(!is_mount_point(&dir.path().join("missing")));
    }

    #[test]
    fn test_detach_of_unmounted_path_is_a_no_op() {
        let dir = tempdir().unwrap();
        assert!(!os_detach(dir.path()).unwrap());
    }

    #[test]
    fn test_unsupported_provider_refuses() {
        let dir = tempdir().unwrap();
        let result = UnsupportedProvider.attach(dir.path(), OriginKind::Directory, dir.path());
        assert!(matches!(result, Err(ProviderError::Unsupported)));
    }
}
