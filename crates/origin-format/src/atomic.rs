use crate::{Error, Result};
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use tempfile::NamedTempFile;

/// Write `contents` to `path` so readers only ever see the old or the new document.
///
/// The bytes go to a temporary file in the same directory, are flushed to
/// disk and then renamed over `path`. When `mode` is given the temporary file
/// gets those permission bits before it becomes visible.
pub fn write_atomic<P: AsRef<Path>>(path: P, contents: &[u8], mode: Option<u32>) -> Result<()> {
    let path = path.as_ref();
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let mut temp = tempfile::Builder::new()
        .prefix(".tmp.origin-")
        .tempfile_in(parent)?;
    if let Some(mode) = mode {
        temp.as_file()
            .set_permissions(fs::Permissions::from_mode(mode))?;
    }
    temp.write_all(contents)?;
    temp.as_file().sync_all()?;

    persist_tempfile(temp, path)
}

pub(crate) fn persist_tempfile(temp: NamedTempFile, final_path: &Path) -> Result<()> {
    temp.persist(final_path)
        .map(|_| ())
        .map_err(|err| Error::IoError(err.error))
}

/// Validate a path that must stay beneath some root.
///
/// Leading slashes are rejected rather than stripped: names are always relative
/// to the root they are resolved against.
pub fn normalize_relative_path(path: &str) -> Result<PathBuf> {
    if path.is_empty() {
        return Err(Error::InvalidPath(path.to_string()));
    }

    let rel = Path::new(path);
    let mut normalized = PathBuf::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::InvalidPath(path.to_string()));
            }
        }
    }

    if normalized.as_os_str().is_empty() {
        return Err(Error::InvalidPath(path.to_string()));
    }
    Ok(normalized)
}
