//! Reversible transform between an archive file and a working directory.
//!
//! `unpack` extracts every entry of an archive below a staging root,
//! preserving relative paths and permission bits. `pack` walks a staging root
//! and writes one entry per file or directory, named relative to that root.
//! The archive is written to a temporary file next to its destination and
//! renamed into place, so a failed pack never clobbers the previous archive.

use crate::atomic::persist_tempfile;
use crate::{ArchiveFormat, Error, Result};
use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use log::{debug, trace};
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Seek, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Extract `archive_path` into `staging_path`.
///
/// The staging directory is created if needed. On failure the staging
/// directory may be partially populated; removing it is the caller's job.
pub fn unpack<P: AsRef<Path>, Q: AsRef<Path>>(archive_path: P, staging_path: Q) -> Result<()> {
    let archive_path = archive_path.as_ref();
    let staging_path = staging_path.as_ref();
    let format = format_of(archive_path)?;

    debug!(
        "Unpacking {} ({:?}) into {}",
        archive_path.display(),
        format,
        staging_path.display()
    );

    fs::create_dir_all(staging_path)?;
    let file = File::open(archive_path)?;

    match format {
        ArchiveFormat::Zip => unpack_zip(file, staging_path),
        ArchiveFormat::Tar => unpack_tar(BufReader::new(file), staging_path),
        ArchiveFormat::TarGz => unpack_tar(GzDecoder::new(BufReader::new(file)), staging_path),
        ArchiveFormat::TarBz2 => unpack_tar(BzDecoder::new(BufReader::new(file)), staging_path),
    }
}

/// Write the tree under `staging_path` into `archive_path`.
pub fn pack<P: AsRef<Path>, Q: AsRef<Path>>(staging_path: P, archive_path: Q) -> Result<()> {
    let staging_path = staging_path.as_ref();
    let archive_path = archive_path.as_ref();
    let format = format_of(archive_path)?;

    debug!(
        "Packing {} into {} ({:?})",
        staging_path.display(),
        archive_path.display(),
        format
    );

    if !staging_path.is_dir() {
        return Err(Error::IoError(io::Error::new(
            io::ErrorKind::NotFound,
            format!("staging directory missing: {}", staging_path.display()),
        )));
    }

    let parent = match archive_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let mut temp = tempfile::Builder::new()
        .prefix(".tmp.pack-")
        .suffix(format.suffix())
        .tempfile_in(parent)?;

    {
        let file = temp.as_file_mut();
        match format {
            ArchiveFormat::Zip => write_zip(&mut *file, staging_path)?,
            ArchiveFormat::Tar => {
                write_tar(&mut *file, staging_path)?;
            }
            ArchiveFormat::TarGz => {
                let gz = GzEncoder::new(&mut *file, flate2::Compression::default());
                write_tar(gz, staging_path)?.finish()?;
            }
            ArchiveFormat::TarBz2 => {
                let bz = BzEncoder::new(&mut *file, bzip2::Compression::default());
                write_tar(bz, staging_path)?.finish()?;
            }
        }
        file.sync_all()?;
    }

    persist_tempfile(temp, archive_path)
}

/// Create an archive containing no entries.
pub fn create_empty<P: AsRef<Path>>(archive_path: P) -> Result<()> {
    let archive_path = archive_path.as_ref();
    let parent = archive_path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let work = tempfile::Builder::new()
        .prefix(".tmp.create-")
        .tempdir_in(parent)?;
    pack(work.path(), archive_path)
}

fn format_of(path: &Path) -> Result<ArchiveFormat> {
    ArchiveFormat::from_path(path).ok_or_else(|| {
        Error::UnsupportedExtension(
            path.extension()
                .map(|ext| ext.to_string_lossy().to_string())
                .unwrap_or_default(),
        )
    })
}

fn unpack_zip(file: File, staging_path: &Path) -> Result<()> {
    let mut archive = ZipArchive::new(file)?;
    // Directory modes are applied last so read-only directories can still be filled.
    let mut dir_modes: Vec<(PathBuf, u32)> = Vec::new();

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let rel = entry
            .enclosed_name()
            .ok_or_else(|| Error::UnsafeEntry(entry.name().to_string()))?;
        let target = staging_path.join(&rel);
        trace!("zip entry '{}' -> {}", entry.name(), target.display());

        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            if let Some(mode) = entry.unix_mode() {
                dir_modes.push((target, mode));
            }
            continue;
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        io::copy(&mut entry, &mut out)?;
        drop(out);

        if let Some(mode) = entry.unix_mode() {
            fs::set_permissions(&target, fs::Permissions::from_mode(mode & 0o7777))?;
        }
    }

    for (dir, mode) in dir_modes.into_iter().rev() {
        fs::set_permissions(&dir, fs::Permissions::from_mode(mode & 0o7777))?;
    }
    Ok(())
}

fn unpack_tar<R: Read>(reader: R, staging_path: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().to_string();
        trace!("tar entry '{}'", name);
        if !entry.unpack_in(staging_path)? {
            return Err(Error::UnsafeEntry(name));
        }
    }
    Ok(())
}

/// Archive names use `/` and are relative to the staging root.
fn entry_name(rel: &Path) -> Result<String> {
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().to_string()),
            _ => return Err(Error::InvalidPath(rel.display().to_string())),
        }
    }
    Ok(parts.join("/"))
}

fn write_zip<W: Write + Seek>(writer: W, staging_path: &Path) -> Result<()> {
    let mut zip = ZipWriter::new(writer);

    for entry in WalkDir::new(staging_path).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(staging_path)
            .map_err(|_| Error::InvalidPath(entry.path().display().to_string()))?;
        let name = entry_name(rel)?;
        let mode = entry.metadata()?.permissions().mode() & 0o7777;
        let options: FileOptions<()> = FileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .unix_permissions(mode);

        if entry.file_type().is_dir() {
            zip.add_directory(name, options)?;
        } else if entry.file_type().is_file() {
            zip.start_file(name, options)?;
            let mut source = File::open(entry.path())?;
            io::copy(&mut source, &mut zip)?;
        } else {
            debug!("Skipping non-regular entry {}", entry.path().display());
        }
    }

    zip.finish()?;
    Ok(())
}

fn write_tar<W: Write>(writer: W, staging_path: &Path) -> Result<W> {
    let mut builder = tar::Builder::new(writer);
    builder.follow_symlinks(false);

    for entry in WalkDir::new(staging_path).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(staging_path)
            .map_err(|_| Error::InvalidPath(entry.path().display().to_string()))?;
        let name = entry_name(rel)?;

        if entry.file_type().is_dir() {
            builder.append_dir(&name, entry.path())?;
        } else {
            builder.append_path_with_name(entry.path(), &name)?;
        }
    }

    Ok(builder.into_inner()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_entry_name_is_relative() {
        assert_eq!(entry_name(Path::new("a/b/c.txt")).unwrap(), "a/b/c.txt");
        assert!(entry_name(Path::new("/abs")).is_err());
    }

    #[test]
    fn test_pack_requires_staging_dir() {
        let dir = tempdir().unwrap();
        let err = pack(dir.path().join("missing"), dir.path().join("out.zip")).unwrap_err();
        assert!(matches!(err, Error::IoError(_)));
        assert!(!dir.path().join("out.zip").exists());
    }

    #[test]
    fn test_unknown_format_rejected() {
        let dir = tempdir().unwrap();
        let err = unpack(dir.path().join("data.rar"), dir.path().join("stage")).unwrap_err();
        assert!(matches!(err, Error::UnsupportedExtension(_)));
    }

    #[test]
    fn test_create_empty() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("empty.tar.gz");
        create_empty(&archive).unwrap();
        assert!(archive.is_file());

        let stage = dir.path().join("stage");
        unpack(&archive, &stage).unwrap();
        assert_eq!(fs::read_dir(&stage).unwrap().count(), 0);

        // The temporary working directory is gone
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert!(names.iter().all(|n| !n.starts_with(".tmp.")));
    }
}
