//! Per-origin file operations against the current mount.
//!
//! A [`Bucket`] keeps no mount state of its own. Every call resolves the
//! origin through the registry while holding the origin's lock shared, so an
//! unmount waits for in-flight operations and later calls see `NotMounted`.

use crate::lock::FileLock;
use crate::registry::{OriginConfig, OriginRecord};
use crate::supervisor::origin_lock_path;
use crate::{Error, Result};
use log::{debug, info};
use origin_format::{normalize_relative_path, OriginKind};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Point-in-time view of a bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketSnapshot {
    pub name: String,
    pub kind: OriginKind,
    pub backing_path: PathBuf,
    pub mount_path: Option<PathBuf>,
    pub mounted: bool,
}

/// File-level access to one origin.
#[derive(Debug, Clone)]
pub struct Bucket {
    name: String,
    backing_path: PathBuf,
    registry: Arc<OriginConfig>,
    lock_path: PathBuf,
}

impl Bucket {
    pub(crate) fn new(record: &OriginRecord, registry: Arc<OriginConfig>, lock_dir: &Path) -> Self {
        Self {
            name: record.name.clone(),
            backing_path: record.backing_path.clone(),
            registry,
            lock_path: origin_lock_path(lock_dir, &record.name),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backing_path(&self) -> &Path {
        &self.backing_path
    }

    /// Current state as recorded in the registry.
    pub fn snapshot(&self) -> Result<BucketSnapshot> {
        let doc = self.registry.snapshot()?;
        let record = doc
            .origins
            .get(&self.name)
            .ok_or_else(|| Error::NotFound(self.name.clone()))?;
        let mount_path = record
            .mount_key
            .as_ref()
            .and_then(|key| doc.mounts.get(key))
            .map(|mount| mount.mount_path.clone());
        Ok(BucketSnapshot {
            name: self.name.clone(),
            kind: record.kind,
            backing_path: record.backing_path.clone(),
            mounted: mount_path.is_some(),
            mount_path,
        })
    }

    /// Hold the origin lock shared and resolve the mount path.
    fn mounted(&self) -> Result<(FileLock, PathBuf)> {
        let guard =
            FileLock::shared(&self.lock_path).map_err(|e| Error::io("lock", &self.name, e))?;
        let (_, mount) = self.registry.resolve(&self.name)?;
        Ok((guard, mount.mount_path))
    }

    /// Place a file under the mount root, named after `source`.
    ///
    /// With `content` the bytes are written directly and `source` only
    /// supplies the name. Existing files are never overwritten.
    pub fn put_file(&self, source: &Path, content: Option<&[u8]>) -> Result<PathBuf> {
        let (_guard, mount_path) = self.mounted()?;

        let file_name = source
            .file_name()
            .ok_or_else(|| Error::Usage(format!("{} has no file name", source.display())))?;
        let dest = mount_path.join(file_name);

        let mut reader = match content {
            Some(_) => None,
            None => {
                let meta = fs::metadata(source)
                    .map_err(|_| Error::SourceMissing(source.to_path_buf()))?;
                if meta.is_dir() {
                    return Err(Error::Usage(format!(
                        "{} is a directory",
                        source.display()
                    )));
                }
                Some(File::open(source).map_err(|e| Error::io("put", &self.name, e))?)
            }
        };

        let mut out = create_new(&dest, &self.name, "put")?;
        let written = match (&mut reader, content) {
            (_, Some(bytes)) => out.write_all(bytes).map(|()| bytes.len() as u64),
            (Some(file), None) => io::copy(file, &mut out),
            (None, None) => Ok(0),
        };
        if let Err(e) = written.and_then(|n| out.sync_all().map(|()| n)) {
            drop(out);
            let _ = fs::remove_file(&dest);
            return Err(Error::io("put", &self.name, e));
        }

        info!("Put {} into origin {}", dest.display(), self.name);
        Ok(dest)
    }

    /// Read a file relative to the mount root.
    ///
    /// Unless `content_only`, the bytes are also written to `dest` (a file
    /// path, or a directory that receives the file's base name), defaulting
    /// to the working directory.
    pub fn get_file(&self, name: &str, dest: Option<&Path>, content_only: bool) -> Result<Vec<u8>> {
        let (_guard, mount_path) = self.mounted()?;
        let rel = normalize_relative_path(name).map_err(|e| Error::Usage(e.to_string()))?;
        let source = mount_path.join(&rel);
        if !source.is_file() {
            return Err(Error::SourceMissing(source));
        }

        let data = fs::read(&source).map_err(|e| Error::io("get", &self.name, e))?;
        if content_only {
            debug!("Read {} bytes from {}", data.len(), source.display());
            return Ok(data);
        }

        let base = rel
            .file_name()
            .ok_or_else(|| Error::Usage(format!("{} has no file name", name)))?;
        let target = match dest {
            Some(dir) if dir.is_dir() => dir.join(base),
            Some(path) => path.to_path_buf(),
            None => std::env::current_dir()
                .map_err(|e| Error::io("get", &self.name, e))?
                .join(base),
        };

        let mut out = create_new(&target, &self.name, "get")?;
        if let Err(e) = out.write_all(&data) {
            drop(out);
            let _ = fs::remove_file(&target);
            return Err(Error::io("get", &self.name, e));
        }
        info!("Got {} from origin {} into {}", name, self.name, target.display());
        Ok(data)
    }

    /// Delete a file relative to the mount root.
    pub fn remove_file(&self, name: &str) -> Result<()> {
        let (_guard, mount_path) = self.mounted()?;
        let rel = normalize_relative_path(name).map_err(|e| Error::Usage(e.to_string()))?;
        let target = mount_path.join(&rel);

        let meta = match fs::symlink_metadata(&target) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::SourceMissing(target))
            }
            Err(e) => return Err(Error::io("remove", &self.name, e)),
        };
        if meta.is_dir() {
            return Err(Error::Usage(format!("{} is a directory", name)));
        }

        fs::remove_file(&target).map_err(|e| Error::io("remove", &self.name, e))?;
        info!("Removed {} from origin {}", name, self.name);
        Ok(())
    }

    /// Names of the entries directly under the mount root, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        let (_guard, mount_path) = self.mounted()?;
        let mut names = Vec::new();
        for entry in fs::read_dir(&mount_path).map_err(|e| Error::io("list", &self.name, e))? {
            let entry = entry.map_err(|e| Error::io("list", &self.name, e))?;
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        names.sort();
        Ok(names)
    }
}

fn create_new(path: &Path, origin: &str, op: &'static str) -> Result<File> {
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| match e.kind() {
            io::ErrorKind::AlreadyExists => Error::DestExists(path.to_path_buf()),
            _ => Error::io(op, origin, e),
        })
}
