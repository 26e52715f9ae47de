//! Durable registry of origins and their active mounts.
//!
//! The registry is one JSON document with two views of a single relation:
//! `origins` (name -> record, carrying the current mount key) and `mounts`
//! (mount key -> record, carrying the owning origin). Both views are updated
//! inside the same save.
//!
//! Every mutation runs reload -> mutate -> save while holding an exclusive
//! `flock` on the registry's lock file, so independently launched processes
//! never lose each other's updates.

use crate::lock::FileLock;
use log::{debug, info, warn};
use origin_format::{mount_key_for, write_atomic, OriginKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Current layout version of the registry document.
pub const REGISTRY_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("origin not found: {0}")]
    NotFound(String),
    #[error("origin already exists: {0}")]
    AlreadyExists(String),
    #[error("origin already mounted: {0}")]
    AlreadyMounted(String),
    #[error("origin not mounted: {0}")]
    NotMounted(String),
    #[error("origin {name} would share mount key {key} with origin {owner}")]
    MountKeyTaken {
        name: String,
        key: String,
        owner: String,
    },
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("unsupported registry version {found} in {}", .path.display())]
    Version { path: PathBuf, found: u32 },
    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: origin_format::Error,
    },
    #[error("failed to lock {}: {source}", .path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("registry is inconsistent: {0}")]
    Inconsistent(String),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// A known origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginRecord {
    #[serde(skip)]
    pub name: String,
    pub backing_path: PathBuf,
    pub kind: OriginKind,
    /// Present iff the origin is mounted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_key: Option<String>,
}

impl OriginRecord {
    pub fn is_mounted(&self) -> bool {
        self.mount_key.is_some()
    }
}

/// An active mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountRecord {
    #[serde(skip)]
    pub mount_key: String,
    pub mount_path: PathBuf,
    pub origin_name: String,
}

/// On-disk shape of the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryDocument {
    pub version: u32,
    #[serde(default)]
    pub origins: BTreeMap<String, OriginRecord>,
    #[serde(default)]
    pub mounts: BTreeMap<String, MountRecord>,
}

impl RegistryDocument {
    fn empty() -> Self {
        Self {
            version: REGISTRY_VERSION,
            ..Default::default()
        }
    }

    // Keys are stored once, as map keys; copy them back into the records.
    fn fill_keys(&mut self) {
        for (name, record) in self.origins.iter_mut() {
            record.name = name.clone();
        }
        for (key, record) in self.mounts.iter_mut() {
            record.mount_key = key.clone();
        }
    }

    /// Check that both views describe the same relation.
    pub fn check_consistency(&self) -> RegistryResult<()> {
        for (name, record) in &self.origins {
            if let Some(key) = &record.mount_key {
                match self.mounts.get(key) {
                    Some(mount) if &mount.origin_name == name => {}
                    _ => {
                        return Err(RegistryError::Inconsistent(format!(
                            "origin {} points at missing mount {}",
                            name, key
                        )))
                    }
                }
            }
        }
        for (key, mount) in &self.mounts {
            let owner = self.origins.get(&mount.origin_name);
            if owner.and_then(|o| o.mount_key.as_deref()) != Some(key.as_str()) {
                return Err(RegistryError::Inconsistent(format!(
                    "mount {} is not owned by origin {}",
                    key, mount.origin_name
                )));
            }
        }
        Ok(())
    }
}

/// The registry of origins and mounts, backed by one JSON document.
#[derive(Debug)]
pub struct OriginConfig {
    path: PathBuf,
    lock_path: PathBuf,
    state: Mutex<RegistryDocument>,
}

impl OriginConfig {
    /// Open the registry at `path`, loading it if it exists.
    pub fn open<P: Into<PathBuf>>(path: P) -> RegistryResult<Self> {
        let path = path.into();
        let lock_path = path.with_extension("lock");
        let config = Self {
            path,
            lock_path,
            state: Mutex::new(RegistryDocument::empty()),
        };
        config.load()?;
        Ok(config)
    }

    /// Path of the registry document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the in-memory state with the document on disk.
    pub fn load(&self) -> RegistryResult<()> {
        let mut state = self.state();
        let _lock = self.lock(false)?;
        self.load_into(&mut state)
    }

    /// Write the in-memory state to disk.
    pub fn save(&self) -> RegistryResult<()> {
        let state = self.state();
        let _lock = self.lock(true)?;
        self.save_from(&state)
    }

    /// Register a new, unmounted origin.
    pub fn add_origin(
        &self,
        name: &str,
        backing_path: &Path,
        kind: OriginKind,
    ) -> RegistryResult<OriginRecord> {
        self.mutate(|doc| {
            if doc.origins.contains_key(name) {
                return Err(RegistryError::AlreadyExists(name.to_string()));
            }
            let key = mount_key_for(name);
            let owner = doc
                .origins
                .keys()
                .find(|other| mount_key_for(other.as_str()) == key);
            if let Some(other) = owner {
                warn!("Mount key {} of {} already belongs to {}", key, name, other);
                return Err(RegistryError::MountKeyTaken {
                    name: name.to_string(),
                    key,
                    owner: other.clone(),
                });
            }
            let record = OriginRecord {
                name: name.to_string(),
                backing_path: backing_path.to_path_buf(),
                kind,
                mount_key: None,
            };
            doc.origins.insert(name.to_string(), record.clone());
            info!("Registered origin {} ({}) at {}", name, kind, backing_path.display());
            Ok(record)
        })
    }

    /// Forget an origin. Mounted origins cannot be removed.
    pub fn remove_origin(&self, name: &str) -> RegistryResult<OriginRecord> {
        self.mutate(|doc| {
            let record = doc
                .origins
                .get(name)
                .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
            if record.is_mounted() {
                return Err(RegistryError::AlreadyMounted(name.to_string()));
            }
            let record = doc
                .origins
                .remove(name)
                .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
            info!("Removed origin {}", name);
            Ok(record)
        })
    }

    /// Record that `name` is mounted at `mount_path` under `mount_key`.
    pub fn attach_mount(
        &self,
        name: &str,
        mount_key: &str,
        mount_path: &Path,
    ) -> RegistryResult<MountRecord> {
        if mount_key != mount_key_for(name) {
            return Err(RegistryError::Inconsistent(format!(
                "mount key {} does not belong to origin {}",
                mount_key, name
            )));
        }
        self.mutate(|doc| {
            let record = doc
                .origins
                .get_mut(name)
                .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
            if record.is_mounted() || doc.mounts.contains_key(mount_key) {
                return Err(RegistryError::AlreadyMounted(name.to_string()));
            }
            record.mount_key = Some(mount_key.to_string());
            let mount = MountRecord {
                mount_key: mount_key.to_string(),
                mount_path: mount_path.to_path_buf(),
                origin_name: name.to_string(),
            };
            doc.mounts.insert(mount_key.to_string(), mount.clone());
            info!("Recorded mount {} -> {}", mount_key, mount_path.display());
            Ok(mount)
        })
    }

    /// Remove the mount recorded under `mount_key` and clear its origin's key.
    pub fn detach_mount(&self, mount_key: &str) -> RegistryResult<MountRecord> {
        self.mutate(|doc| {
            let mount = doc
                .mounts
                .remove(mount_key)
                .ok_or_else(|| RegistryError::NotMounted(mount_key.to_string()))?;
            if let Some(record) = doc.origins.get_mut(&mount.origin_name) {
                record.mount_key = None;
            }
            info!("Cleared mount {}", mount_key);
            Ok(mount)
        })
    }

    /// Resolve a mounted origin to its records.
    pub fn resolve(&self, name: &str) -> RegistryResult<(OriginRecord, MountRecord)> {
        let doc = self.snapshot()?;
        let record = doc
            .origins
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        let key = record
            .mount_key
            .clone()
            .ok_or_else(|| RegistryError::NotMounted(name.to_string()))?;
        let mount = doc
            .mounts
            .get(&key)
            .cloned()
            .ok_or_else(|| RegistryError::NotMounted(name.to_string()))?;
        Ok((record, mount))
    }

    /// Look up an origin whether or not it is mounted.
    pub fn origin(&self, name: &str) -> RegistryResult<OriginRecord> {
        self.snapshot()?
            .origins
            .remove(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Whether an origin with this name is registered.
    pub fn contains(&self, name: &str) -> RegistryResult<bool> {
        Ok(self.snapshot()?.origins.contains_key(name))
    }

    /// Reload from disk and return a copy of the whole document.
    pub fn snapshot(&self) -> RegistryResult<RegistryDocument> {
        let mut state = self.state();
        let _lock = self.lock(false)?;
        self.load_into(&mut state)?;
        Ok(state.clone())
    }

    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut RegistryDocument) -> RegistryResult<T>,
    ) -> RegistryResult<T> {
        let mut state = self.state();
        let _lock = self.lock(true)?;
        self.load_into(&mut state)?;

        let mut next = state.clone();
        let out = f(&mut next)?;
        next.check_consistency()?;
        self.save_from(&next)?;
        *state = next;
        Ok(out)
    }

    fn state(&self) -> MutexGuard<'_, RegistryDocument> {
        // A panic while holding the lock leaves a document that is still
        // reloaded from disk before every use.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock(&self, exclusive: bool) -> RegistryResult<FileLock> {
        let result = if exclusive {
            FileLock::exclusive(&self.lock_path)
        } else {
            FileLock::shared(&self.lock_path)
        };
        result.map_err(|source| RegistryError::Lock {
            path: self.lock_path.clone(),
            source,
        })
    }

    fn load_into(&self, state: &mut RegistryDocument) -> RegistryResult<()> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                *state = RegistryDocument::empty();
                return Ok(());
            }
            Err(source) => {
                return Err(RegistryError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let mut doc: RegistryDocument =
            serde_json::from_slice(&data).map_err(|source| RegistryError::Parse {
                path: self.path.clone(),
                source,
            })?;
        if doc.version > REGISTRY_VERSION {
            return Err(RegistryError::Version {
                path: self.path.clone(),
                found: doc.version,
            });
        }
        doc.fill_keys();
        debug!(
            "Loaded registry {} ({} origins, {} mounts)",
            self.path.display(),
            doc.origins.len(),
            doc.mounts.len()
        );
        *state = doc;
        Ok(())
    }

    fn save_from(&self, doc: &RegistryDocument) -> RegistryResult<()> {
        let data = serde_json::to_vec_pretty(doc).map_err(|e| RegistryError::Write {
            path: self.path.clone(),
            source: e.into(),
        })?;
        write_atomic(&self.path, &data, None).map_err(|source| RegistryError::Write {
            path: self.path.clone(),
            source,
        })?;
        debug!("Saved registry {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn registry(dir: &Path) -> OriginConfig {
        OriginConfig::open(dir.join("origins.json")).unwrap()
    }

    #[test]
    fn test_add_and_resolve() {
        let dir = tempdir().unwrap();
        let config = registry(dir.path());
        config
            .add_origin("A", &dir.path().join("A"), OriginKind::Directory)
            .unwrap();

        let record = config.origin("A").unwrap();
        assert_eq!(record.name, "A");
        assert!(!record.is_mounted());
        assert!(matches!(
            config.resolve("A"),
            Err(RegistryError::NotMounted(_))
        ));
        assert!(matches!(
            config.resolve("B"),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn test_duplicate_origin_rejected() {
        let dir = tempdir().unwrap();
        let config = registry(dir.path());
        config
            .add_origin("A", Path::new("/a"), OriginKind::Directory)
            .unwrap();
        let err = config
            .add_origin("A", Path::new("/other"), OriginKind::LazyArchive)
            .unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyExists(_)));
        assert_eq!(config.origin("A").unwrap().backing_path, PathBuf::from("/a"));
    }

    #[test]
    fn test_names_sharing_a_mount_key_rejected() {
        let dir = tempdir().unwrap();
        let config = registry(dir.path());
        config
            .add_origin("A.zip", Path::new("/a.zip"), OriginKind::LazyArchive)
            .unwrap();
        let err = config
            .add_origin("A_zip", Path::new("/a_zip"), OriginKind::Directory)
            .unwrap_err();
        match err {
            RegistryError::MountKeyTaken { name, key, owner } => {
                assert_eq!(name, "A_zip");
                assert_eq!(key, "_mountA_zip");
                assert_eq!(owner, "A.zip");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(matches!(
            config.origin("A_zip"),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn test_mount_relation_stays_paired() {
        let dir = tempdir().unwrap();
        let config = registry(dir.path());
        config
            .add_origin("A", Path::new("/a"), OriginKind::Directory)
            .unwrap();

        let key = mount_key_for("A");
        config.attach_mount("A", &key, Path::new("/mnt/_mountA")).unwrap();
        let (record, mount) = config.resolve("A").unwrap();
        assert_eq!(record.mount_key.as_deref(), Some("_mountA"));
        assert_eq!(mount.origin_name, "A");
        assert_eq!(mount.mount_key, "_mountA");

        let err = config
            .attach_mount("A", &key, Path::new("/mnt/again"))
            .unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyMounted(_)));

        let err = config.remove_origin("A").unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyMounted(_)));

        config.detach_mount(&key).unwrap();
        let doc = config.snapshot().unwrap();
        assert!(doc.mounts.is_empty());
        assert!(doc.origins["A"].mount_key.is_none());

        assert!(matches!(
            config.detach_mount(&key),
            Err(RegistryError::NotMounted(_))
        ));
    }

    #[test]
    fn test_foreign_mount_key_rejected() {
        let dir = tempdir().unwrap();
        let config = registry(dir.path());
        config
            .add_origin("A", Path::new("/a"), OriginKind::Directory)
            .unwrap();
        assert!(config
            .attach_mount("A", "_mountB", Path::new("/mnt/b"))
            .is_err());
        assert!(config.snapshot().unwrap().mounts.is_empty());
    }

    #[test]
    fn test_new_instance_sees_saved_state() {
        let dir = tempdir().unwrap();
        let first = registry(dir.path());
        first
            .add_origin("A", Path::new("/a"), OriginKind::Directory)
            .unwrap();
        first
            .add_origin("b.zip", Path::new("/b.zip"), OriginKind::LazyArchive)
            .unwrap();
        first
            .attach_mount("b.zip", &mount_key_for("b.zip"), Path::new("/mnt/b"))
            .unwrap();

        let second = registry(dir.path());
        assert_eq!(first.snapshot().unwrap(), second.snapshot().unwrap());
        let (_, mount) = second.resolve("b.zip").unwrap();
        assert_eq!(mount.mount_key, "_mountb_zip");
    }

    #[test]
    fn test_reload_drops_stale_entries() {
        let dir = tempdir().unwrap();
        let first = registry(dir.path());
        let second = registry(dir.path());
        first
            .add_origin("A", Path::new("/a"), OriginKind::Directory)
            .unwrap();
        assert!(second.contains("A").unwrap());

        first.remove_origin("A").unwrap();
        second.load().unwrap();
        assert!(!second.contains("A").unwrap());
    }

    #[test]
    fn test_interrupted_save_keeps_committed_document() {
        let dir = tempdir().unwrap();
        let config = registry(dir.path());
        config
            .add_origin("A", Path::new("/a"), OriginKind::Directory)
            .unwrap();
        let committed = fs::read(config.path()).unwrap();

        // A crash between temp-write and rename leaves a stray temp file behind.
        let mut stray = tempfile::Builder::new()
            .prefix(".tmp.origin-")
            .tempfile_in(dir.path())
            .unwrap();
        stray.write_all(b"{\"version\": 1, \"origins\": {\"trunc").unwrap();
        let (_file, _path) = stray.keep().unwrap();

        assert_eq!(fs::read(config.path()).unwrap(), committed);
        let reopened = registry(dir.path());
        assert!(reopened.contains("A").unwrap());
        assert_eq!(reopened.snapshot().unwrap().origins.len(), 1);
    }

    #[test]
    fn test_newer_version_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("origins.json");
        fs::write(&path, br#"{"version": 99, "origins": {}, "mounts": {}}"#).unwrap();
        let err = OriginConfig::open(&path).unwrap_err();
        assert!(matches!(err, RegistryError::Version { found: 99, .. }));
    }

    #[test]
    fn test_document_layout() {
        let dir = tempdir().unwrap();
        let config = registry(dir.path());
        config
            .add_origin("A", Path::new("/a"), OriginKind::Directory)
            .unwrap();
        config
            .attach_mount("A", "_mountA", Path::new("/mnt/_mountA"))
            .unwrap();

        let value: serde_json::Value =
            serde_json::from_slice(&fs::read(config.path()).unwrap()).unwrap();
        assert_eq!(value["version"], 1);
        assert_eq!(value["origins"]["A"]["kind"], "directory");
        assert_eq!(value["origins"]["A"]["mount_key"], "_mountA");
        assert_eq!(value["mounts"]["_mountA"]["origin_name"], "A");
        assert_eq!(value["mounts"]["_mountA"]["mount_path"], "/mnt/_mountA");
    }
}
