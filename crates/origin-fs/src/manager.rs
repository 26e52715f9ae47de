//! The storage manager, entry point of every command surface.

use crate::bucket::{Bucket, BucketSnapshot};
use crate::daemon::Relaunch;
use crate::lock::FileLock;
use crate::provider::{is_mount_point, FilesystemProvider};
use crate::registry::{OriginConfig, RegistryError};
use crate::settings::Settings;
use crate::supervisor::{ActiveMount, MountSupervisor};
use crate::{Error, Result};
use log::{debug, info, warn};
use origin_format::{classify, staging, OriginKind, OriginMetadata};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Longest origin name accepted, in bytes.
pub const MAX_NAME_LEN: usize = 255;

/// Creates, deletes, mounts and unmounts origins and hands out buckets.
pub struct StorageManager {
    settings: Settings,
    registry: Arc<OriginConfig>,
    supervisor: MountSupervisor,
    buckets: Mutex<HashMap<String, Arc<Bucket>>>,
}

impl StorageManager {
    /// Open the installation described by `settings`.
    pub fn open(settings: Settings, provider: Arc<dyn FilesystemProvider>) -> Result<Self> {
        settings.ensure_dirs()?;
        let registry = Arc::new(OriginConfig::open(settings.registry_path())?);
        let supervisor = MountSupervisor::new(settings.clone(), registry.clone(), provider);
        let manager = Self {
            settings,
            registry,
            supervisor,
            buckets: Mutex::new(HashMap::new()),
        };
        manager.reload_buckets()?;
        Ok(manager)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &OriginConfig {
        &self.registry
    }

    pub fn supervisor(&self) -> &MountSupervisor {
        &self.supervisor
    }

    /// Create a new origin named `name` under the storage root.
    ///
    /// The name's extension decides the kind: no extension makes a
    /// directory, an archive extension makes a lazy archive, and a
    /// `ro_`-prefixed archive name imports an existing read-only archive.
    pub fn create(&self, name: &str) -> Result<Arc<Bucket>> {
        validate_name(name)?;
        let lock_path = self.supervisor.origin_lock_path(name);
        let _guard = FileLock::exclusive(&lock_path).map_err(|e| Error::io("lock", name, e))?;
        if self.registry.contains(name)? {
            return Err(Error::AlreadyExists(name.to_string()));
        }

        let backing = self.settings.storage_root.join(name);
        let kind = classify(&backing).map_err(|e| match e {
            origin_format::Error::NotAFilesystem(_) => Error::AlreadyExists(name.to_string()),
            other => Error::UnsupportedType {
                name: name.to_string(),
                reason: other.to_string(),
            },
        })?;

        let created_backing = match kind {
            OriginKind::Directory => {
                if backing.exists() {
                    return Err(Error::AlreadyExists(name.to_string()));
                }
                fs::create_dir_all(&self.settings.storage_root)
                    .and_then(|()| fs::create_dir(&backing))
                    .map_err(|e| Error::io("create", name, e))?;
                true
            }
            OriginKind::LazyArchive => {
                if backing.exists() {
                    return Err(Error::AlreadyExists(name.to_string()));
                }
                staging::create_empty(&backing).map_err(|e| Error::archive("create", name, e))?;
                true
            }
            OriginKind::Archive => {
                if !backing.is_file() {
                    return Err(Error::UnsupportedType {
                        name: name.to_string(),
                        reason: format!(
                            "read-only archive {} must already exist",
                            backing.display()
                        ),
                    });
                }
                false
            }
        };

        let rollback = || {
            if let Err(e) = OriginMetadata::remove(&backing) {
                warn!("Rollback of metadata for {}: {}", name, e);
            }
            if created_backing {
                if let Err(e) = remove_backing(&backing, kind) {
                    warn!("Rollback of {}: {}", backing.display(), e);
                }
            }
        };

        let metadata = OriginMetadata::new(&self.settings.creator_tag, name, &backing, kind);
        if let Err(e) = metadata.write() {
            rollback();
            return Err(match e {
                origin_format::Error::IoError(io) => Error::io("write metadata", name, io),
                other => Error::archive("write metadata", name, other),
            });
        }

        let record = match self.registry.add_origin(name, &backing, kind) {
            Ok(record) => record,
            Err(e) => {
                rollback();
                return Err(e.into());
            }
        };

        info!("Created origin {} ({}) at {}", name, kind, backing.display());
        let bucket = Arc::new(Bucket::new(
            &record,
            self.registry.clone(),
            &self.settings.lock_dir(),
        ));
        self.buckets().insert(name.to_string(), bucket.clone());
        Ok(bucket)
    }

    /// Delete an unmounted origin together with its backing data.
    pub fn delete(&self, name: &str) -> Result<()> {
        let lock_path = self.supervisor.origin_lock_path(name);
        let _guard = FileLock::exclusive(&lock_path).map_err(|e| Error::io("lock", name, e))?;

        let record = self.registry.origin(name)?;
        if record.is_mounted() {
            return Err(Error::StillMounted(name.to_string()));
        }

        remove_backing(&record.backing_path, record.kind)
            .map_err(|e| Error::io("delete", name, e))?;

        let stray = self.supervisor.mount_path_for(name);
        if stray.exists() && !is_mount_point(&stray) {
            debug!("Removing stray mount point {}", stray.display());
            fs::remove_dir_all(&stray).map_err(|e| Error::mount_point(name, stray.clone(), e))?;
        }

        if let Err(e) = OriginMetadata::remove(&record.backing_path) {
            warn!("Could not remove metadata of {}: {}", name, e);
        }

        self.registry.remove_origin(name).map_err(|e| match e {
            RegistryError::AlreadyMounted(name) => Error::StillMounted(name),
            other => other.into(),
        })?;
        self.buckets().remove(name);
        info!("Deleted origin {}", name);
        Ok(())
    }

    /// Mount `name` in this process. The mount lasts until the returned
    /// handle serves to completion or is unmounted.
    pub fn mount(&self, name: &str) -> Result<ActiveMount<'_>> {
        self.supervisor.mount(name)
    }

    /// Mount `name` in a background worker started from `relaunch`.
    pub fn mount_detached(&self, name: &str, relaunch: &Relaunch) -> Result<()> {
        self.supervisor.spawn_detached(name, relaunch)
    }

    /// Unmount `name`, whichever process serves it.
    pub fn unmount(&self, name: &str) -> Result<()> {
        self.supervisor.unmount(name)
    }

    /// The bucket of an existing origin.
    pub fn bucket(&self, name: &str) -> Result<Arc<Bucket>> {
        let record = match self.registry.origin(name) {
            Ok(record) => record,
            Err(e) => {
                self.buckets().remove(name);
                return Err(e.into());
            }
        };

        let mut buckets = self.buckets();
        let bucket = buckets
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(Bucket::new(
                    &record,
                    self.registry.clone(),
                    &self.settings.lock_dir(),
                ))
            })
            .clone();
        Ok(bucket)
    }

    /// Every origin with its mount state, ordered by name.
    pub fn list(&self) -> Result<Vec<BucketSnapshot>> {
        let doc = self.registry.snapshot()?;
        Ok(doc
            .origins
            .values()
            .map(|record| {
                let mount_path = record
                    .mount_key
                    .as_ref()
                    .and_then(|key| doc.mounts.get(key))
                    .map(|mount| mount.mount_path.clone());
                BucketSnapshot {
                    name: record.name.clone(),
                    kind: record.kind,
                    backing_path: record.backing_path.clone(),
                    mounted: mount_path.is_some(),
                    mount_path,
                }
            })
            .collect())
    }

    /// Rebuild the bucket cache from the registry document.
    pub fn reload_buckets(&self) -> Result<()> {
        let doc = self.registry.snapshot()?;
        let lock_dir = self.settings.lock_dir();
        let mut buckets = self.buckets();
        buckets.clear();
        for record in doc.origins.values() {
            buckets.insert(
                record.name.clone(),
                Arc::new(Bucket::new(record, self.registry.clone(), &lock_dir)),
            );
        }
        debug!("Loaded {} buckets", buckets.len());
        Ok(())
    }

    fn buckets(&self) -> MutexGuard<'_, HashMap<String, Arc<Bucket>>> {
        self.buckets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Reject names that cannot be a single path component.
pub fn validate_name(name: &str) -> Result<()> {
    let invalid = name.is_empty()
        || name.len() > MAX_NAME_LEN
        || name.contains('/')
        || name.contains('\0')
        || name.starts_with('.');
    if invalid {
        return Err(Error::InvalidName(name.to_string()));
    }
    Ok(())
}

fn remove_backing(path: &Path, kind: OriginKind) -> io::Result<()> {
    let result = match kind {
        OriginKind::Directory => fs::remove_dir_all(path),
        OriginKind::Archive | OriginKind::LazyArchive => fs::remove_file(path),
    };
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
