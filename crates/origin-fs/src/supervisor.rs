//! Mount supervision.
//!
//! `Unmounted -> Staging -> Attaching -> Mounted -> Detaching -> Unmounted`.
//! Nothing is recorded in the registry until the provider has attached, and
//! the mount relation is cleared only after the OS-level detach returned.

use crate::daemon::{self, Readiness, Relaunch};
use crate::lock::FileLock;
use crate::provider::{os_detach, AttachedFilesystem, FilesystemProvider, ProviderError};
use crate::registry::{OriginConfig, OriginRecord};
use crate::settings::Settings;
use crate::{Error, Result};
use chrono::Utc;
use log::{debug, error, info, warn};
use origin_format::{mount_key_for, staging, OriginKind};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const SERVE_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Drives mounts and unmounts of origins.
pub struct MountSupervisor {
    settings: Settings,
    registry: Arc<OriginConfig>,
    provider: Arc<dyn FilesystemProvider>,
}

impl MountSupervisor {
    pub fn new(
        settings: Settings,
        registry: Arc<OriginConfig>,
        provider: Arc<dyn FilesystemProvider>,
    ) -> Self {
        Self {
            settings,
            registry,
            provider,
        }
    }

    /// Where `name` is mounted while it is mounted.
    pub fn mount_path_for(&self, name: &str) -> PathBuf {
        self.settings.mount_root.join(mount_key_for(name))
    }

    /// Where a lazy archive is unpacked while it is mounted.
    pub fn staging_path_for(&self, name: &str) -> PathBuf {
        self.settings.staging_root().join(mount_key_for(name))
    }

    pub(crate) fn origin_lock_path(&self, name: &str) -> PathBuf {
        origin_lock_path(&self.settings.lock_dir(), name)
    }

    /// Stage, attach and record a mount of `name` in this process.
    pub fn mount(&self, name: &str) -> Result<ActiveMount<'_>> {
        let lock_path = self.origin_lock_path(name);
        let _guard = FileLock::exclusive(&lock_path).map_err(|e| Error::io("lock", name, e))?;

        let record = self.registry.origin(name)?;
        if record.is_mounted() {
            return Err(Error::AlreadyMounted(name.to_string()));
        }

        let mount_key = mount_key_for(name);
        let mount_path = self.settings.mount_root.join(&mount_key);

        // Staging
        let staged = self.stage(&record)?;
        let source = staged.clone().unwrap_or_else(|| record.backing_path.clone());
        let cleanup_staging = |staged: &Option<PathBuf>| {
            if let Some(dir) = staged {
                remove_tree(dir);
            }
        };

        // Attaching
        let created_mount_point = match prepare_mount_point(name, &mount_path) {
            Ok(created) => created,
            Err(e) => {
                cleanup_staging(&staged);
                return Err(e);
            }
        };
        let cleanup = |staged: &Option<PathBuf>| {
            if created_mount_point {
                if let Err(e) = fs::remove_dir(&mount_path) {
                    debug!("Could not remove {}: {}", mount_path.display(), e);
                }
            }
            cleanup_staging(staged);
        };

        info!(
            "Attaching origin {} ({}) at {}",
            name,
            record.kind,
            mount_path.display()
        );
        let session = match self.provider.attach(&source, record.kind, &mount_path) {
            Ok(session) => session,
            Err(source) => {
                error!("Attach of origin {} failed: {}", name, source);
                cleanup(&staged);
                return Err(Error::Attach {
                    origin: name.to_string(),
                    source,
                });
            }
        };

        if let Err(e) = self.registry.attach_mount(name, &mount_key, &mount_path) {
            warn!("Recording mount of {} failed, detaching: {}", name, e);
            if let Err(detach_err) = session.detach() {
                warn!("Detach after failed record: {}", detach_err);
            }
            cleanup(&staged);
            return Err(e.into());
        }

        info!("Origin {} mounted at {}", name, mount_path.display());
        Ok(ActiveMount {
            supervisor: self,
            origin: name.to_string(),
            mount_path,
            session: Some(session),
        })
    }

    /// Unpack a lazy archive into its staging directory.
    ///
    /// Returns the staging directory, or `None` when the origin is served
    /// straight from its backing path.
    fn stage(&self, record: &OriginRecord) -> Result<Option<PathBuf>> {
        let name = record.name.as_str();
        match record.kind {
            OriginKind::Directory => {
                if !record.backing_path.is_dir() {
                    return Err(Error::SourceMissing(record.backing_path.clone()));
                }
                return Ok(None);
            }
            OriginKind::Archive => {
                if !record.backing_path.is_file() {
                    return Err(Error::SourceMissing(record.backing_path.clone()));
                }
                return Ok(None);
            }
            OriginKind::LazyArchive => {}
        }

        let staging_dir = self.staging_path_for(name);
        if staging_dir.exists() {
            return Err(Error::StagingFailed {
                origin: name.to_string(),
                reason: format!(
                    "stale staging directory {} left by an earlier mount",
                    staging_dir.display()
                ),
            });
        }

        info!(
            "Staging {} into {}",
            record.backing_path.display(),
            staging_dir.display()
        );
        if let Err(e) = fs::create_dir_all(&staging_dir) {
            return Err(Error::StagingFailed {
                origin: name.to_string(),
                reason: format!("cannot create {}: {}", staging_dir.display(), e),
            });
        }
        if let Err(e) = staging::unpack(&record.backing_path, &staging_dir) {
            remove_tree(&staging_dir);
            return Err(Error::StagingFailed {
                origin: name.to_string(),
                reason: e.to_string(),
            });
        }
        Ok(Some(staging_dir))
    }

    /// Detach `name` at the OS level and complete the bookkeeping.
    ///
    /// Works for mounts served by any process, including ones whose worker
    /// already lost its session.
    pub fn unmount(&self, name: &str) -> Result<()> {
        self.teardown(name, None)
    }

    fn teardown(&self, name: &str, session: Option<Box<dyn AttachedFilesystem>>) -> Result<()> {
        let lock_path = self.origin_lock_path(name);
        let _guard = FileLock::exclusive(&lock_path).map_err(|e| Error::io("lock", name, e))?;

        let (record, mount) = match self.registry.resolve(name) {
            Ok(found) => found,
            Err(e) => {
                if let Some(session) = session {
                    if let Err(detach_err) = session.detach() {
                        warn!("Detach of orphaned session for {}: {}", name, detach_err);
                    }
                }
                return Err(e.into());
            }
        };
        info!("Detaching origin {} from {}", name, mount.mount_path.display());

        if let Some(session) = session {
            session.detach().map_err(|e| Error::Detach {
                origin: name.to_string(),
                source: ProviderError::Io(e),
            })?;
        }
        match os_detach(&mount.mount_path) {
            Ok(true) => debug!("Detached {}", mount.mount_path.display()),
            Ok(false) => debug!("{} was already detached", mount.mount_path.display()),
            Err(source) => {
                // Leave the record so the unmount can be retried.
                error!("Detach of origin {} failed: {}", name, source);
                return Err(Error::Detach {
                    origin: name.to_string(),
                    source,
                });
            }
        }

        let repacked = match record.kind {
            OriginKind::LazyArchive => self.repack(&record),
            OriginKind::Directory | OriginKind::Archive => Ok(()),
        };

        let removed = match fs::remove_dir(&mount.mount_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::mount_point(name, mount.mount_path.clone(), e)),
        };

        self.registry.detach_mount(&mount.mount_key)?;
        info!("Origin {} unmounted", name);

        repacked?;
        removed
    }

    fn repack(&self, record: &OriginRecord) -> Result<()> {
        let name = record.name.as_str();
        let staging_dir = self.staging_path_for(name);
        if !staging_dir.is_dir() {
            return Err(Error::StagingFailed {
                origin: name.to_string(),
                reason: format!(
                    "staging directory {} is missing, archive left unchanged",
                    staging_dir.display()
                ),
            });
        }

        info!(
            "Repacking {} into {}",
            staging_dir.display(),
            record.backing_path.display()
        );
        match staging::pack(&staging_dir, &record.backing_path) {
            Ok(()) => {
                remove_tree(&staging_dir);
                Ok(())
            }
            Err(source) => {
                let preserved = self.settings.staging_root().join(format!(
                    "{}.recovered-{}",
                    mount_key_for(name),
                    Utc::now().format("%Y%m%dT%H%M%SZ")
                ));
                let preserved = match fs::rename(&staging_dir, &preserved) {
                    Ok(()) => preserved,
                    Err(e) => {
                        warn!(
                            "Could not move {} aside: {}",
                            staging_dir.display(),
                            e
                        );
                        staging_dir
                    }
                };
                error!(
                    "Repack of origin {} failed, staged data kept at {}: {}",
                    name,
                    preserved.display(),
                    source
                );
                Err(Error::RepackFailed {
                    origin: name.to_string(),
                    preserved,
                    source,
                })
            }
        }
    }

    /// Mount `name` in a detached worker and wait for it to become ready.
    pub fn spawn_detached(&self, name: &str, relaunch: &Relaunch) -> Result<()> {
        let record = self.registry.origin(name)?;
        if record.is_mounted() {
            return Err(Error::AlreadyMounted(name.to_string()));
        }

        let outcome = daemon::spawn_and_wait(relaunch, self.settings.readiness_timeout())
            .map_err(|source| Error::Process {
                origin: name.to_string(),
                source,
            })?;
        match outcome {
            Readiness::Ready | Readiness::Exited(0) => Ok(()),
            Readiness::Exited(code) => Err(Error::WorkerExited {
                origin: name.to_string(),
                code,
            }),
        }
    }
}

pub(crate) fn origin_lock_path(lock_dir: &Path, name: &str) -> PathBuf {
    lock_dir.join(format!("{}.lock", mount_key_for(name)))
}

/// Create the mount point, returning whether it was created here.
fn prepare_mount_point(name: &str, mount_path: &Path) -> Result<bool> {
    if mount_path.exists() {
        warn!("Mount point {} already exists", mount_path.display());
        return Ok(false);
    }
    fs::create_dir_all(mount_path)
        .map_err(|e| Error::mount_point(name, mount_path.to_path_buf(), e))?;
    Ok(true)
}

fn remove_tree(dir: &Path) {
    if let Err(e) = fs::remove_dir_all(dir) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("Could not remove {}: {}", dir.display(), e);
        }
    }
}

/// A mount attached by this process.
///
/// Dropping it ends the provider session without touching the registry;
/// the next `unmount` completes the bookkeeping.
pub struct ActiveMount<'a> {
    supervisor: &'a MountSupervisor,
    origin: String,
    mount_path: PathBuf,
    session: Option<Box<dyn AttachedFilesystem>>,
}

impl std::fmt::Debug for ActiveMount<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveMount")
            .field("origin", &self.origin)
            .field("mount_path", &self.mount_path)
            .field("attached", &self.session.is_some())
            .finish()
    }
}

impl ActiveMount<'_> {
    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn mount_path(&self) -> &Path {
        &self.mount_path
    }

    /// Whether the provider session is still serving.
    pub fn is_attached(&self) -> bool {
        self.session.as_ref().map_or(false, |s| s.is_attached())
    }

    /// Serve until a termination signal arrives or the session ends.
    ///
    /// Termination handlers are installed here if the caller has not done
    /// so before mounting. With `notify_pid`, the standard streams are detached into the log
    /// file, a new session is started and the parent is signalled first.
    pub fn serve(mut self, notify_pid: Option<u32>) -> Result<()> {
        let process_err = |origin: &str, source| Error::Process {
            origin: origin.to_string(),
            source,
        };

        daemon::install_termination_handlers().map_err(|e| process_err(&self.origin, e))?;

        if daemon::termination_requested() {
            info!("Termination requested while mounting {}", self.origin);
            return self.unmount();
        }

        if let Some(pid) = notify_pid {
            let log_path = self.supervisor.settings.log_path();
            let handshake = daemon::detach_stdio(&log_path)
                .and_then(|()| daemon::new_session())
                .and_then(|()| daemon::notify_parent(pid));
            if let Err(e) = handshake {
                error!("Readiness handshake for {} failed: {}", self.origin, e);
                let origin = self.origin.clone();
                if let Err(cleanup) = self.unmount() {
                    warn!("Cleanup after failed handshake: {}", cleanup);
                }
                return Err(process_err(&origin, e));
            }
        }

        info!("Serving origin {} at {}", self.origin, self.mount_path.display());
        loop {
            if daemon::termination_requested() {
                info!("Termination requested, unmounting {}", self.origin);
                return self.unmount();
            }
            if !self.is_attached() {
                // Unmounted from outside; whoever did it owns the bookkeeping.
                info!("Session for {} ended", self.origin);
                self.session.take();
                return Ok(());
            }
            thread::sleep(SERVE_POLL_INTERVAL);
        }
    }

    /// Detach this session and run the full unmount sequence.
    pub fn unmount(mut self) -> Result<()> {
        let session = self.session.take();
        match self.supervisor.teardown(&self.origin, session) {
            // Another process finished the unmount first.
            Err(Error::NotMounted(_)) | Err(Error::NotFound(_)) => Ok(()),
            other => other,
        }
    }
}
