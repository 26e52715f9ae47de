//! # origin-fs
//!
//! Lifecycle and mount orchestration for originfs origins.
//!
//! This crate provides:
//! - The durable origin registry ([`OriginConfig`])
//! - Mount supervision with staging of lazy archives ([`MountSupervisor`])
//! - Background mount workers with a signal-based readiness handshake
//! - Per-origin file operations ([`Bucket`])
//! - The [`StorageManager`] facade used by the `origin` binary
//! - FUSE passthrough serving (optional, with the `fuse` feature)
//!
//! ## Example
//!
//! ```ignore
//! use origin_fs::{default_provider, Settings, StorageManager};
//! use std::path::Path;
//!
//! let manager = StorageManager::open(Settings::load(None)?, default_provider())?;
//! manager.create("photos.zip")?;
//!
//! let mount = manager.mount("photos.zip")?;
//! manager.bucket("photos.zip")?.put_file(Path::new("beach.jpg"), None)?;
//! mount.unmount()?;
//! ```
//!
//! ## Daemonized mounts
//!
//! `StorageManager::mount_detached` re-executes the program with
//! `--foreground --notify-pid=<pid>` and returns once the worker reports
//! readiness with `SIGUSR1`, exits, or exceeds the configured timeout. The
//! worker calls [`ActiveMount::serve`] with the notify pid.

pub mod bucket;
pub mod daemon;
mod error;
pub mod lock;
pub mod manager;
pub mod provider;
pub mod registry;
pub mod settings;
pub mod supervisor;
mod vfs;

#[cfg(feature = "fuse")]
pub mod fuse;

pub use bucket::{Bucket, BucketSnapshot};
pub use daemon::{DaemonError, Readiness, Relaunch};
pub use error::{Error, ErrorCategory, Result};
pub use manager::StorageManager;
pub use provider::{default_provider, AttachedFilesystem, FilesystemProvider, ProviderError};
pub use registry::{MountRecord, OriginConfig, OriginRecord, RegistryDocument, RegistryError};
pub use settings::Settings;
pub use supervisor::{ActiveMount, MountSupervisor};
pub use vfs::{InodeTable, ROOT_INODE};
