//! # origin-format
//!
//! Process-free building blocks for originfs origins.
//!
//! This crate provides:
//! - Origin type resolution (`Directory`, `Archive`, `LazyArchive`) from a path
//! - The single mount-key derivation shared by the registry and the supervisor
//! - Archive staging: unpack an archive into a working tree and pack it back
//! - The per-origin metadata document
//! - Atomic temp-file + rename writes used by every durable document
//!
//! ## Supported archives
//!
//! `.zip`, `.tar`, `.tar.gz` and `.tar.bz2`. An archive whose file name starts
//! with [`READ_ONLY_PREFIX`] is a read-only [`OriginKind::Archive`]; any other
//! archive is a [`OriginKind::LazyArchive`] that is unpacked on mount and
//! repacked on unmount.
//!
//! ## Example
//!
//! ```ignore
//! use origin_format::{classify, staging, OriginKind};
//!
//! let kind = classify("photos.tar.gz")?;
//! assert_eq!(kind, OriginKind::LazyArchive);
//!
//! staging::unpack("photos.tar.gz", "/tmp/stage")?;
//! // ... edit files under /tmp/stage ...
//! staging::pack("/tmp/stage", "photos.tar.gz")?;
//! ```

mod atomic;
mod error;
mod kind;
mod metadata;
pub mod staging;

pub use atomic::{normalize_relative_path, write_atomic};
pub use error::{Error, Result};
pub use kind::{classify, mount_key_for, ArchiveFormat, OriginKind, READ_ONLY_PREFIX};
pub use metadata::{OriginMetadata, METADATA_FORMAT_VERSION};
