//! FUSE provider for origins.
//!
//! Serves an origin's directory tree through a passthrough filesystem on a
//! background `fuser` session. Directory origins and staged lazy archives
//! are served read-write. Read-only archives are extracted to a private
//! temporary directory that lives as long as the session and are mounted
//! with `MountOption::RO`.

mod adapter;

pub use adapter::{FuseProvider, FuseSession, OriginFuseFS};
