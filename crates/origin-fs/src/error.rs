use crate::daemon::DaemonError;
use crate::provider::ProviderError;
use crate::registry::RegistryError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Broad failure classes shared by every command surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad arguments; never retried.
    Usage,
    /// The origin does not exist.
    UnknownOrigin,
    /// The origin exists but is in the wrong lifecycle state.
    OriginState,
    /// Creating, detaching or removing a mount point failed.
    MountPoint,
    /// Packing or unpacking an archive failed.
    Archive,
    /// The registry document could not be read or written.
    Config,
    /// The filesystem provider could not bind to the mount point.
    Attach,
    /// Spawning or signalling the mount worker failed.
    Process,
    /// Any other filesystem failure.
    Io,
}

impl ErrorCategory {
    /// Process exit code for this category.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorCategory::Usage => 2,
            ErrorCategory::UnknownOrigin => 3,
            ErrorCategory::OriginState => 4,
            ErrorCategory::MountPoint => 5,
            ErrorCategory::Archive => 6,
            ErrorCategory::Config => 7,
            ErrorCategory::Attach => 8,
            ErrorCategory::Process => 9,
            ErrorCategory::Io => 10,
        }
    }
}

/// Errors surfaced by origin operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("usage error: {0}")]
    Usage(String),

    #[error("invalid origin name: {0:?}")]
    InvalidName(String),

    #[error("origin not found: {0}")]
    NotFound(String),

    #[error("origin already exists: {0}")]
    AlreadyExists(String),

    #[error("origin already mounted: {0}")]
    AlreadyMounted(String),

    #[error("origin not mounted: {0}")]
    NotMounted(String),

    #[error("origin still mounted: {0}")]
    StillMounted(String),

    #[error("unsupported origin type for {name}: {reason}")]
    UnsupportedType { name: String, reason: String },

    #[error("source missing: {}", .0.display())]
    SourceMissing(PathBuf),

    #[error("destination already exists: {}", .0.display())]
    DestExists(PathBuf),

    #[error("{op} failed for origin {origin}: {source}")]
    Io {
        op: &'static str,
        origin: String,
        #[source]
        source: io::Error,
    },

    #[error("mount point {} for origin {origin}: {source}", .path.display())]
    MountPoint {
        origin: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{op} failed for origin {origin}: {source}")]
    Archive {
        op: &'static str,
        origin: String,
        #[source]
        source: origin_format::Error,
    },

    #[error("staging failed for origin {origin}: {reason}")]
    StagingFailed { origin: String, reason: String },

    #[error("repack failed for origin {origin}, staged data preserved at {}: {source}", .preserved.display())]
    RepackFailed {
        origin: String,
        preserved: PathBuf,
        #[source]
        source: origin_format::Error,
    },

    #[error("attach failed for origin {origin}: {source}")]
    Attach {
        origin: String,
        #[source]
        source: ProviderError,
    },

    #[error("detach failed for origin {origin}: {source}")]
    Detach {
        origin: String,
        #[source]
        source: ProviderError,
    },

    #[error("config error: {0}")]
    Config(RegistryError),

    #[error("settings error at {}: {reason}", .path.display())]
    Settings { path: PathBuf, reason: String },

    #[error("mount worker for origin {origin}: {source}")]
    Process {
        origin: String,
        #[source]
        source: DaemonError,
    },

    #[error("mount worker for origin {origin} exited with status {code}")]
    WorkerExited { origin: String, code: i32 },
}

impl Error {
    pub(crate) fn io(op: &'static str, origin: &str, source: io::Error) -> Self {
        Error::Io {
            op,
            origin: origin.to_string(),
            source,
        }
    }

    pub(crate) fn archive(op: &'static str, origin: &str, source: origin_format::Error) -> Self {
        Error::Archive {
            op,
            origin: origin.to_string(),
            source,
        }
    }

    pub(crate) fn mount_point(origin: &str, path: PathBuf, source: io::Error) -> Self {
        Error::MountPoint {
            origin: origin.to_string(),
            path,
            source,
        }
    }

    /// Failure class of this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Usage(_) | Error::InvalidName(_) => ErrorCategory::Usage,
            Error::NotFound(_) => ErrorCategory::UnknownOrigin,
            Error::AlreadyExists(_)
            | Error::AlreadyMounted(_)
            | Error::NotMounted(_)
            | Error::StillMounted(_)
            | Error::UnsupportedType { .. }
            | Error::SourceMissing(_)
            | Error::DestExists(_) => ErrorCategory::OriginState,
            Error::Io { .. } => ErrorCategory::Io,
            Error::MountPoint { .. } | Error::Detach { .. } => ErrorCategory::MountPoint,
            Error::Archive { .. } | Error::StagingFailed { .. } | Error::RepackFailed { .. } => {
                ErrorCategory::Archive
            }
            Error::Attach { .. } => ErrorCategory::Attach,
            Error::Config(_) | Error::Settings { .. } => ErrorCategory::Config,
            Error::Process { .. } | Error::WorkerExited { .. } => ErrorCategory::Process,
        }
    }

    /// Process exit code to report this error with.
    ///
    /// A worker that died before signalling readiness passes its own status through.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::WorkerExited { code, .. } if *code > 0 => *code,
            other => other.category().exit_code(),
        }
    }
}

impl From<RegistryError> for Error {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(name) => Error::NotFound(name),
            RegistryError::AlreadyExists(name) => Error::AlreadyExists(name),
            RegistryError::MountKeyTaken { name, .. } => Error::AlreadyExists(name),
            RegistryError::AlreadyMounted(name) => Error::AlreadyMounted(name),
            RegistryError::NotMounted(name) => Error::NotMounted(name),
            other => Error::Config(other),
        }
    }
}

/// Result type for origin-fs operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct_per_category() {
        assert_eq!(Error::Usage("x".into()).exit_code(), 2);
        assert_eq!(Error::NotFound("a".into()).exit_code(), 3);
        assert_eq!(Error::StillMounted("a".into()).exit_code(), 4);
        assert_eq!(
            Error::StagingFailed {
                origin: "a".into(),
                reason: "r".into()
            }
            .exit_code(),
            6
        );
        assert_eq!(
            Error::Attach {
                origin: "a".into(),
                source: ProviderError::Unsupported
            }
            .exit_code(),
            8
        );
    }

    #[test]
    fn test_worker_status_passes_through() {
        let err = Error::WorkerExited {
            origin: "a".into(),
            code: 8,
        };
        assert_eq!(err.exit_code(), 8);

        let err = Error::WorkerExited {
            origin: "a".into(),
            code: -1,
        };
        assert_eq!(err.exit_code(), 9);
    }

    #[test]
    fn test_registry_state_errors_keep_their_meaning() {
        let err: Error = RegistryError::AlreadyMounted("a".into()).into();
        assert!(matches!(err, Error::AlreadyMounted(_)));
        assert_eq!(err.category(), ErrorCategory::OriginState);
    }
}
