use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while classifying, staging or persisting origins.
#[derive(Debug, Error)]
pub enum Error {
    /// The path carries an extension that is neither a directory nor a known archive.
    #[error("unsupported extension: {0}")]
    UnsupportedExtension(String),

    /// The path exists but is neither a directory nor an archive.
    #[error("not a filesystem: {}", .0.display())]
    NotAFilesystem(PathBuf),

    /// A relative path escapes its root or is otherwise malformed.
    #[error("invalid relative path: {0}")]
    InvalidPath(String),

    /// An archive entry could not be placed inside the staging directory.
    #[error("archive entry escapes staging root: {0}")]
    UnsafeEntry(String),

    /// Error from the zip library.
    #[error("zip error: {0}")]
    ZipError(#[from] zip::result::ZipError),

    /// Error while walking a staging tree.
    #[error("walk error: {0}")]
    WalkError(#[from] walkdir::Error),

    /// I/O error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON encoding or decoding error.
    #[error("json error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Result type for origin-format operations.
pub type Result<T> = std::result::Result<T, Error>;
