//! Error kinds shared by every filesystem and history operation.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, FsError>;

/// The failure modes an engine operation can report.
///
/// Filesystem errors are reported to the caller and never retried inside the
/// engine. `StorageFault` and `DocumentNotFound` indicate trouble below the
/// tree layer; a caller may choose to retry at a higher layer.
#[derive(Debug, Error)]
pub enum FsError {
    /// The path, or a required parent of it, does not exist.
    #[error("no such file or directory: {0}")]
    FileNotFound(String),

    /// A path step that must be a directory is a file.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// The target is a directory where a file was required.
    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// A directory cannot be created where a file already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The operation is deliberately out of scope.
    #[error("operation not supported: {0}")]
    NotSupported(&'static str),

    /// The file body is not valid UTF-8 but was read as text.
    #[error("not valid UTF-8: {0}")]
    InvalidUtf8(String),

    /// Underlying storage or blob I/O failed.
    #[error("storage fault: {0}")]
    StorageFault(String),

    /// A referenced CRDT document cannot be loaded. Indicates corruption.
    #[error("document not found: {0}")]
    DocumentNotFound(String),

    /// The engine has been closed; no further operations are accepted.
    #[error("engine is closed")]
    EngineClosed,
}

impl From<std::io::Error> for FsError {
    fn from(err: std::io::Error) -> Self {
        FsError::StorageFault(err.to_string())
    }
}

impl From<automerge::AutomergeError> for FsError {
    fn from(err: automerge::AutomergeError) -> Self {
        FsError::StorageFault(err.to_string())
    }
}
