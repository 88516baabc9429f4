use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the merge core.
///
/// No error is recovered inside the core; every one of them aborts the
/// running merge task and unwinds its temporary part directory.
#[derive(Debug, Error)]
pub enum Error {
    /// Cancellation was observed at a checkpoint. Terminal.
    #[error("merge aborted: {0}")]
    Aborted(String),

    /// The target temporary directory already exists, which indicates a
    /// stale uncleaned prior attempt.
    #[error("directory {0} already exists")]
    DirectoryAlreadyExists(PathBuf),

    /// The caller handed us something the merge cannot operate on.
    #[error("bad arguments: {0}")]
    BadArguments(String),

    /// Internal consistency violation. Never expected; indicates a bug.
    #[error("logical error: {0}")]
    LogicalError(String),

    /// On-disk state failed validation (checksum mismatch, truncated file,
    /// out-of-range values).
    #[error("corrupted part data: {0}")]
    Corrupted(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("part metadata codec error: {0}")]
    Meta(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn logical(msg: impl Into<String>) -> Self {
        Error::LogicalError(msg.into())
    }

    pub(crate) fn corrupted(msg: impl Into<String>) -> Self {
        Error::Corrupted(msg.into())
    }
}
