//! Error types for the layertar library.
//!
//! All operations that can fail return a [`Result<T>`], an alias for
//! `Result<T, LayerError>`. The variants map one-to-one onto the failure
//! kinds a caller can meaningfully distinguish:
//!
//! - **Destination shape**: [`PathIsNotDirectory`], [`DirectoryExists`],
//!   [`DirectoryCreateFailed`]
//! - **Link safety**: [`InvalidSymlink`], [`InvalidHardlink`]
//! - **Stream decoding**: [`Read`], [`UnknownHeader`]
//! - **Destination I/O**: [`FailedOpen`], [`FailedWrite`]
//! - **Soft / control-flow**: [`SyscallNotImplemented`], [`Cancelled`],
//!   [`AlreadyAttached`]
//!
//! [`PathIsNotDirectory`]: LayerError::PathIsNotDirectory
//! [`DirectoryExists`]: LayerError::DirectoryExists
//! [`DirectoryCreateFailed`]: LayerError::DirectoryCreateFailed
//! [`InvalidSymlink`]: LayerError::InvalidSymlink
//! [`InvalidHardlink`]: LayerError::InvalidHardlink
//! [`Read`]: LayerError::Read
//! [`UnknownHeader`]: LayerError::UnknownHeader
//! [`FailedOpen`]: LayerError::FailedOpen
//! [`FailedWrite`]: LayerError::FailedWrite
//! [`SyscallNotImplemented`]: LayerError::SyscallNotImplemented
//! [`Cancelled`]: LayerError::Cancelled
//! [`AlreadyAttached`]: LayerError::AlreadyAttached

use std::io;
use std::path::PathBuf;

/// Result type alias for operations that may return a [`LayerError`].
pub type Result<T> = std::result::Result<T, LayerError>;

/// Error types for layer tar operations.
#[derive(Debug, thiserror::Error)]
pub enum LayerError {
    /// The kernel does not implement a syscall needed to restore metadata.
    ///
    /// Only raised by the symlink time-setting path, where it is treated as
    /// non-fatal by the unpacker.
    #[error("syscall not implemented: {0}")]
    SyscallNotImplemented(PathBuf),

    /// Failed to open a file.
    #[error("failed to open file {0}")]
    FailedOpen(PathBuf, #[source] io::Error),

    /// Failed to write a file in the destination.
    #[error("failed to write file {0}")]
    FailedWrite(PathBuf, #[source] io::Error),

    /// A path exists but is not a directory where one is required.
    #[error("path exists, but it's not a directory: {0}")]
    PathIsNotDirectory(PathBuf),

    /// A non-directory is in the way of a directory entry.
    #[error("expected directory to not exist: {0}")]
    DirectoryExists(PathBuf),

    /// Creating a directory in the destination failed.
    #[error("failed to create directory {0}")]
    DirectoryCreateFailed(PathBuf, #[source] io::Error),

    /// A symlink entry would escape the destination or has no target.
    #[error("invalid symlink: {0}")]
    InvalidSymlink(PathBuf),

    /// A hardlink entry would escape the destination or names a path that
    /// does not exist there.
    #[error("invalid hardlink: {0}")]
    InvalidHardlink(PathBuf),

    /// The input tar stream is malformed.
    #[error("encountered error while reading")]
    Read(#[source] io::Error),

    /// A tar entry has a typeflag this library does not support.
    #[error("encountered unknown header: {0}")]
    UnknownHeader(PathBuf),

    /// A filter was attached to a pipeline twice.
    #[error("filter is already attached to a tar writer")]
    AlreadyAttached,

    /// The operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// Catch-all I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<rustix::io::Errno> for LayerError {
    fn from(errno: rustix::io::Errno) -> Self {
        LayerError::Io(errno.into())
    }
}

/// Flatten the nested result of an awaited [`tokio::task::JoinHandle`].
pub(crate) fn flatten_join<T>(
    joined: std::result::Result<Result<T>, tokio::task::JoinError>,
) -> Result<T> {
    match joined {
        Ok(result) => result,
        Err(join_error) => Err(LayerError::Io(io::Error::other(join_error))),
    }
}
