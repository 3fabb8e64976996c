#![forbid(unsafe_code)]
//! Error types for Scavenge.
//!
//! Defines `ScvError` and a `Result<T>` alias used throughout the workspace.
//! Includes errno mappings for FUSE response codes.

use scv_types::ParseError;
use thiserror::Error;
use uuid::Uuid;

/// Unified error type for all Scavenge operations.
#[derive(Debug, Error)]
pub enum ScvError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed on-disk data: {0}")]
    Parse(#[from] ParseError),

    #[error("index store error: {0}")]
    Store(#[from] redb::Error),

    #[error(
        "incompatible index version: index has v{actual}, this build expects v{expected} \
         (re-run with --allow-old-version to upgrade an older index)"
    )]
    VersionMismatch { expected: u64, actual: u64 },

    #[error("index block size mismatch: expected {expected}, got {actual}")]
    BlockSizeMismatch { expected: u32, actual: u32 },

    #[error("filesystem id mismatch: expected {expected}, got {actual}")]
    FsidMismatch { expected: Uuid, actual: Uuid },

    #[error("index is missing its metadata record")]
    MissingMetadata,

    #[error("index is closed")]
    Closed,

    #[error("index is read-only")]
    ReadOnly,

    #[error("device too small, must be > 64MiB: {size}")]
    DeviceTooSmall { size: u64 },

    #[error("invalid on-disk format: {0}")]
    Format(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl ScvError {
    /// Convert this error into a POSIX errno suitable for FUSE replies.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Store(_) | Self::MissingMetadata | Self::Closed => libc::EIO,
            Self::Parse(_)
            | Self::Format(_)
            | Self::VersionMismatch { .. }
            | Self::BlockSizeMismatch { .. }
            | Self::FsidMismatch { .. }
            | Self::DeviceTooSmall { .. } => libc::EINVAL,
            Self::ReadOnly => libc::EROFS,
            Self::NotFound(_) => libc::ENOENT,
        }
    }
}

/// Result alias using `ScvError`.
pub type Result<T> = std::result::Result<T, ScvError>;

/// Convert any redb error into `ScvError` through the unified `redb::Error`.
pub fn store_err(err: impl Into<redb::Error>) -> ScvError {
    ScvError::Store(err.into())
}
