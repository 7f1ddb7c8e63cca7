//! Filesystem Layer
//!
//! One-shot partition detection, the VFS dispatch table and the
//! read-only FAT16/FAT32 driver.

pub mod detect;
pub mod fat;
pub mod vfs;

use core::fmt;

use crate::io::block::DiskError;

/// Errors surfaced through the VFS to its callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// Path did not resolve to an existing file.
    NotFound,
    /// Path used no recognized filesystem alias or positional prefix,
    /// or the alias named a filesystem that is not mounted.
    BadPath,
    /// All file handle slots are in use.
    HandleTableFull,
    /// Handle is not open.
    BadHandle,
    /// Seek target outside the file.
    OutOfBounds,
    /// On-disk structure violated the format.
    Corrupt,
    /// The block layer failed underneath the filesystem.
    Disk(DiskError),
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsError::NotFound => write!(f, "file not found"),
            FsError::BadPath => write!(f, "path does not resolve to a filesystem"),
            FsError::HandleTableFull => write!(f, "too many open files"),
            FsError::BadHandle => write!(f, "handle is not open"),
            FsError::OutOfBounds => write!(f, "position outside file"),
            FsError::Corrupt => write!(f, "corrupt filesystem structure"),
            FsError::Disk(e) => write!(f, "disk error: {e}"),
        }
    }
}

impl From<DiskError> for FsError {
    fn from(e: DiskError) -> Self {
        FsError::Disk(e)
    }
}

/// Origin for a seek.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekFrom {
    Start(u64),
    Current(i64),
    End(i64),
}
