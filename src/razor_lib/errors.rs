/// Error taxonomy for core operations, mapped onto host errno values.
use std::fmt;
use std::os::raw::c_int;

use libc::{
    EACCES, EEXIST, EINVAL, EIO, EISDIR, EMLINK, ENOENT, ENOSPC, ENOSYS, ENOTDIR, ENOTEMPTY,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsError {
    /// Path resolution failure.
    NotFound,
    /// Name collision on create/mkdir/rename with no-overwrite.
    AlreadyExists,
    NotADirectory,
    IsADirectory,
    /// rmdir on a non-empty directory.
    NotEmpty,
    /// Hardlink count would exceed the per-inode maximum.
    TooManyLinks,
    /// Block or inode exhaustion.
    NoSpace,
    /// Malformed path, `..` traversal, bad offset.
    InvalidArgument(String),
    /// Lower-layer write failure, hash-table overflow, extent-tree capacity.
    Io(String),
    /// Magic/version/CRC failure during load.
    Corruption(String),
    PermissionDenied,
    NotImplemented,
}

pub type FsResult<T> = Result<T, FsError>;

impl FsError {
    pub fn errno(&self) -> c_int {
        match self {
            FsError::NotFound => ENOENT,
            FsError::AlreadyExists => EEXIST,
            FsError::NotADirectory => ENOTDIR,
            FsError::IsADirectory => EISDIR,
            FsError::NotEmpty => ENOTEMPTY,
            FsError::TooManyLinks => EMLINK,
            FsError::NoSpace => ENOSPC,
            FsError::InvalidArgument(_) => EINVAL,
            FsError::Io(_) => EIO,
            FsError::Corruption(_) => EIO,
            FsError::PermissionDenied => EACCES,
            FsError::NotImplemented => ENOSYS,
        }
    }
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsError::NotFound => write!(f, "not found"),
            FsError::AlreadyExists => write!(f, "already exists"),
            FsError::NotADirectory => write!(f, "not a directory"),
            FsError::IsADirectory => write!(f, "is a directory"),
            FsError::NotEmpty => write!(f, "directory not empty"),
            FsError::TooManyLinks => write!(f, "too many links"),
            FsError::NoSpace => write!(f, "no space left"),
            FsError::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            FsError::Io(msg) => write!(f, "I/O error: {}", msg),
            FsError::Corruption(msg) => write!(f, "corruption detected: {}", msg),
            FsError::PermissionDenied => write!(f, "permission denied"),
            FsError::NotImplemented => write!(f, "not implemented"),
        }
    }
}

impl std::error::Error for FsError {}

impl From<std::io::Error> for FsError {
    fn from(e: std::io::Error) -> Self {
        FsError::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(FsError::NotFound.errno(), libc::ENOENT);
        assert_eq!(FsError::NotEmpty.errno(), libc::ENOTEMPTY);
        assert_eq!(FsError::TooManyLinks.errno(), libc::EMLINK);
        assert_eq!(FsError::Corruption("bad crc".into()).errno(), libc::EIO);
        assert_eq!(
            FsError::InvalidArgument("..".into()).errno(),
            libc::EINVAL
        );
    }
}
