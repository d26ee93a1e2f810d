//! VFS error types.

use std::io;
use thiserror::Error;

/// Linux errno values, as carried by Rlerror on every architecture.
pub mod errno {
    pub const EPERM: u32 = 1;
    pub const ENOENT: u32 = 2;
    pub const EIO: u32 = 5;
    pub const EBADF: u32 = 9;
    pub const EACCES: u32 = 13;
    pub const EEXIST: u32 = 17;
    pub const EXDEV: u32 = 18;
    pub const ENOTDIR: u32 = 20;
    pub const EISDIR: u32 = 21;
    pub const EINVAL: u32 = 22;
    pub const ENOSPC: u32 = 28;
    pub const EROFS: u32 = 30;
    pub const ENAMETOOLONG: u32 = 36;
    pub const ENOSYS: u32 = 38;
    pub const ENOTEMPTY: u32 = 39;
    pub const ELOOP: u32 = 40;
    pub const ENODATA: u32 = 61;
    pub const EOPNOTSUPP: u32 = 95;
}

/// VFS error type.
#[derive(Debug, Error)]
pub enum VfsError {
    /// Walk or lookup miss.
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation not supported by this backend or node.
    #[error("operation not supported: {0}")]
    Unsupported(String),

    /// OS-level denial, or an attribute change the platform cannot express.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The handle has not been opened for I/O.
    #[error("handle not open: {0}")]
    NotOpen(String),

    /// Link or rename across backends.
    #[error("cross-device link")]
    CrossDevice,

    /// Malformed or unsupported CPIO archive.
    #[error("archive: {0}")]
    Archive(String),

    /// Underlying read/write/syscall failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Several independent sub-operations failed.
    #[error("{}", join_errors(.0))]
    Aggregate(Vec<VfsError>),
}

fn join_errors(errors: &[VfsError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl VfsError {
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    pub fn unsupported(op: impl Into<String>) -> Self {
        Self::Unsupported(op.into())
    }

    pub fn permission_denied(what: impl Into<String>) -> Self {
        Self::PermissionDenied(what.into())
    }

    pub fn invalid_argument(what: impl Into<String>) -> Self {
        Self::InvalidArgument(what.into())
    }

    pub fn not_open(what: impl Into<String>) -> Self {
        Self::NotOpen(what.into())
    }

    pub fn archive(msg: impl Into<String>) -> Self {
        Self::Archive(msg.into())
    }

    /// Wrap an I/O error with the path it concerns, keeping the taxonomy
    /// for the kinds callers branch on.
    pub fn from_io(err: io::Error, path: impl std::fmt::Display) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound(path.to_string()),
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(path.to_string()),
            io::ErrorKind::AlreadyExists => Self::AlreadyExists(path.to_string()),
            _ => Self::Io(err),
        }
    }

    /// Collapse accumulated failures: none is success, one is returned as is.
    pub fn aggregate(mut errors: Vec<VfsError>) -> Result<(), VfsError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Self::Aggregate(errors)),
        }
    }

    /// The errno reported to the remote caller.
    pub fn errno(&self) -> u32 {
        match self {
            Self::NotFound(_) => errno::ENOENT,
            Self::Unsupported(_) => errno::EOPNOTSUPP,
            Self::PermissionDenied(_) => errno::EPERM,
            Self::AlreadyExists(_) => errno::EEXIST,
            Self::NotADirectory(_) => errno::ENOTDIR,
            Self::IsADirectory(_) => errno::EISDIR,
            Self::InvalidArgument(_) => errno::EINVAL,
            Self::NotOpen(_) => errno::EBADF,
            Self::CrossDevice => errno::EXDEV,
            Self::Archive(_) => errno::EIO,
            Self::Io(e) => io_errno(e),
            Self::Aggregate(errors) => errors.first().map_or(errno::EIO, Self::errno),
        }
    }
}

fn io_errno(e: &io::Error) -> u32 {
    if let Some(raw) = e.raw_os_error() {
        return raw as u32;
    }
    match e.kind() {
        io::ErrorKind::NotFound => errno::ENOENT,
        io::ErrorKind::PermissionDenied => errno::EACCES,
        io::ErrorKind::AlreadyExists => errno::EEXIST,
        io::ErrorKind::InvalidInput => errno::EINVAL,
        io::ErrorKind::NotADirectory => errno::ENOTDIR,
        io::ErrorKind::IsADirectory => errno::EISDIR,
        io::ErrorKind::DirectoryNotEmpty => errno::ENOTEMPTY,
        io::ErrorKind::Unsupported => errno::EOPNOTSUPP,
        _ => errno::EIO,
    }
}

#[cfg(unix)]
impl From<rustix::io::Errno> for VfsError {
    fn from(e: rustix::io::Errno) -> Self {
        Self::Io(e.into())
    }
}

/// VFS result type.
pub type VfsResult<T> = Result<T, VfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(VfsError::not_found("x").errno(), errno::ENOENT);
        assert_eq!(VfsError::unsupported("write").errno(), errno::EOPNOTSUPP);
        assert_eq!(VfsError::CrossDevice.errno(), errno::EXDEV);
        let raw = VfsError::Io(io::Error::from_raw_os_error(39));
        assert_eq!(raw.errno(), errno::ENOTEMPTY);
    }

    #[test]
    fn test_aggregate_collapses() {
        assert!(VfsError::aggregate(Vec::new()).is_ok());

        let single = VfsError::aggregate(vec![VfsError::not_found("a")]).unwrap_err();
        assert!(matches!(single, VfsError::NotFound(_)));

        let many = VfsError::aggregate(vec![
            VfsError::permission_denied("chown"),
            VfsError::not_found("b"),
        ])
        .unwrap_err();
        assert_eq!(many.errno(), errno::EPERM);
        let msg = many.to_string();
        assert!(msg.contains("chown"));
        assert!(msg.contains("not found: b"));
    }

    #[test]
    fn test_from_io_keeps_kind() {
        let e = VfsError::from_io(io::Error::from(io::ErrorKind::NotFound), "/x");
        assert!(matches!(e, VfsError::NotFound(p) if p == "/x"));
    }
}
