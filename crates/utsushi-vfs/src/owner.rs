//! Ownership changes.
//!
//! Numeric owners only exist on unix. Elsewhere every owner or group change
//! is refused with `PermissionDenied`, which the caller folds into its
//! aggregate like any other setattr failure.

use std::io;
use std::path::Path;

/// Change the owner and/or group of `path`, not following a final symlink.
#[cfg(unix)]
pub fn set_owner(path: &Path, uid: Option<u32>, gid: Option<u32>) -> io::Result<()> {
    if uid.is_none() && gid.is_none() {
        return Ok(());
    }
    std::os::unix::fs::lchown(path, uid, gid)
}

#[cfg(not(unix))]
pub fn set_owner(path: &Path, uid: Option<u32>, gid: Option<u32>) -> io::Result<()> {
    if uid.is_none() && gid.is_none() {
        return Ok(());
    }
    Err(io::Error::new(
        io::ErrorKind::PermissionDenied,
        format!("{}: no numeric owners on this platform", path.display()),
    ))
}
