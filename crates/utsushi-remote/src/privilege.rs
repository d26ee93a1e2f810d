//! Dropping a setuid-root launch back to the invoking user.

use std::io;

pub trait Privileges {
    /// Effective root on behalf of an ordinary real user.
    fn is_elevated(&self) -> bool;

    /// Switches group then user to the real ids and clears supplementary
    /// groups. Irreversible.
    fn drop_to_real(&mut self) -> io::Result<()>;
}

#[cfg(target_os = "linux")]
pub use linux::LibcPrivileges;

#[cfg(target_os = "linux")]
mod linux {
    use super::*;

    use rustix::process::{geteuid, getgid, getuid};

    #[derive(Debug, Default)]
    pub struct LibcPrivileges;

    fn check(rc: libc::c_int) -> io::Result<()> {
        if rc == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    impl Privileges for LibcPrivileges {
        fn is_elevated(&self) -> bool {
            geteuid().is_root() && !getuid().is_root()
        }

        fn drop_to_real(&mut self) -> io::Result<()> {
            let uid = getuid().as_raw();
            let gid = getgid().as_raw();

            // SAFETY: plain credential syscalls; no pointers besides the
            // null list handed to setgroups with a zero length.
            unsafe {
                check(libc::setgroups(0, std::ptr::null()))?;
                check(libc::setgid(gid))?;
                check(libc::setuid(uid))?;
            }

            if geteuid().as_raw() != uid {
                return Err(io::Error::other("effective uid did not change"));
            }
            tracing::debug!(uid, gid, "dropped to real ids");
            Ok(())
        }
    }
}
