//! The mount capability the assembler needs from the OS.

use std::io;
use std::os::fd::RawFd;
use std::path::Path;

use crate::fstab::FstabEntry;

/// 9p mount parameters for the back-channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    pub msize: u32,
    pub uname: String,
}

impl TransportOptions {
    /// Mount data string for a transport read from and written to `fd`.
    pub fn data(&self, fd: RawFd) -> String {
        format!(
            "version=9p2000.L,trans=fd,rfdno={fd},wfdno={fd},msize={},uname={}",
            self.msize, self.uname
        )
    }
}

pub trait Mounter {
    /// Mounts the 9p connection on `fd` at `target`.
    fn mount_transport(
        &mut self,
        fd: RawFd,
        target: &Path,
        options: &TransportOptions,
    ) -> io::Result<()>;

    fn bind_mount(&mut self, source: &Path, target: &Path) -> io::Result<()>;

    /// Performs one fstab entry.
    fn mount(&mut self, entry: &FstabEntry) -> io::Result<()>;
}

#[cfg(target_os = "linux")]
pub use linux::LinuxMounter;

#[cfg(target_os = "linux")]
mod linux {
    use super::*;

    use rustix::mount::{
        MountFlags, MountPropagationFlags, mount, mount_bind, mount_change, mount_recursive_bind,
        mount_remount,
    };
    use tracing::debug;

    use crate::constants::{TRANSPORT_FSTYPE, TRANSPORT_SOURCE};
    use crate::fstab::MountOptions;

    /// [`Mounter`] on mount(2).
    #[derive(Debug, Default)]
    pub struct LinuxMounter;

    impl LinuxMounter {
        pub fn new() -> Self {
            Self
        }

        /// Stops mount events propagating out of (or into) this namespace.
        pub fn make_private(root: &Path) -> io::Result<()> {
            mount_change(root, MountPropagationFlags::PRIVATE | MountPropagationFlags::REC)?;
            Ok(())
        }
    }

    fn flags(options: &MountOptions) -> MountFlags {
        let mut flags = MountFlags::empty();
        for (set, flag) in [
            (options.read_only, MountFlags::RDONLY),
            (options.nosuid, MountFlags::NOSUID),
            (options.nodev, MountFlags::NODEV),
            (options.noexec, MountFlags::NOEXEC),
            (options.sync, MountFlags::SYNCHRONOUS),
            (options.noatime, MountFlags::NOATIME),
            (options.nodiratime, MountFlags::NODIRATIME),
            (options.relatime, MountFlags::RELATIME),
        ] {
            if set {
                flags |= flag;
            }
        }
        flags
    }

    impl Mounter for LinuxMounter {
        fn mount_transport(
            &mut self,
            fd: RawFd,
            target: &Path,
            options: &TransportOptions,
        ) -> io::Result<()> {
            let data = options.data(fd);
            debug!(target = %target.display(), %data, "mounting transport");
            mount(
                TRANSPORT_SOURCE,
                target,
                TRANSPORT_FSTYPE,
                MountFlags::NODEV | MountFlags::NOSUID,
                data.as_str(),
            )?;
            Ok(())
        }

        fn bind_mount(&mut self, source: &Path, target: &Path) -> io::Result<()> {
            mount_bind(source, target)?;
            Ok(())
        }

        fn mount(&mut self, entry: &FstabEntry) -> io::Result<()> {
            let target = Path::new(&entry.file);
            let options = &entry.options;
            if options.remount {
                mount_remount(target, flags(options), entry.data.as_str())?;
                return Ok(());
            }
            if options.bind {
                if options.recursive {
                    mount_recursive_bind(entry.spec.as_str(), target)?;
                } else {
                    mount_bind(entry.spec.as_str(), target)?;
                }
                // A bind ignores flags; they only stick on a remount.
                let extra = flags(options);
                if !extra.is_empty() {
                    mount_remount(target, extra | MountFlags::BIND, "")?;
                }
                return Ok(());
            }
            mount(
                entry.spec.as_str(),
                target,
                entry.vfstype.as_str(),
                flags(options),
                entry.data.as_str(),
            )?;
            Ok(())
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_data() {
        let options = TransportOptions {
            msize: 65536,
            uname: "me".into(),
        };
        assert_eq!(
            options.data(5),
            "version=9p2000.L,trans=fd,rfdno=5,wfdno=5,msize=65536,uname=me"
        );
    }
}
