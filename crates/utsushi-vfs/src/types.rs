//! Core file-tree types.
//!
//! These mirror the 9P2000.L data model closely so the dispatcher can encode
//! them without translation, but they carry no wire concerns themselves.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// QID type tag (the high byte of a 9P mode).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct QidType(pub u8);

impl QidType {
    pub const DIR: Self = Self(0x80);
    pub const APPEND: Self = Self(0x40);
    pub const EXCL: Self = Self(0x20);
    pub const MOUNT: Self = Self(0x10);
    pub const AUTH: Self = Self(0x08);
    pub const TMP: Self = Self(0x04);
    pub const SYMLINK: Self = Self(0x02);
    pub const FILE: Self = Self(0x00);

    /// Derive the tag from a unix `st_mode`.
    pub fn from_mode(mode: u32) -> Self {
        match mode & S_IFMT {
            S_IFDIR => Self::DIR,
            S_IFLNK => Self::SYMLINK,
            _ => Self::FILE,
        }
    }

    pub fn is_dir(self) -> bool {
        self.0 & Self::DIR.0 != 0
    }

    pub fn is_symlink(self) -> bool {
        self.0 & Self::SYMLINK.0 != 0
    }
}

/// Identity of a served object: type tag, version and an opaque path id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Qid {
    pub kind: QidType,
    pub version: u32,
    pub path: u64,
}

impl Qid {
    pub fn new(kind: QidType, path: u64) -> Self {
        Self {
            kind,
            version: 0,
            path,
        }
    }

    /// Build a QID from a unix mode and an inode-like identifier.
    pub fn from_mode(mode: u32, path: u64) -> Self {
        Self::new(QidType::from_mode(mode), path)
    }
}

// Unix file type bits, fixed by the 9P2000.L wire format.
pub const S_IFMT: u32 = 0o170000;
pub const S_IFSOCK: u32 = 0o140000;
pub const S_IFLNK: u32 = 0o120000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFBLK: u32 = 0o060000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFCHR: u32 = 0o020000;
pub const S_IFIFO: u32 = 0o010000;

/// `d_type` value for a directory entry with the given mode.
pub fn dirent_type(mode: u32) -> u8 {
    match mode & S_IFMT {
        S_IFIFO => 1,
        S_IFCHR => 2,
        S_IFDIR => 4,
        S_IFBLK => 6,
        S_IFREG => 8,
        S_IFLNK => 10,
        S_IFSOCK => 12,
        _ => 0,
    }
}

/// Seconds + nanoseconds since the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timespec {
    pub sec: u64,
    pub nsec: u64,
}

impl Timespec {
    pub fn new(sec: u64, nsec: u64) -> Self {
        Self { sec, nsec }
    }

    pub fn from_system_time(t: SystemTime) -> Self {
        let d = t.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self {
            sec: d.as_secs(),
            nsec: u64::from(d.subsec_nanos()),
        }
    }

    pub fn to_system_time(self) -> SystemTime {
        UNIX_EPOCH + Duration::new(self.sec, self.nsec as u32)
    }
}

/// Which attributes a caller asked for (Tgetattr `request_mask`) or which
/// ones a backend filled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AttrMask(pub u64);

impl AttrMask {
    pub const MODE: Self = Self(0x0000_0001);
    pub const NLINK: Self = Self(0x0000_0002);
    pub const UID: Self = Self(0x0000_0004);
    pub const GID: Self = Self(0x0000_0008);
    pub const RDEV: Self = Self(0x0000_0010);
    pub const ATIME: Self = Self(0x0000_0020);
    pub const MTIME: Self = Self(0x0000_0040);
    pub const CTIME: Self = Self(0x0000_0080);
    pub const INO: Self = Self(0x0000_0100);
    pub const SIZE: Self = Self(0x0000_0200);
    pub const BLOCKS: Self = Self(0x0000_0400);
    pub const BTIME: Self = Self(0x0000_0800);
    pub const GEN: Self = Self(0x0000_1000);
    pub const DATA_VERSION: Self = Self(0x0000_2000);
    pub const BASIC: Self = Self(0x0000_07ff);
    pub const ALL: Self = Self(0x0000_3fff);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

/// File attributes, in Rgetattr shape.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileAttr {
    /// Full `st_mode`, including the file type bits.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u64,
    pub rdev: u64,
    pub size: u64,
    pub blksize: u64,
    pub blocks: u64,
    pub atime: Timespec,
    pub mtime: Timespec,
    pub ctime: Timespec,
    pub btime: Timespec,
}

impl FileAttr {
    /// Attributes for a synthetic read-only directory.
    pub fn synthetic_dir() -> Self {
        Self {
            mode: S_IFDIR | 0o555,
            nlink: 2,
            blksize: 4096,
            ..Default::default()
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }

    pub fn is_file(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }
}

/// How a timestamp in [`SetAttr`] should be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetTime {
    /// Use the server's current time.
    Now,
    /// Use the given time.
    At(Timespec),
}

/// Attributes to change (Tsetattr). `None` leaves the attribute alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetAttr {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<SetTime>,
    pub mtime: Option<SetTime>,
}

impl SetAttr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_owner(mut self, uid: Option<u32>, gid: Option<u32>) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    pub fn with_times(mut self, atime: Option<SetTime>, mtime: Option<SetTime>) -> Self {
        self.atime = atime;
        self.mtime = mtime;
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// One entry returned by `readdir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub qid: Qid,
    /// Cookie to pass as the next `readdir` offset to continue after this entry.
    pub offset: u64,
    /// `d_type` of the entry.
    pub kind: u8,
    pub name: String,
}

/// Filesystem statistics (Rstatfs).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatFs {
    pub fs_type: u32,
    pub bsize: u32,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub fsid: u64,
    pub namelen: u32,
}

/// Linux open flags as carried by Tlopen/Tlcreate.
///
/// Only the bits that are stable across Linux architectures are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenFlags(pub u32);

impl OpenFlags {
    pub const RDONLY: u32 = 0o0;
    pub const WRONLY: u32 = 0o1;
    pub const RDWR: u32 = 0o2;
    pub const ACCMODE: u32 = 0o3;
    pub const CREAT: u32 = 0o100;
    pub const EXCL: u32 = 0o200;
    pub const TRUNC: u32 = 0o1000;
    pub const APPEND: u32 = 0o2000;

    pub fn read_only() -> Self {
        Self(Self::RDONLY)
    }

    pub fn read_write() -> Self {
        Self(Self::RDWR)
    }

    pub fn access_mode(self) -> u32 {
        self.0 & Self::ACCMODE
    }

    pub fn readable(self) -> bool {
        matches!(self.access_mode(), Self::RDONLY | Self::RDWR)
    }

    pub fn writable(self) -> bool {
        matches!(self.access_mode(), Self::WRONLY | Self::RDWR)
    }

    pub fn truncate(self) -> bool {
        self.0 & Self::TRUNC != 0
    }

    pub fn append(self) -> bool {
        self.0 & Self::APPEND != 0
    }

    /// Whether the flags imply any modification of the target.
    pub fn mutates(self) -> bool {
        self.writable() || self.truncate() || self.append()
    }
}

/// `unlinkat` flag removing a directory instead of a file.
pub const AT_REMOVEDIR: u32 = 0x200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
    Read,
    Write,
    Unlock,
}

impl LockType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Read),
            1 => Some(Self::Write),
            2 => Some(Self::Unlock),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Read => 0,
            Self::Write => 1,
            Self::Unlock => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    Ok,
    Blocked,
    Error,
    Grace,
}

impl LockStatus {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::Blocked => 1,
            Self::Error => 2,
            Self::Grace => 3,
        }
    }
}

/// Tlock flag: wait for the lock instead of returning `Blocked`.
pub const LOCK_FLAGS_BLOCK: u32 = 1;

/// A byte-range lock request (Tlock / Tgetlock).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRequest {
    pub kind: LockType,
    pub flags: u32,
    pub start: u64,
    pub length: u64,
    pub proc_id: u32,
    pub client_id: String,
}

impl LockRequest {
    pub fn blocking(&self) -> bool {
        self.flags & LOCK_FLAGS_BLOCK != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qid_type_from_mode() {
        assert_eq!(QidType::from_mode(S_IFDIR | 0o755), QidType::DIR);
        assert_eq!(QidType::from_mode(S_IFLNK | 0o777), QidType::SYMLINK);
        assert_eq!(QidType::from_mode(S_IFREG | 0o644), QidType::FILE);
        assert_eq!(QidType::from_mode(S_IFCHR), QidType::FILE);
        assert!(QidType::DIR.is_dir());
        assert!(!QidType::FILE.is_dir());
    }

    #[test]
    fn test_dirent_type() {
        assert_eq!(dirent_type(S_IFDIR), 4);
        assert_eq!(dirent_type(S_IFREG | 0o600), 8);
        assert_eq!(dirent_type(S_IFLNK), 10);
    }

    #[test]
    fn test_open_flags() {
        assert!(OpenFlags::read_only().readable());
        assert!(!OpenFlags::read_only().mutates());
        assert!(OpenFlags::read_write().writable());
        assert!(OpenFlags(OpenFlags::RDONLY | OpenFlags::TRUNC).mutates());
        assert!(OpenFlags(OpenFlags::WRONLY).mutates());
    }

    #[test]
    fn test_setattr_builder() {
        let attr = SetAttr::new().with_size(10).with_mode(0o600);
        assert_eq!(attr.size, Some(10));
        assert_eq!(attr.mode, Some(0o600));
        assert!(attr.uid.is_none());
        assert!(SetAttr::new().is_empty());
    }

    #[test]
    fn test_timespec_round_trip() {
        let ts = Timespec::new(1_700_000_000, 42);
        assert_eq!(Timespec::from_system_time(ts.to_system_time()), ts);
    }

    #[test]
    fn test_attr_mask_contains() {
        assert!(AttrMask::ALL.contains(AttrMask::BASIC));
        assert!(AttrMask::BASIC.contains(AttrMask::SIZE));
        assert!(!AttrMask::BASIC.contains(AttrMask::GEN));
    }
}
