//! CPIO `newc` / `crc` archive codec.
//!
//! Each member is a 110-byte ASCII header (magic plus thirteen 8-digit hex
//! fields), the NUL-terminated name padded to a 4-byte boundary, then the
//! data padded the same way. The archive ends with a `TRAILER!!!` member.

use std::ops::Range;

use crate::error::{VfsError, VfsResult};
use crate::types::{S_IFDIR, S_IFLNK, S_IFREG};

pub const MAGIC_NEWC: &[u8; 6] = b"070701";
pub const MAGIC_CRC: &[u8; 6] = b"070702";
pub const TRAILER: &str = "TRAILER!!!";

const HEADER_LEN: usize = 110;

/// One decoded archive member. `data` indexes into the archive bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpioEntry {
    pub name: String,
    pub ino: u32,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub mtime: u32,
    pub dev_major: u32,
    pub dev_minor: u32,
    pub rdev_major: u32,
    pub rdev_minor: u32,
    pub data: Range<usize>,
}

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

fn hex_field(header: &[u8], index: usize) -> VfsResult<u32> {
    let start = 6 + index * 8;
    let raw = &header[start..start + 8];
    let text = std::str::from_utf8(raw)
        .map_err(|_| VfsError::archive(format!("non-ascii header field {index}")))?;
    u32::from_str_radix(text, 16)
        .map_err(|_| VfsError::archive(format!("bad hex header field {index}: {text:?}")))
}

/// Decode every member up to the trailer.
///
/// Any malformed header fails the whole archive.
pub fn parse(bytes: &[u8]) -> VfsResult<Vec<CpioEntry>> {
    let mut entries = Vec::new();
    let mut pos = 0usize;

    loop {
        let header = bytes
            .get(pos..pos + HEADER_LEN)
            .ok_or_else(|| VfsError::archive(format!("truncated header at offset {pos}")))?;
        let magic = &header[..6];
        if magic != MAGIC_NEWC && magic != MAGIC_CRC {
            return Err(VfsError::archive(format!(
                "unsupported magic {:?} at offset {pos}",
                String::from_utf8_lossy(magic)
            )));
        }

        let field = |i| hex_field(header, i);
        let ino = field(0)?;
        let mode = field(1)?;
        let uid = field(2)?;
        let gid = field(3)?;
        let nlink = field(4)?;
        let mtime = field(5)?;
        let filesize = field(6)? as usize;
        let dev_major = field(7)?;
        let dev_minor = field(8)?;
        let rdev_major = field(9)?;
        let rdev_minor = field(10)?;
        let namesize = field(11)? as usize;

        if namesize == 0 {
            return Err(VfsError::archive(format!("empty name at offset {pos}")));
        }
        let name_start = pos + HEADER_LEN;
        let raw_name = bytes
            .get(name_start..name_start + namesize)
            .ok_or_else(|| VfsError::archive(format!("truncated name at offset {pos}")))?;
        let raw_name = raw_name.strip_suffix(&[0]).unwrap_or(raw_name);
        let name = String::from_utf8(raw_name.to_vec())
            .map_err(|_| VfsError::archive(format!("non-utf8 name at offset {pos}")))?;

        let data_start = align4(name_start + namesize);
        let data_end = data_start + filesize;
        if data_end > bytes.len() {
            return Err(VfsError::archive(format!("truncated data for {name}")));
        }

        if name == TRAILER {
            break;
        }

        entries.push(CpioEntry {
            name,
            ino,
            mode,
            uid,
            gid,
            nlink,
            mtime,
            dev_major,
            dev_minor,
            rdev_major,
            rdev_minor,
            data: data_start..data_end,
        });
        pos = align4(data_end);
    }

    Ok(entries)
}

/// Builds `newc` archives in memory.
#[derive(Debug, Default)]
pub struct CpioWriter {
    buf: Vec<u8>,
    next_ino: u32,
    mtime: u32,
}

impl CpioWriter {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            next_ino: 1,
            mtime: 0,
        }
    }

    /// Timestamp stamped on subsequently added members.
    pub fn mtime(mut self, mtime: u32) -> Self {
        self.mtime = mtime;
        self
    }

    pub fn file(mut self, name: &str, perm: u32, data: &[u8]) -> Self {
        self.member(name, S_IFREG | (perm & 0o7777), 1, data);
        self
    }

    pub fn dir(mut self, name: &str, perm: u32) -> Self {
        self.member(name, S_IFDIR | (perm & 0o7777), 2, &[]);
        self
    }

    pub fn symlink(mut self, name: &str, target: &str) -> Self {
        self.member(name, S_IFLNK | 0o777, 1, target.as_bytes());
        self
    }

    /// Terminate the archive and return its bytes.
    pub fn finish(mut self) -> Vec<u8> {
        self.write_member(TRAILER, 0, 0, 0, &[]);
        self.buf
    }

    fn member(&mut self, name: &str, mode: u32, nlink: u32, data: &[u8]) {
        let ino = self.next_ino;
        self.next_ino += 1;
        self.write_member(name, ino, mode, nlink, data);
    }

    fn write_member(&mut self, name: &str, ino: u32, mode: u32, nlink: u32, data: &[u8]) {
        let fields = [
            ino,
            mode,
            0, // uid
            0, // gid
            nlink,
            self.mtime,
            data.len() as u32,
            0,
            0,
            0,
            0,
            name.len() as u32 + 1,
            0, // check
        ];
        self.buf.extend_from_slice(MAGIC_NEWC);
        for field in fields {
            self.buf.extend_from_slice(format!("{field:08X}").as_bytes());
        }
        self.buf.extend_from_slice(name.as_bytes());
        self.buf.push(0);
        self.pad();
        self.buf.extend_from_slice(data);
        self.pad();
    }

    fn pad(&mut self) {
        let padded = align4(self.buf.len());
        self.buf.resize(padded, 0);
    }
}
