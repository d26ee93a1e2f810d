//! 9P2000.L messages.
//!
//! Every message is `size[4] type[1] tag[2] body`, little-endian, strings as
//! `len[2]` followed by UTF-8 bytes. [`Fcall`] holds the body; the codec adds
//! the framing.

use bytes::{Buf, BufMut, BytesMut};
use utsushi_vfs::{DirEntry, FileAttr, LockRequest, LockType, Qid, QidType, StatFs, Timespec};

use crate::error::ProtocolError;

pub const VERSION_9P2000_L: &str = "9P2000.L";
pub const VERSION_UNKNOWN: &str = "unknown";
pub const NOTAG: u16 = 0xffff;
pub const NOFID: u32 = 0xffff_ffff;

/// Bytes of framing around Rread/Twrite payloads.
pub const IOHDRSZ: u32 = 24;
/// Most names a single Twalk may carry.
pub const MAXWELEM: usize = 16;

/// Size of `size[4] type[1] tag[2]`.
pub const HEADER_LEN: usize = 7;

const QID_LEN: usize = 13;

/// Tsetattr `valid` bits.
pub mod setattr {
    pub const MODE: u32 = 0x0000_0001;
    pub const UID: u32 = 0x0000_0002;
    pub const GID: u32 = 0x0000_0004;
    pub const SIZE: u32 = 0x0000_0008;
    pub const ATIME: u32 = 0x0000_0010;
    pub const MTIME: u32 = 0x0000_0020;
    pub const CTIME: u32 = 0x0000_0040;
    pub const ATIME_SET: u32 = 0x0000_0080;
    pub const MTIME_SET: u32 = 0x0000_0100;
}

/// Message type numbers.
pub mod kind {
    pub const RLERROR: u8 = 7;
    pub const TSTATFS: u8 = 8;
    pub const RSTATFS: u8 = 9;
    pub const TLOPEN: u8 = 12;
    pub const RLOPEN: u8 = 13;
    pub const TLCREATE: u8 = 14;
    pub const RLCREATE: u8 = 15;
    pub const TSYMLINK: u8 = 16;
    pub const RSYMLINK: u8 = 17;
    pub const TMKNOD: u8 = 18;
    pub const RMKNOD: u8 = 19;
    pub const TRENAME: u8 = 20;
    pub const RRENAME: u8 = 21;
    pub const TREADLINK: u8 = 22;
    pub const RREADLINK: u8 = 23;
    pub const TGETATTR: u8 = 24;
    pub const RGETATTR: u8 = 25;
    pub const TSETATTR: u8 = 26;
    pub const RSETATTR: u8 = 27;
    pub const TXATTRWALK: u8 = 30;
    pub const RXATTRWALK: u8 = 31;
    pub const TXATTRCREATE: u8 = 32;
    pub const RXATTRCREATE: u8 = 33;
    pub const TREADDIR: u8 = 40;
    pub const RREADDIR: u8 = 41;
    pub const TFSYNC: u8 = 50;
    pub const RFSYNC: u8 = 51;
    pub const TLOCK: u8 = 52;
    pub const RLOCK: u8 = 53;
    pub const TGETLOCK: u8 = 54;
    pub const RGETLOCK: u8 = 55;
    pub const TLINK: u8 = 70;
    pub const RLINK: u8 = 71;
    pub const TMKDIR: u8 = 72;
    pub const RMKDIR: u8 = 73;
    pub const TRENAMEAT: u8 = 74;
    pub const RRENAMEAT: u8 = 75;
    pub const TUNLINKAT: u8 = 76;
    pub const RUNLINKAT: u8 = 77;
    pub const TVERSION: u8 = 100;
    pub const RVERSION: u8 = 101;
    pub const TAUTH: u8 = 102;
    pub const RAUTH: u8 = 103;
    pub const TATTACH: u8 = 104;
    pub const RATTACH: u8 = 105;
    pub const TFLUSH: u8 = 108;
    pub const RFLUSH: u8 = 109;
    pub const TWALK: u8 = 110;
    pub const RWALK: u8 = 111;
    pub const TREAD: u8 = 116;
    pub const RREAD: u8 = 117;
    pub const TWRITE: u8 = 118;
    pub const RWRITE: u8 = 119;
    pub const TCLUNK: u8 = 120;
    pub const RCLUNK: u8 = 121;
    pub const TREMOVE: u8 = 122;
    pub const RREMOVE: u8 = 123;
}

/// A tagged message.
#[derive(Debug, Clone, PartialEq)]
pub struct Msg {
    pub tag: u16,
    pub body: Fcall,
}

/// Tsetattr body, kept in wire shape.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetAttrRequest {
    pub valid: u32,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: Timespec,
    pub mtime: Timespec,
}

/// Message bodies.
#[derive(Debug, Clone, PartialEq)]
pub enum Fcall {
    Rlerror { ecode: u32 },
    Tstatfs { fid: u32 },
    Rstatfs { statfs: StatFs },
    Tlopen { fid: u32, flags: u32 },
    Rlopen { qid: Qid, iounit: u32 },
    Tlcreate { fid: u32, name: String, flags: u32, mode: u32, gid: u32 },
    Rlcreate { qid: Qid, iounit: u32 },
    Tsymlink { fid: u32, name: String, symtgt: String, gid: u32 },
    Rsymlink { qid: Qid },
    Tmknod { dfid: u32, name: String, mode: u32, major: u32, minor: u32, gid: u32 },
    Rmknod { qid: Qid },
    Trename { fid: u32, dfid: u32, name: String },
    Rrename,
    Treadlink { fid: u32 },
    Rreadlink { target: String },
    Tgetattr { fid: u32, request_mask: u64 },
    Rgetattr { valid: u64, qid: Qid, attr: FileAttr },
    Tsetattr { fid: u32, attr: SetAttrRequest },
    Rsetattr,
    Txattrwalk { fid: u32, newfid: u32, name: String },
    Rxattrwalk { size: u64 },
    Txattrcreate { fid: u32, name: String, attr_size: u64, flags: u32 },
    Rxattrcreate,
    Treaddir { fid: u32, offset: u64, count: u32 },
    Rreaddir { data: Vec<u8> },
    Tfsync { fid: u32, datasync: u32 },
    Rfsync,
    Tlock { fid: u32, lock: LockRequest },
    Rlock { status: u8 },
    Tgetlock { fid: u32, lock: LockRequest },
    Rgetlock { lock: LockRequest },
    Tlink { dfid: u32, fid: u32, name: String },
    Rlink,
    Tmkdir { dfid: u32, name: String, mode: u32, gid: u32 },
    Rmkdir { qid: Qid },
    Trenameat { olddirfid: u32, oldname: String, newdirfid: u32, newname: String },
    Rrenameat,
    Tunlinkat { dirfd: u32, name: String, flags: u32 },
    Runlinkat,
    Tversion { msize: u32, version: String },
    Rversion { msize: u32, version: String },
    Tauth { afid: u32, uname: String, aname: String, n_uname: u32 },
    Rauth { aqid: Qid },
    Tattach { fid: u32, afid: u32, uname: String, aname: String, n_uname: u32 },
    Rattach { qid: Qid },
    Tflush { oldtag: u16 },
    Rflush,
    Twalk { fid: u32, newfid: u32, wnames: Vec<String> },
    Rwalk { wqids: Vec<Qid> },
    Tread { fid: u32, offset: u64, count: u32 },
    Rread { data: Vec<u8> },
    Twrite { fid: u32, offset: u64, data: Vec<u8> },
    Rwrite { count: u32 },
    Tclunk { fid: u32 },
    Rclunk,
    Tremove { fid: u32 },
    Rremove,
    /// A message type this implementation does not know.
    Unknown { kind: u8 },
    /// A frame of a known type whose body failed to decode. The frame
    /// boundary was intact, so only this request fails.
    Malformed { kind: u8, reason: String },
}

impl Fcall {
    /// The wire type number.
    pub fn kind(&self) -> u8 {
        use kind::*;
        match self {
            Self::Rlerror { .. } => RLERROR,
            Self::Tstatfs { .. } => TSTATFS,
            Self::Rstatfs { .. } => RSTATFS,
            Self::Tlopen { .. } => TLOPEN,
            Self::Rlopen { .. } => RLOPEN,
            Self::Tlcreate { .. } => TLCREATE,
            Self::Rlcreate { .. } => RLCREATE,
            Self::Tsymlink { .. } => TSYMLINK,
            Self::Rsymlink { .. } => RSYMLINK,
            Self::Tmknod { .. } => TMKNOD,
            Self::Rmknod { .. } => RMKNOD,
            Self::Trename { .. } => TRENAME,
            Self::Rrename => RRENAME,
            Self::Treadlink { .. } => TREADLINK,
            Self::Rreadlink { .. } => RREADLINK,
            Self::Tgetattr { .. } => TGETATTR,
            Self::Rgetattr { .. } => RGETATTR,
            Self::Tsetattr { .. } => TSETATTR,
            Self::Rsetattr => RSETATTR,
            Self::Txattrwalk { .. } => TXATTRWALK,
            Self::Rxattrwalk { .. } => RXATTRWALK,
            Self::Txattrcreate { .. } => TXATTRCREATE,
            Self::Rxattrcreate => RXATTRCREATE,
            Self::Treaddir { .. } => TREADDIR,
            Self::Rreaddir { .. } => RREADDIR,
            Self::Tfsync { .. } => TFSYNC,
            Self::Rfsync => RFSYNC,
            Self::Tlock { .. } => TLOCK,
            Self::Rlock { .. } => RLOCK,
            Self::Tgetlock { .. } => TGETLOCK,
            Self::Rgetlock { .. } => RGETLOCK,
            Self::Tlink { .. } => TLINK,
            Self::Rlink => RLINK,
            Self::Tmkdir { .. } => TMKDIR,
            Self::Rmkdir { .. } => RMKDIR,
            Self::Trenameat { .. } => TRENAMEAT,
            Self::Rrenameat => RRENAMEAT,
            Self::Tunlinkat { .. } => TUNLINKAT,
            Self::Runlinkat => RUNLINKAT,
            Self::Tversion { .. } => TVERSION,
            Self::Rversion { .. } => RVERSION,
            Self::Tauth { .. } => TAUTH,
            Self::Rauth { .. } => RAUTH,
            Self::Tattach { .. } => TATTACH,
            Self::Rattach { .. } => RATTACH,
            Self::Tflush { .. } => TFLUSH,
            Self::Rflush => RFLUSH,
            Self::Twalk { .. } => TWALK,
            Self::Rwalk { .. } => RWALK,
            Self::Tread { .. } => TREAD,
            Self::Rread { .. } => RREAD,
            Self::Twrite { .. } => TWRITE,
            Self::Rwrite { .. } => RWRITE,
            Self::Tclunk { .. } => TCLUNK,
            Self::Rclunk => RCLUNK,
            Self::Tremove { .. } => TREMOVE,
            Self::Rremove => RREMOVE,
            Self::Unknown { kind } | Self::Malformed { kind, .. } => *kind,
        }
    }

    /// Append the body (without header) to `buf`.
    pub fn encode_body(&self, buf: &mut BytesMut) {
        match self {
            Self::Rlerror { ecode } => buf.put_u32_le(*ecode),
            Self::Tstatfs { fid } | Self::Treadlink { fid } | Self::Tclunk { fid } | Self::Tremove { fid } => {
                buf.put_u32_le(*fid)
            }
            Self::Rstatfs { statfs } => {
                buf.put_u32_le(statfs.fs_type);
                buf.put_u32_le(statfs.bsize);
                buf.put_u64_le(statfs.blocks);
                buf.put_u64_le(statfs.bfree);
                buf.put_u64_le(statfs.bavail);
                buf.put_u64_le(statfs.files);
                buf.put_u64_le(statfs.ffree);
                buf.put_u64_le(statfs.fsid);
                buf.put_u32_le(statfs.namelen);
            }
            Self::Tlopen { fid, flags } => {
                buf.put_u32_le(*fid);
                buf.put_u32_le(*flags);
            }
            Self::Rlopen { qid, iounit } | Self::Rlcreate { qid, iounit } => {
                put_qid(buf, qid);
                buf.put_u32_le(*iounit);
            }
            Self::Tlcreate { fid, name, flags, mode, gid } => {
                buf.put_u32_le(*fid);
                put_str(buf, name);
                buf.put_u32_le(*flags);
                buf.put_u32_le(*mode);
                buf.put_u32_le(*gid);
            }
            Self::Tsymlink { fid, name, symtgt, gid } => {
                buf.put_u32_le(*fid);
                put_str(buf, name);
                put_str(buf, symtgt);
                buf.put_u32_le(*gid);
            }
            Self::Rsymlink { qid }
            | Self::Rmknod { qid }
            | Self::Rmkdir { qid }
            | Self::Rattach { qid }
            | Self::Rauth { aqid: qid } => put_qid(buf, qid),
            Self::Tmknod { dfid, name, mode, major, minor, gid } => {
                buf.put_u32_le(*dfid);
                put_str(buf, name);
                buf.put_u32_le(*mode);
                buf.put_u32_le(*major);
                buf.put_u32_le(*minor);
                buf.put_u32_le(*gid);
            }
            Self::Trename { fid, dfid, name } => {
                buf.put_u32_le(*fid);
                buf.put_u32_le(*dfid);
                put_str(buf, name);
            }
            Self::Rreadlink { target } => put_str(buf, target),
            Self::Tgetattr { fid, request_mask } => {
                buf.put_u32_le(*fid);
                buf.put_u64_le(*request_mask);
            }
            Self::Rgetattr { valid, qid, attr } => {
                buf.put_u64_le(*valid);
                put_qid(buf, qid);
                buf.put_u32_le(attr.mode);
                buf.put_u32_le(attr.uid);
                buf.put_u32_le(attr.gid);
                buf.put_u64_le(attr.nlink);
                buf.put_u64_le(attr.rdev);
                buf.put_u64_le(attr.size);
                buf.put_u64_le(attr.blksize);
                buf.put_u64_le(attr.blocks);
                for t in [attr.atime, attr.mtime, attr.ctime, attr.btime] {
                    buf.put_u64_le(t.sec);
                    buf.put_u64_le(t.nsec);
                }
                buf.put_u64_le(0); // gen
                buf.put_u64_le(0); // data_version
            }
            Self::Tsetattr { fid, attr } => {
                buf.put_u32_le(*fid);
                buf.put_u32_le(attr.valid);
                buf.put_u32_le(attr.mode);
                buf.put_u32_le(attr.uid);
                buf.put_u32_le(attr.gid);
                buf.put_u64_le(attr.size);
                buf.put_u64_le(attr.atime.sec);
                buf.put_u64_le(attr.atime.nsec);
                buf.put_u64_le(attr.mtime.sec);
                buf.put_u64_le(attr.mtime.nsec);
            }
            Self::Txattrwalk { fid, newfid, name } => {
                buf.put_u32_le(*fid);
                buf.put_u32_le(*newfid);
                put_str(buf, name);
            }
            Self::Rxattrwalk { size } => buf.put_u64_le(*size),
            Self::Txattrcreate { fid, name, attr_size, flags } => {
                buf.put_u32_le(*fid);
                put_str(buf, name);
                buf.put_u64_le(*attr_size);
                buf.put_u32_le(*flags);
            }
            Self::Treaddir { fid, offset, count } | Self::Tread { fid, offset, count } => {
                buf.put_u32_le(*fid);
                buf.put_u64_le(*offset);
                buf.put_u32_le(*count);
            }
            Self::Rreaddir { data } | Self::Rread { data } => {
                buf.put_u32_le(data.len() as u32);
                buf.put_slice(data);
            }
            Self::Tfsync { fid, datasync } => {
                buf.put_u32_le(*fid);
                buf.put_u32_le(*datasync);
            }
            Self::Tlock { fid, lock } => {
                buf.put_u32_le(*fid);
                buf.put_u8(lock.kind.as_u8());
                buf.put_u32_le(lock.flags);
                put_lock_range(buf, lock);
            }
            Self::Rlock { status } => buf.put_u8(*status),
            Self::Tgetlock { fid, lock } => {
                buf.put_u32_le(*fid);
                buf.put_u8(lock.kind.as_u8());
                put_lock_range(buf, lock);
            }
            Self::Rgetlock { lock } => {
                buf.put_u8(lock.kind.as_u8());
                put_lock_range(buf, lock);
            }
            Self::Tlink { dfid, fid, name } => {
                buf.put_u32_le(*dfid);
                buf.put_u32_le(*fid);
                put_str(buf, name);
            }
            Self::Tmkdir { dfid, name, mode, gid } => {
                buf.put_u32_le(*dfid);
                put_str(buf, name);
                buf.put_u32_le(*mode);
                buf.put_u32_le(*gid);
            }
            Self::Trenameat { olddirfid, oldname, newdirfid, newname } => {
                buf.put_u32_le(*olddirfid);
                put_str(buf, oldname);
                buf.put_u32_le(*newdirfid);
                put_str(buf, newname);
            }
            Self::Tunlinkat { dirfd, name, flags } => {
                buf.put_u32_le(*dirfd);
                put_str(buf, name);
                buf.put_u32_le(*flags);
            }
            Self::Tversion { msize, version } | Self::Rversion { msize, version } => {
                buf.put_u32_le(*msize);
                put_str(buf, version);
            }
            Self::Tauth { afid, uname, aname, n_uname } => {
                buf.put_u32_le(*afid);
                put_str(buf, uname);
                put_str(buf, aname);
                buf.put_u32_le(*n_uname);
            }
            Self::Tattach { fid, afid, uname, aname, n_uname } => {
                buf.put_u32_le(*fid);
                buf.put_u32_le(*afid);
                put_str(buf, uname);
                put_str(buf, aname);
                buf.put_u32_le(*n_uname);
            }
            Self::Tflush { oldtag } => buf.put_u16_le(*oldtag),
            Self::Twalk { fid, newfid, wnames } => {
                buf.put_u32_le(*fid);
                buf.put_u32_le(*newfid);
                buf.put_u16_le(wnames.len() as u16);
                for name in wnames {
                    put_str(buf, name);
                }
            }
            Self::Rwalk { wqids } => {
                buf.put_u16_le(wqids.len() as u16);
                for qid in wqids {
                    put_qid(buf, qid);
                }
            }
            Self::Twrite { fid, offset, data } => {
                buf.put_u32_le(*fid);
                buf.put_u64_le(*offset);
                buf.put_u32_le(data.len() as u32);
                buf.put_slice(data);
            }
            Self::Rwrite { count } => buf.put_u32_le(*count),
            Self::Rrename
            | Self::Rsetattr
            | Self::Rxattrcreate
            | Self::Rfsync
            | Self::Rlink
            | Self::Rrenameat
            | Self::Runlinkat
            | Self::Rflush
            | Self::Rclunk
            | Self::Rremove
            | Self::Unknown { .. }
            | Self::Malformed { .. } => {}
        }
    }

    /// Decode a body of the given type. The whole body must be consumed.
    pub fn decode(kind: u8, body: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader { buf: body, kind };
        let fcall = r.fcall()?;
        if r.buf.has_remaining() {
            return Err(ProtocolError::TrailingBytes(kind));
        }
        Ok(fcall)
    }
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u16_le(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn put_qid(buf: &mut BytesMut, qid: &Qid) {
    buf.put_u8(qid.kind.0);
    buf.put_u32_le(qid.version);
    buf.put_u64_le(qid.path);
}

fn put_lock_range(buf: &mut BytesMut, lock: &LockRequest) {
    buf.put_u64_le(lock.start);
    buf.put_u64_le(lock.length);
    buf.put_u32_le(lock.proc_id);
    put_str(buf, &lock.client_id);
}

/// Wire size of one Rreaddir entry.
pub fn dirent_len(entry: &DirEntry) -> usize {
    QID_LEN + 8 + 1 + 2 + entry.name.len()
}

/// Append one Rreaddir entry: `qid[13] offset[8] type[1] name[s]`.
pub fn put_dirent(buf: &mut BytesMut, entry: &DirEntry) {
    put_qid(buf, &entry.qid);
    buf.put_u64_le(entry.offset);
    buf.put_u8(entry.kind);
    put_str(buf, &entry.name);
}

/// Split Rreaddir data back into entries.
pub fn parse_dirents(data: &[u8]) -> Result<Vec<DirEntry>, ProtocolError> {
    let mut r = Reader {
        buf: data,
        kind: kind::RREADDIR,
    };
    let mut entries = Vec::new();
    while r.buf.has_remaining() {
        entries.push(DirEntry {
            qid: r.qid()?,
            offset: r.u64()?,
            kind: r.u8()?,
            name: r.string()?,
        });
    }
    Ok(entries)
}

struct Reader<'a> {
    buf: &'a [u8],
    kind: u8,
}

impl Reader<'_> {
    fn need(&self, n: usize) -> Result<(), ProtocolError> {
        if self.buf.remaining() < n {
            return Err(ProtocolError::Truncated(self.kind));
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> Result<u16, ProtocolError> {
        self.need(2)?;
        Ok(self.buf.get_u16_le())
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    fn u64(&mut self) -> Result<u64, ProtocolError> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    fn bytes(&mut self, n: usize) -> Result<Vec<u8>, ProtocolError> {
        self.need(n)?;
        let out = self.buf[..n].to_vec();
        self.buf.advance(n);
        Ok(out)
    }

    fn string(&mut self) -> Result<String, ProtocolError> {
        let len = self.u16()? as usize;
        let raw = self.bytes(len)?;
        String::from_utf8(raw).map_err(|_| ProtocolError::InvalidUtf8)
    }

    fn data(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let count = self.u32()? as usize;
        self.bytes(count)
    }

    fn qid(&mut self) -> Result<Qid, ProtocolError> {
        Ok(Qid {
            kind: QidType(self.u8()?),
            version: self.u32()?,
            path: self.u64()?,
        })
    }

    fn timespec(&mut self) -> Result<Timespec, ProtocolError> {
        Ok(Timespec::new(self.u64()?, self.u64()?))
    }

    fn lock(&mut self, with_flags: bool) -> Result<LockRequest, ProtocolError> {
        let kind =
            LockType::from_u8(self.u8()?).ok_or(ProtocolError::InvalidField("lock type"))?;
        let flags = if with_flags { self.u32()? } else { 0 };
        Ok(LockRequest {
            kind,
            flags,
            start: self.u64()?,
            length: self.u64()?,
            proc_id: self.u32()?,
            client_id: self.string()?,
        })
    }

    fn fcall(&mut self) -> Result<Fcall, ProtocolError> {
        use kind::*;
        Ok(match self.kind {
            RLERROR => Fcall::Rlerror { ecode: self.u32()? },
            TSTATFS => Fcall::Tstatfs { fid: self.u32()? },
            RSTATFS => Fcall::Rstatfs {
                statfs: StatFs {
                    fs_type: self.u32()?,
                    bsize: self.u32()?,
                    blocks: self.u64()?,
                    bfree: self.u64()?,
                    bavail: self.u64()?,
                    files: self.u64()?,
                    ffree: self.u64()?,
                    fsid: self.u64()?,
                    namelen: self.u32()?,
                },
            },
            TLOPEN => Fcall::Tlopen {
                fid: self.u32()?,
                flags: self.u32()?,
            },
            RLOPEN => Fcall::Rlopen {
                qid: self.qid()?,
                iounit: self.u32()?,
            },
            TLCREATE => Fcall::Tlcreate {
                fid: self.u32()?,
                name: self.string()?,
                flags: self.u32()?,
                mode: self.u32()?,
                gid: self.u32()?,
            },
            RLCREATE => Fcall::Rlcreate {
                qid: self.qid()?,
                iounit: self.u32()?,
            },
            TSYMLINK => Fcall::Tsymlink {
                fid: self.u32()?,
                name: self.string()?,
                symtgt: self.string()?,
                gid: self.u32()?,
            },
            RSYMLINK => Fcall::Rsymlink { qid: self.qid()? },
            TMKNOD => Fcall::Tmknod {
                dfid: self.u32()?,
                name: self.string()?,
                mode: self.u32()?,
                major: self.u32()?,
                minor: self.u32()?,
                gid: self.u32()?,
            },
            RMKNOD => Fcall::Rmknod { qid: self.qid()? },
            TRENAME => Fcall::Trename {
                fid: self.u32()?,
                dfid: self.u32()?,
                name: self.string()?,
            },
            RRENAME => Fcall::Rrename,
            TREADLINK => Fcall::Treadlink { fid: self.u32()? },
            RREADLINK => Fcall::Rreadlink {
                target: self.string()?,
            },
            TGETATTR => Fcall::Tgetattr {
                fid: self.u32()?,
                request_mask: self.u64()?,
            },
            RGETATTR => {
                let valid = self.u64()?;
                let qid = self.qid()?;
                let attr = FileAttr {
                    mode: self.u32()?,
                    uid: self.u32()?,
                    gid: self.u32()?,
                    nlink: self.u64()?,
                    rdev: self.u64()?,
                    size: self.u64()?,
                    blksize: self.u64()?,
                    blocks: self.u64()?,
                    atime: self.timespec()?,
                    mtime: self.timespec()?,
                    ctime: self.timespec()?,
                    btime: self.timespec()?,
                };
                let _generation = self.u64()?;
                let _data_version = self.u64()?;
                Fcall::Rgetattr { valid, qid, attr }
            }
            TSETATTR => Fcall::Tsetattr {
                fid: self.u32()?,
                attr: SetAttrRequest {
                    valid: self.u32()?,
                    mode: self.u32()?,
                    uid: self.u32()?,
                    gid: self.u32()?,
                    size: self.u64()?,
                    atime: self.timespec()?,
                    mtime: self.timespec()?,
                },
            },
            RSETATTR => Fcall::Rsetattr,
            TXATTRWALK => Fcall::Txattrwalk {
                fid: self.u32()?,
                newfid: self.u32()?,
                name: self.string()?,
            },
            RXATTRWALK => Fcall::Rxattrwalk { size: self.u64()? },
            TXATTRCREATE => Fcall::Txattrcreate {
                fid: self.u32()?,
                name: self.string()?,
                attr_size: self.u64()?,
                flags: self.u32()?,
            },
            RXATTRCREATE => Fcall::Rxattrcreate,
            TREADDIR => Fcall::Treaddir {
                fid: self.u32()?,
                offset: self.u64()?,
                count: self.u32()?,
            },
            RREADDIR => Fcall::Rreaddir { data: self.data()? },
            TFSYNC => {
                let fid = self.u32()?;
                // Older clients omit datasync.
                let datasync = if self.buf.has_remaining() { self.u32()? } else { 0 };
                Fcall::Tfsync { fid, datasync }
            }
            RFSYNC => Fcall::Rfsync,
            TLOCK => Fcall::Tlock {
                fid: self.u32()?,
                lock: self.lock(true)?,
            },
            RLOCK => Fcall::Rlock { status: self.u8()? },
            TGETLOCK => Fcall::Tgetlock {
                fid: self.u32()?,
                lock: self.lock(false)?,
            },
            RGETLOCK => Fcall::Rgetlock {
                lock: self.lock(false)?,
            },
            TLINK => Fcall::Tlink {
                dfid: self.u32()?,
                fid: self.u32()?,
                name: self.string()?,
            },
            RLINK => Fcall::Rlink,
            TMKDIR => Fcall::Tmkdir {
                dfid: self.u32()?,
                name: self.string()?,
                mode: self.u32()?,
                gid: self.u32()?,
            },
            RMKDIR => Fcall::Rmkdir { qid: self.qid()? },
            TRENAMEAT => Fcall::Trenameat {
                olddirfid: self.u32()?,
                oldname: self.string()?,
                newdirfid: self.u32()?,
                newname: self.string()?,
            },
            RRENAMEAT => Fcall::Rrenameat,
            TUNLINKAT => Fcall::Tunlinkat {
                dirfd: self.u32()?,
                name: self.string()?,
                flags: self.u32()?,
            },
            RUNLINKAT => Fcall::Runlinkat,
            TVERSION => Fcall::Tversion {
                msize: self.u32()?,
                version: self.string()?,
            },
            RVERSION => Fcall::Rversion {
                msize: self.u32()?,
                version: self.string()?,
            },
            TAUTH => Fcall::Tauth {
                afid: self.u32()?,
                uname: self.string()?,
                aname: self.string()?,
                n_uname: self.u32()?,
            },
            RAUTH => Fcall::Rauth { aqid: self.qid()? },
            TATTACH => Fcall::Tattach {
                fid: self.u32()?,
                afid: self.u32()?,
                uname: self.string()?,
                aname: self.string()?,
                n_uname: self.u32()?,
            },
            RATTACH => Fcall::Rattach { qid: self.qid()? },
            TFLUSH => Fcall::Tflush {
                oldtag: self.u16()?,
            },
            RFLUSH => Fcall::Rflush,
            TWALK => {
                let fid = self.u32()?;
                let newfid = self.u32()?;
                let n = self.u16()? as usize;
                let wnames = (0..n).map(|_| self.string()).collect::<Result<Vec<_>, ProtocolError>>()?;
                Fcall::Twalk {
                    fid,
                    newfid,
                    wnames,
                }
            }
            RWALK => {
                let n = self.u16()? as usize;
                let wqids = (0..n).map(|_| self.qid()).collect::<Result<Vec<_>, ProtocolError>>()?;
                Fcall::Rwalk { wqids }
            }
            TREAD => Fcall::Tread {
                fid: self.u32()?,
                offset: self.u64()?,
                count: self.u32()?,
            },
            RREAD => Fcall::Rread { data: self.data()? },
            TWRITE => Fcall::Twrite {
                fid: self.u32()?,
                offset: self.u64()?,
                data: self.data()?,
            },
            RWRITE => Fcall::Rwrite { count: self.u32()? },
            TCLUNK => Fcall::Tclunk { fid: self.u32()? },
            RCLUNK => Fcall::Rclunk,
            TREMOVE => Fcall::Tremove { fid: self.u32()? },
            RREMOVE => Fcall::Rremove,
            other => {
                // Unknown bodies are skipped whole.
                self.buf.advance(self.buf.remaining());
                Fcall::Unknown { kind: other }
            }
        })
    }
}
