//! 9P2000.L request dispatcher.
//!
//! One [`serve`] call owns one connection and its fid table. Requests are
//! handled strictly in order: decode, dispatch to the backend, respond.

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use utsushi_vfs::{
    AttrMask, Backend, LockRequest, Node, OpenFlags, Qid, SetAttr, SetTime, VfsError, VfsResult,
};

use crate::codec::NinePCodec;
use crate::constants::{DEFAULT_MSIZE, XATTR_SIZE_MAX};
use crate::error::ServeError;
use crate::fcall::{
    Fcall, IOHDRSZ, MAXWELEM, Msg, SetAttrRequest, VERSION_9P2000_L, VERSION_UNKNOWN,
    dirent_len, put_dirent, setattr,
};

/// Serve-loop settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Largest message size the server will agree to.
    pub max_msize: u32,
    /// Log every request and reply at debug level.
    pub trace_requests: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_msize: DEFAULT_MSIZE,
            trace_requests: false,
        }
    }
}

/// Smallest Rreaddir entry: qid, offset, type and an empty name.
const MIN_DIRENT: u32 = 24;

enum Fid {
    Node(Arc<dyn Node>),
    /// Value (or name list) captured by Txattrwalk.
    XattrRead(Vec<u8>),
    /// Buffer filled by Twrite after Txattrcreate; committed on Tclunk.
    XattrWrite {
        node: Arc<dyn Node>,
        name: String,
        size: u64,
        flags: u32,
        data: Vec<u8>,
    },
}

fn bad_fid(fid: u32) -> VfsError {
    VfsError::not_open(format!("fid {fid}"))
}

struct Session {
    backend: Arc<dyn Backend>,
    fids: HashMap<u32, Fid>,
    msize: u32,
    max_msize: u32,
}

/// Serve one 9P2000.L connection until the peer closes it.
///
/// Returns `Ok(())` on a clean end of stream. Framing and transport errors
/// end the loop with [`ServeError`]; a request whose body fails to decode
/// gets `Rlerror(EINVAL)` and the loop carries on.
pub async fn serve<S>(
    stream: S,
    backend: Arc<dyn Backend>,
    config: ServerConfig,
) -> Result<(), ServeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, NinePCodec::new(config.max_msize));
    let mut session = Session {
        backend,
        fids: HashMap::new(),
        msize: config.max_msize,
        max_msize: config.max_msize,
    };

    while let Some(frame) = framed.next().await {
        let Msg { tag, body } = frame?;
        if config.trace_requests {
            tracing::debug!(tag, ?body, "9p <-");
        }

        let reply = session.dispatch(body).await;
        if config.trace_requests {
            tracing::debug!(tag, ?reply, "9p ->");
        }
        let negotiated = matches!(reply, Fcall::Rversion { .. });

        framed.send(Msg { tag, body: reply }).await?;
        if negotiated {
            framed.codec_mut().set_max_size(session.msize);
        }
    }

    tracing::debug!(open_fids = session.fids.len(), "9p connection closed");
    session.clunk_all().await;
    Ok(())
}

impl Session {
    async fn dispatch(&mut self, body: Fcall) -> Fcall {
        let kind = body.kind();
        match self.handle(body).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::debug!(kind, error = %e, "9p request failed");
                Fcall::Rlerror { ecode: e.errno() }
            }
        }
    }

    fn iounit(&self) -> u32 {
        self.msize.saturating_sub(IOHDRSZ)
    }

    fn node(&self, fid: u32) -> VfsResult<Arc<dyn Node>> {
        match self.fids.get(&fid) {
            Some(Fid::Node(node)) => Ok(Arc::clone(node)),
            _ => Err(bad_fid(fid)),
        }
    }

    /// `newfid` must be free, unless it is the source fid itself.
    fn check_newfid(&self, fid: u32, newfid: u32) -> VfsResult<()> {
        if newfid != fid && self.fids.contains_key(&newfid) {
            return Err(VfsError::not_open(format!("fid {newfid} already in use")));
        }
        Ok(())
    }

    async fn clunk_all(&mut self) {
        for (_, fid) in self.fids.drain() {
            if let Fid::Node(node) = fid {
                let _ = node.close().await;
            }
        }
    }

    async fn handle(&mut self, body: Fcall) -> VfsResult<Fcall> {
        match body {
            Fcall::Tversion { msize, version } => {
                self.clunk_all().await;
                self.msize = msize.min(self.max_msize);
                let version = if version.starts_with(VERSION_9P2000_L) {
                    VERSION_9P2000_L
                } else {
                    VERSION_UNKNOWN
                };
                tracing::debug!(msize = self.msize, version, "9p version negotiated");
                Ok(Fcall::Rversion {
                    msize: self.msize,
                    version: version.to_owned(),
                })
            }

            Fcall::Tauth { .. } => Err(VfsError::unsupported("auth")),

            Fcall::Tattach {
                fid, uname, aname, ..
            } => {
                if self.fids.contains_key(&fid) {
                    return Err(VfsError::not_open(format!("fid {fid} already in use")));
                }
                let root = self.backend.attach(&aname).await?;
                let (qid, _, _) = root.getattr(AttrMask::BASIC).await?;
                tracing::debug!(fid, uname, aname, "9p attach");
                self.fids.insert(fid, Fid::Node(root));
                Ok(Fcall::Rattach { qid })
            }

            // Requests complete before the next is read, so nothing is in flight.
            Fcall::Tflush { .. } => Ok(Fcall::Rflush),

            Fcall::Twalk {
                fid,
                newfid,
                wnames,
            } => {
                if wnames.len() > MAXWELEM {
                    return Err(VfsError::invalid_argument(format!(
                        "walk of {} names",
                        wnames.len()
                    )));
                }
                let node = self.node(fid)?;
                self.check_newfid(fid, newfid)?;
                let (qids, walked) = node.walk(&wnames).await?;
                let wqids: Vec<Qid> = if wnames.is_empty() { Vec::new() } else { qids };
                self.fids.insert(newfid, Fid::Node(walked));
                Ok(Fcall::Rwalk { wqids })
            }

            Fcall::Tread { fid, offset, count } => {
                let count = count.min(self.iounit());
                match self.fids.get(&fid) {
                    Some(Fid::Node(node)) => {
                        let data = node.read_at(offset, count).await?;
                        Ok(Fcall::Rread { data })
                    }
                    Some(Fid::XattrRead(value)) => {
                        let start = (offset.min(value.len() as u64)) as usize;
                        let end = start.saturating_add(count as usize).min(value.len());
                        Ok(Fcall::Rread {
                            data: value[start..end].to_vec(),
                        })
                    }
                    _ => Err(bad_fid(fid)),
                }
            }

            Fcall::Twrite { fid, offset, data } => match self.fids.get_mut(&fid) {
                Some(Fid::Node(node)) => {
                    let node = Arc::clone(node);
                    let count = node.write_at(&data, offset).await?;
                    Ok(Fcall::Rwrite { count })
                }
                Some(Fid::XattrWrite {
                    size, data: buf, ..
                }) => {
                    if offset != buf.len() as u64 || (buf.len() + data.len()) as u64 > *size {
                        return Err(VfsError::invalid_argument("xattr write out of range"));
                    }
                    buf.extend_from_slice(&data);
                    Ok(Fcall::Rwrite {
                        count: data.len() as u32,
                    })
                }
                _ => Err(bad_fid(fid)),
            },

            Fcall::Tclunk { fid } => match self.fids.remove(&fid) {
                Some(Fid::Node(node)) => {
                    node.close().await?;
                    Ok(Fcall::Rclunk)
                }
                Some(Fid::XattrRead(_)) => Ok(Fcall::Rclunk),
                Some(Fid::XattrWrite {
                    node,
                    name,
                    size,
                    flags,
                    data,
                }) => {
                    if size == 0 && data.is_empty() {
                        node.remove_xattr(&name).await?;
                    } else if data.len() as u64 != size {
                        return Err(VfsError::invalid_argument(format!(
                            "xattr {name}: wrote {} of {size} bytes",
                            data.len()
                        )));
                    } else {
                        node.set_xattr(&name, &data, flags).await?;
                    }
                    Ok(Fcall::Rclunk)
                }
                None => Err(bad_fid(fid)),
            },

            Fcall::Tremove { fid } => {
                // The fid is gone either way.
                if let Some(Fid::Node(node)) = self.fids.remove(&fid) {
                    let _ = node.close().await;
                }
                Err(VfsError::unsupported("remove"))
            }

            Fcall::Tstatfs { fid } => {
                let statfs = self.node(fid)?.statfs().await?;
                Ok(Fcall::Rstatfs { statfs })
            }

            Fcall::Tlopen { fid, flags } => {
                let (qid, iounit) = self.node(fid)?.open(OpenFlags(flags)).await?;
                Ok(Fcall::Rlopen {
                    qid,
                    iounit: if iounit == 0 { self.iounit() } else { iounit },
                })
            }

            Fcall::Tlcreate {
                fid,
                name,
                flags,
                mode,
                gid,
            } => {
                let dir = self.node(fid)?;
                let (node, qid, iounit) = dir.create(&name, OpenFlags(flags), mode, gid).await?;
                self.fids.insert(fid, Fid::Node(node));
                Ok(Fcall::Rlcreate {
                    qid,
                    iounit: if iounit == 0 { self.iounit() } else { iounit },
                })
            }

            Fcall::Tsymlink {
                fid,
                name,
                symtgt,
                gid,
            } => {
                let qid = self.node(fid)?.symlink(&name, &symtgt, gid).await?;
                Ok(Fcall::Rsymlink { qid })
            }

            Fcall::Tmknod {
                dfid,
                name,
                mode,
                major,
                minor,
                gid,
            } => {
                let qid = self
                    .node(dfid)?
                    .mknod(&name, mode, major, minor, gid)
                    .await?;
                Ok(Fcall::Rmknod { qid })
            }

            Fcall::Trename { fid, dfid, name } => {
                let node = self.node(fid)?;
                let dir = self.node(dfid)?;
                node.rename(dir.as_ref(), &name).await?;
                Ok(Fcall::Rrename)
            }

            Fcall::Treadlink { fid } => {
                let target = self.node(fid)?.readlink().await?;
                Ok(Fcall::Rreadlink { target })
            }

            Fcall::Tgetattr { fid, request_mask } => {
                let (qid, valid, attr) = self.node(fid)?.getattr(AttrMask(request_mask)).await?;
                Ok(Fcall::Rgetattr {
                    valid: valid.0,
                    qid,
                    attr,
                })
            }

            Fcall::Tsetattr { fid, attr } => {
                let node = self.node(fid)?;
                node.setattr(to_set_attr(&attr)).await?;
                Ok(Fcall::Rsetattr)
            }

            Fcall::Txattrwalk { fid, newfid, name } => {
                let node = self.node(fid)?;
                self.check_newfid(fid, newfid)?;
                let value = if name.is_empty() {
                    let mut list = Vec::new();
                    for attr in node.list_xattrs().await? {
                        list.extend_from_slice(attr.as_bytes());
                        list.push(0);
                    }
                    list
                } else {
                    node.get_xattr(&name).await?
                };
                let size = value.len() as u64;
                self.fids.insert(newfid, Fid::XattrRead(value));
                Ok(Fcall::Rxattrwalk { size })
            }

            Fcall::Txattrcreate {
                fid,
                name,
                attr_size,
                flags,
            } => {
                let node = self.node(fid)?;
                if attr_size > XATTR_SIZE_MAX {
                    return Err(VfsError::invalid_argument("xattr too large"));
                }
                self.fids.insert(
                    fid,
                    Fid::XattrWrite {
                        node,
                        name,
                        size: attr_size,
                        flags,
                        data: Vec::new(),
                    },
                );
                Ok(Fcall::Rxattrcreate)
            }

            Fcall::Treaddir { fid, offset, count } => {
                let node = self.node(fid)?;
                let budget = count.min(self.iounit()) as usize;
                let entries = node
                    .readdir(offset, (budget as u32 / MIN_DIRENT).max(1))
                    .await?;

                let mut data = BytesMut::with_capacity(budget);
                for entry in &entries {
                    if data.len() + dirent_len(entry) > budget {
                        break;
                    }
                    put_dirent(&mut data, entry);
                }
                Ok(Fcall::Rreaddir {
                    data: data.to_vec(),
                })
            }

            Fcall::Tfsync { fid, .. } => {
                self.node(fid)?.fsync().await?;
                Ok(Fcall::Rfsync)
            }

            Fcall::Tlock { fid, lock } => {
                let status = self.node(fid)?.lock(&lock).await?;
                Ok(Fcall::Rlock {
                    status: status.as_u8(),
                })
            }

            Fcall::Tgetlock { fid, lock } => {
                let lock: LockRequest = self.node(fid)?.getlock(&lock).await?;
                Ok(Fcall::Rgetlock { lock })
            }

            Fcall::Tlink { dfid, fid, name } => {
                let dir = self.node(dfid)?;
                let target = self.node(fid)?;
                dir.link(target.as_ref(), &name).await?;
                Ok(Fcall::Rlink)
            }

            Fcall::Tmkdir {
                dfid,
                name,
                mode,
                gid,
            } => {
                let qid = self.node(dfid)?.mkdir(&name, mode, gid).await?;
                Ok(Fcall::Rmkdir { qid })
            }

            Fcall::Trenameat {
                olddirfid,
                oldname,
                newdirfid,
                newname,
            } => {
                let old_dir = self.node(olddirfid)?;
                let new_dir = self.node(newdirfid)?;
                old_dir
                    .rename_at(&oldname, new_dir.as_ref(), &newname)
                    .await?;
                Ok(Fcall::Rrenameat)
            }

            Fcall::Tunlinkat { dirfd, name, flags } => {
                self.node(dirfd)?.unlink_at(&name, flags).await?;
                Ok(Fcall::Runlinkat)
            }

            Fcall::Malformed { kind, reason } => {
                tracing::warn!(kind, %reason, "malformed 9p message");
                Err(VfsError::invalid_argument(format!(
                    "malformed message type {kind}: {reason}"
                )))
            }

            other => {
                tracing::warn!(kind = other.kind(), "unexpected 9p message");
                Err(VfsError::unsupported(format!("message type {}", other.kind())))
            }
        }
    }
}

fn to_set_attr(req: &SetAttrRequest) -> SetAttr {
    let has = |bit: u32| req.valid & bit != 0;
    let time = |bit: u32, set_bit: u32, at| {
        if !has(bit) {
            None
        } else if has(set_bit) {
            Some(SetTime::At(at))
        } else {
            Some(SetTime::Now)
        }
    };
    SetAttr {
        mode: has(setattr::MODE).then_some(req.mode),
        uid: has(setattr::UID).then_some(req.uid),
        gid: has(setattr::GID).then_some(req.gid),
        size: has(setattr::SIZE).then_some(req.size),
        atime: time(setattr::ATIME, setattr::ATIME_SET, req.atime),
        mtime: time(setattr::MTIME, setattr::MTIME_SET, req.mtime),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use utsushi_vfs::Timespec;

    #[test]
    fn test_setattr_bits() {
        let req = SetAttrRequest {
            valid: setattr::SIZE | setattr::MTIME | setattr::MTIME_SET | setattr::ATIME,
            size: 10,
            mtime: Timespec::new(5, 6),
            mode: 0o777,
            ..Default::default()
        };
        let attr = to_set_attr(&req);
        assert_eq!(attr.size, Some(10));
        assert_eq!(attr.mode, None);
        assert_eq!(attr.mtime, Some(SetTime::At(Timespec::new(5, 6))));
        assert_eq!(attr.atime, Some(SetTime::Now));
    }

    #[test]
    fn test_empty_setattr() {
        assert!(to_set_attr(&SetAttrRequest::default()).is_empty());
    }
}
