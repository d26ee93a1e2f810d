//! Passthrough backend.
//!
//! Serves a live directory of the local filesystem. Every operation maps
//! onto the corresponding OS call; blocking syscalls run on the tokio
//! blocking pool.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rustix::fs::{AtFlags, FlockOperation, Mode, OFlags, Timestamps, cwd};
use std::any::Any;
use std::fs::{self, File};
use std::io;
use std::os::unix::fs::{DirBuilderExt, FileExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{VfsError, VfsResult};
use crate::ops::{Backend, Node, check_component, page};
use crate::owner;
use crate::types::{
    AT_REMOVEDIR, AttrMask, DirEntry, FileAttr, LockRequest, LockStatus, LockType, OpenFlags,
    Qid, SetAttr, SetTime, StatFs, Timespec, dirent_type,
};

/// Magic reported by Rstatfs, as the Linux v9fs client expects.
const V9FS_MAGIC: u32 = 0x0102_1997;

/// Live view of a local directory tree.
///
/// Walking `..` at the root stays at the root. Symlinks are never followed
/// while walking; they are reported as symlinks.
#[derive(Debug, Clone)]
pub struct PassthroughBackend {
    root: PathBuf,
}

impl PassthroughBackend {
    /// Serve the tree under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root: PathBuf = root.into();
        let root = root.canonicalize().unwrap_or(root);
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl Backend for PassthroughBackend {
    async fn attach(&self, aname: &str) -> VfsResult<Arc<dyn Node>> {
        tracing::debug!(root = %self.root.display(), aname, "passthrough attach");
        let root = Arc::new(self.root.clone());
        let node = PassthroughNode::new(root, self.root.clone(), None);
        node.lstat().await?;
        Ok(Arc::new(node))
    }
}

/// Handle onto one path under a [`PassthroughBackend`].
#[derive(Debug)]
pub struct PassthroughNode {
    root: Arc<PathBuf>,
    path: RwLock<PathBuf>,
    file: Mutex<Option<Arc<File>>>,
}

impl PassthroughNode {
    fn new(root: Arc<PathBuf>, path: PathBuf, file: Option<File>) -> Self {
        Self {
            root,
            path: RwLock::new(path),
            file: Mutex::new(file.map(Arc::new)),
        }
    }

    /// Current absolute path of the object.
    pub fn path(&self) -> PathBuf {
        self.path.read().clone()
    }

    fn child(&self, name: &str) -> VfsResult<PathBuf> {
        check_component(name)?;
        Ok(self.path().join(name))
    }

    fn open_file(&self) -> VfsResult<Arc<File>> {
        self.file
            .lock()
            .clone()
            .ok_or_else(|| VfsError::not_open(self.path().display().to_string()))
    }

    async fn lstat(&self) -> VfsResult<fs::Metadata> {
        let path = self.path();
        blocking(move || lstat(&path)).await
    }

    fn downcast(node: &dyn Node) -> VfsResult<&PassthroughNode> {
        node.as_any()
            .downcast_ref::<PassthroughNode>()
            .ok_or(VfsError::CrossDevice)
    }
}

/// Run a blocking filesystem call off the async worker threads.
async fn blocking<T, F>(f: F) -> VfsResult<T>
where
    F: FnOnce() -> VfsResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| VfsError::Io(io::Error::other(e)))?
}

fn lstat(path: &Path) -> VfsResult<fs::Metadata> {
    fs::symlink_metadata(path).map_err(|e| VfsError::from_io(e, path.display()))
}

fn qid_of(meta: &fs::Metadata) -> Qid {
    Qid::from_mode(meta.mode(), meta.ino())
}

fn attr_of(meta: &fs::Metadata) -> FileAttr {
    FileAttr {
        mode: meta.mode(),
        uid: meta.uid(),
        gid: meta.gid(),
        nlink: meta.nlink(),
        rdev: meta.rdev(),
        size: meta.size(),
        blksize: meta.blksize(),
        blocks: meta.blocks(),
        atime: Timespec::new(meta.atime() as u64, meta.atime_nsec() as u64),
        mtime: Timespec::new(meta.mtime() as u64, meta.mtime_nsec() as u64),
        ctime: Timespec::new(meta.ctime() as u64, meta.ctime_nsec() as u64),
        btime: meta
            .created()
            .map(Timespec::from_system_time)
            .unwrap_or_default(),
    }
}

fn timestamp(t: Option<SetTime>) -> rustix::fs::Timespec {
    match t {
        Some(SetTime::At(ts)) => rustix::fs::Timespec {
            tv_sec: ts.sec as rustix::fs::Secs,
            tv_nsec: ts.nsec as rustix::fs::Nsecs,
        },
        Some(SetTime::Now) => rustix::fs::Timespec {
            tv_sec: 0,
            tv_nsec: rustix::fs::UTIME_NOW,
        },
        None => rustix::fs::Timespec {
            tv_sec: 0,
            tv_nsec: rustix::fs::UTIME_OMIT,
        },
    }
}

fn access_oflags(flags: OpenFlags) -> OFlags {
    let mut oflags = match flags.access_mode() {
        OpenFlags::WRONLY => OFlags::WRONLY,
        OpenFlags::RDWR => OFlags::RDWR,
        _ => OFlags::RDONLY,
    };
    if flags.truncate() {
        oflags |= OFlags::TRUNC;
    }
    if flags.append() {
        oflags |= OFlags::APPEND;
    }
    oflags | OFlags::CLOEXEC
}

#[async_trait]
impl Node for PassthroughNode {
    async fn walk(&self, names: &[String]) -> VfsResult<(Vec<Qid>, Arc<dyn Node>)> {
        let root = Arc::clone(&self.root);
        let start = self.path();
        let names = names.to_vec();

        let (qids, path) = blocking(move || {
            let mut path = start;
            let mut qids = Vec::with_capacity(names.len().max(1));
            if names.is_empty() {
                qids.push(qid_of(&lstat(&path)?));
                return Ok((qids, path));
            }
            for name in &names {
                match name.as_str() {
                    "." => {}
                    ".." => {
                        if path != *root {
                            path.pop();
                        }
                    }
                    _ => {
                        check_component(name)?;
                        path.push(name);
                    }
                }
                qids.push(qid_of(&lstat(&path)?));
            }
            Ok((qids, path))
        })
        .await?;

        let node = PassthroughNode::new(Arc::clone(&self.root), path, None);
        Ok((qids, Arc::new(node)))
    }

    async fn open(&self, flags: OpenFlags) -> VfsResult<(Qid, u32)> {
        let path = self.path();
        let (qid, file) = blocking(move || {
            let meta = lstat(&path)?;
            if meta.is_dir() && flags.mutates() {
                return Err(VfsError::IsADirectory(path.display().to_string()));
            }
            let oflags = if meta.is_dir() {
                OFlags::RDONLY | OFlags::CLOEXEC
            } else {
                access_oflags(flags)
            };
            let fd = rustix::fs::open(&path, oflags, Mode::empty())?;
            Ok((qid_of(&meta), File::from(fd)))
        })
        .await?;

        *self.file.lock() = Some(Arc::new(file));
        Ok((qid, 0))
    }

    async fn close(&self) -> VfsResult<()> {
        self.file.lock().take();
        Ok(())
    }

    async fn read_at(&self, offset: u64, count: u32) -> VfsResult<Vec<u8>> {
        let file = self.open_file()?;
        blocking(move || {
            let mut buf = vec![0u8; count as usize];
            let n = file.read_at(&mut buf, offset)?;
            buf.truncate(n);
            Ok(buf)
        })
        .await
    }

    async fn readdir(&self, offset: u64, count: u32) -> VfsResult<Vec<DirEntry>> {
        let path = self.path();
        blocking(move || {
            let mut listing = Vec::new();
            for entry in fs::read_dir(&path).map_err(|e| VfsError::from_io(e, path.display()))? {
                let entry = entry?;
                // Entries removed while listing are skipped.
                let Ok(meta) = entry.metadata() else {
                    continue;
                };
                listing.push((entry.file_name().to_string_lossy().into_owned(), meta));
            }
            listing.sort_by(|a, b| a.0.cmp(&b.0));

            let entries = listing
                .into_iter()
                .enumerate()
                .map(|(i, (name, meta))| DirEntry {
                    qid: qid_of(&meta),
                    offset: i as u64 + 1,
                    kind: dirent_type(meta.mode()),
                    name,
                })
                .collect();
            Ok(page(entries, offset, count))
        })
        .await
    }

    async fn readlink(&self) -> VfsResult<String> {
        let path = self.path();
        blocking(move || {
            let target = fs::read_link(&path).map_err(|e| VfsError::from_io(e, path.display()))?;
            Ok(target.to_string_lossy().into_owned())
        })
        .await
    }

    async fn getattr(&self, _mask: AttrMask) -> VfsResult<(Qid, AttrMask, FileAttr)> {
        let meta = self.lstat().await?;
        Ok((qid_of(&meta), AttrMask::BASIC, attr_of(&meta)))
    }

    async fn statfs(&self) -> VfsResult<StatFs> {
        let path = self.path();
        blocking(move || {
            let stat = rustix::fs::statvfs(&path)?;
            Ok(StatFs {
                fs_type: V9FS_MAGIC,
                bsize: stat.f_bsize as u32,
                blocks: stat.f_blocks,
                bfree: stat.f_bfree,
                bavail: stat.f_bavail,
                files: stat.f_files,
                ffree: stat.f_ffree,
                fsid: stat.f_fsid,
                namelen: stat.f_namemax as u32,
            })
        })
        .await
    }

    async fn write_at(&self, data: &[u8], offset: u64) -> VfsResult<u32> {
        let file = self.open_file()?;
        let data = data.to_vec();
        blocking(move || {
            let n = file.write_at(&data, offset)?;
            Ok(n as u32)
        })
        .await
    }

    async fn create(
        &self,
        name: &str,
        flags: OpenFlags,
        mode: u32,
        gid: u32,
    ) -> VfsResult<(Arc<dyn Node>, Qid, u32)> {
        let path = self.child(name)?;
        tracing::trace!(path = %path.display(), mode, gid, "create");

        let target = path.clone();
        let (qid, file) = blocking(move || {
            let oflags = access_oflags(flags) | OFlags::CREATE | OFlags::EXCL;
            let fd = rustix::fs::open(&target, oflags, Mode::from_raw_mode(mode & 0o7777))?;
            let file = File::from(fd);
            let meta = file.metadata()?;
            Ok((qid_of(&meta), file))
        })
        .await?;

        let node = PassthroughNode::new(Arc::clone(&self.root), path, Some(file));
        Ok((Arc::new(node), qid, 0))
    }

    async fn mkdir(&self, name: &str, mode: u32, _gid: u32) -> VfsResult<Qid> {
        let path = self.child(name)?;
        blocking(move || {
            fs::DirBuilder::new()
                .mode(mode & 0o7777)
                .create(&path)
                .map_err(|e| VfsError::from_io(e, path.display()))?;
            Ok(qid_of(&lstat(&path)?))
        })
        .await
    }

    async fn symlink(&self, name: &str, target: &str, _gid: u32) -> VfsResult<Qid> {
        let path = self.child(name)?;
        let target = target.to_owned();
        blocking(move || {
            std::os::unix::fs::symlink(&target, &path)
                .map_err(|e| VfsError::from_io(e, path.display()))?;
            Ok(qid_of(&lstat(&path)?))
        })
        .await
    }

    async fn link(&self, target: &dyn Node, name: &str) -> VfsResult<()> {
        let original = Self::downcast(target)?.path();
        let link = self.child(name)?;
        blocking(move || {
            fs::hard_link(&original, &link).map_err(|e| VfsError::from_io(e, link.display()))
        })
        .await
    }

    async fn mknod(
        &self,
        name: &str,
        mode: u32,
        major: u32,
        minor: u32,
        _gid: u32,
    ) -> VfsResult<Qid> {
        let path = self.child(name)?;
        blocking(move || {
            rustix::fs::mknodat(
                cwd(),
                &path,
                rustix::fs::FileType::from_raw_mode(mode as rustix::fs::RawMode),
                Mode::from_raw_mode((mode & 0o7777) as rustix::fs::RawMode),
                rustix::fs::makedev(major, minor),
            )?;
            Ok(qid_of(&lstat(&path)?))
        })
        .await
    }

    async fn rename(&self, new_dir: &dyn Node, new_name: &str) -> VfsResult<()> {
        check_component(new_name)?;
        let from = self.path();
        let to = Self::downcast(new_dir)?.path().join(new_name);

        let dest = to.clone();
        blocking(move || fs::rename(&from, &dest).map_err(|e| VfsError::from_io(e, from.display())))
            .await?;
        *self.path.write() = to;
        Ok(())
    }

    async fn rename_at(&self, old_name: &str, new_dir: &dyn Node, new_name: &str) -> VfsResult<()> {
        let from = self.child(old_name)?;
        check_component(new_name)?;
        let to = Self::downcast(new_dir)?.path().join(new_name);
        blocking(move || fs::rename(&from, &to).map_err(|e| VfsError::from_io(e, from.display())))
            .await
    }

    async fn unlink_at(&self, name: &str, flags: u32) -> VfsResult<()> {
        let path = self.child(name)?;
        blocking(move || {
            let result = if flags & AT_REMOVEDIR != 0 {
                fs::remove_dir(&path)
            } else {
                fs::remove_file(&path)
            };
            result.map_err(|e| VfsError::from_io(e, path.display()))
        })
        .await
    }

    async fn setattr(&self, attr: SetAttr) -> VfsResult<()> {
        let path = self.path();
        let file = self.file.lock().clone();

        // Mode and ownership go last: earlier steps may need the privilege
        // those changes take away. Every failure is collected.
        blocking(move || {
            let mut errors = Vec::new();
            let shown = path.display();

            if let Some(size) = attr.size {
                let result = match &file {
                    Some(f) => f.set_len(size),
                    None => fs::OpenOptions::new()
                        .write(true)
                        .open(&path)
                        .and_then(|f| f.set_len(size)),
                };
                if let Err(e) = result {
                    errors.push(VfsError::from_io(e, format!("truncate {shown}")));
                }
            }

            if attr.atime.is_some() || attr.mtime.is_some() {
                let times = Timestamps {
                    last_access: timestamp(attr.atime),
                    last_modification: timestamp(attr.mtime),
                };
                if let Err(e) = rustix::fs::utimensat(cwd(), &path, &times, AtFlags::SYMLINK_NOFOLLOW)
                {
                    errors.push(VfsError::from(e));
                }
            }

            if let Some(mode) = attr.mode {
                let perms = fs::Permissions::from_mode(mode & 0o7777);
                if let Err(e) = fs::set_permissions(&path, perms) {
                    errors.push(VfsError::from_io(e, format!("chmod {shown}")));
                }
            }

            if let Some(gid) = attr.gid {
                if let Err(e) = owner::set_owner(&path, None, Some(gid)) {
                    errors.push(VfsError::from_io(e, format!("chgrp {shown}")));
                }
            }

            if let Some(uid) = attr.uid {
                if let Err(e) = owner::set_owner(&path, Some(uid), None) {
                    errors.push(VfsError::from_io(e, format!("chown {shown}")));
                }
            }

            VfsError::aggregate(errors)
        })
        .await
    }

    async fn fsync(&self) -> VfsResult<()> {
        let file = self.open_file()?;
        blocking(move || Ok(file.sync_all()?)).await
    }

    async fn lock(&self, request: &LockRequest) -> VfsResult<LockStatus> {
        // flock covers the whole file; byte ranges are not honoured.
        let file = self.open_file()?;
        let op = match (request.kind, request.blocking()) {
            (LockType::Read, false) => FlockOperation::NonBlockingLockShared,
            (LockType::Read, true) => FlockOperation::LockShared,
            (LockType::Write, false) => FlockOperation::NonBlockingLockExclusive,
            (LockType::Write, true) => FlockOperation::LockExclusive,
            (LockType::Unlock, _) => FlockOperation::Unlock,
        };
        blocking(move || match rustix::fs::flock(&*file, op) {
            Ok(()) => Ok(LockStatus::Ok),
            Err(e) if e == rustix::io::Errno::WOULDBLOCK => Ok(LockStatus::Blocked),
            Err(e) => Err(e.into()),
        })
        .await
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    async fn get_xattr(&self, name: &str) -> VfsResult<Vec<u8>> {
        let path = self.path();
        let name = name.to_owned();
        blocking(move || {
            let size = rustix::fs::lgetxattr(&path, name.as_str(), &mut [])?;
            let mut value = vec![0u8; size];
            let n = rustix::fs::lgetxattr(&path, name.as_str(), &mut value)?;
            value.truncate(n);
            Ok(value)
        })
        .await
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    async fn set_xattr(&self, name: &str, value: &[u8], flags: u32) -> VfsResult<()> {
        let path = self.path();
        let name = name.to_owned();
        let value = value.to_vec();
        blocking(move || {
            let flags = rustix::fs::XattrFlags::from_bits_truncate(flags);
            rustix::fs::lsetxattr(&path, name.as_str(), &value, flags)?;
            Ok(())
        })
        .await
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    async fn list_xattrs(&self) -> VfsResult<Vec<String>> {
        let path = self.path();
        blocking(move || {
            let size = rustix::fs::llistxattr(&path, &mut [])?;
            let mut raw: Vec<u8> = vec![0; size];
            let n = rustix::fs::llistxattr(&path, &mut raw)?;
            let bytes: Vec<u8> = raw[..n].iter().map(|&c| c as u8).collect();
            Ok(bytes
                .split(|&b| b == 0)
                .filter(|name| !name.is_empty())
                .map(|name| String::from_utf8_lossy(name).into_owned())
                .collect())
        })
        .await
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    async fn remove_xattr(&self, name: &str) -> VfsResult<()> {
        let path = self.path();
        let name = name.to_owned();
        blocking(move || {
            rustix::fs::lremovexattr(&path, name.as_str())?;
            Ok(())
        })
        .await
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
