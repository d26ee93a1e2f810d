//! File-tree backend contract.
//!
//! A [`Backend`] hands out a root [`Node`] on attach; every other object is
//! reached by walking from there. Nodes are handle-shaped: each one is bound
//! to a single filesystem object and is owned by the protocol session that
//! walked to it.

use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;

use crate::error::{VfsError, VfsResult};
use crate::types::{
    AttrMask, DirEntry, FileAttr, LockRequest, LockStatus, LockType, OpenFlags, Qid, SetAttr,
    StatFs,
};

/// A served file tree.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Return a handle to the root of the tree.
    ///
    /// `aname` is the attach name sent by the client; backends are free to
    /// ignore it.
    async fn attach(&self, aname: &str) -> VfsResult<Arc<dyn Node>>;
}

/// A handle bound to one filesystem object.
///
/// Methods take `&self`; nodes that carry mutable state (an open file,
/// a path that changes on rename) keep it behind a lock.
#[async_trait]
pub trait Node: Send + Sync {
    // ========================================================================
    // Navigation
    // ========================================================================

    /// Resolve `names` one component at a time.
    ///
    /// With no names, returns this node's own QID and a fresh handle to the
    /// same object. Otherwise returns exactly one QID per name. Any miss fails
    /// the whole walk; no partial result is returned.
    async fn walk(&self, names: &[String]) -> VfsResult<(Vec<Qid>, Arc<dyn Node>)>;

    /// Prepare the object for I/O. Returns its QID and an I/O unit
    /// (0 lets the server pick one from the negotiated message size).
    async fn open(&self, flags: OpenFlags) -> VfsResult<(Qid, u32)>;

    /// Release any resources held by the handle.
    async fn close(&self) -> VfsResult<()>;

    // ========================================================================
    // Reading
    // ========================================================================

    /// Read up to `count` bytes at `offset`. Returns fewer at end of file.
    async fn read_at(&self, offset: u64, count: u32) -> VfsResult<Vec<u8>>;

    /// List directory entries starting at the entry cookie `offset`,
    /// returning at most `count` entries.
    async fn readdir(&self, offset: u64, count: u32) -> VfsResult<Vec<DirEntry>>;

    async fn readlink(&self) -> VfsResult<String>;

    async fn getattr(&self, mask: AttrMask) -> VfsResult<(Qid, AttrMask, FileAttr)>;

    async fn statfs(&self) -> VfsResult<StatFs>;

    // ========================================================================
    // Writing
    // ========================================================================

    async fn write_at(&self, data: &[u8], offset: u64) -> VfsResult<u32>;

    /// Create and open `name` inside this directory.
    ///
    /// Returns the new, already open handle that replaces this one.
    async fn create(
        &self,
        name: &str,
        flags: OpenFlags,
        mode: u32,
        gid: u32,
    ) -> VfsResult<(Arc<dyn Node>, Qid, u32)>;

    async fn mkdir(&self, name: &str, mode: u32, gid: u32) -> VfsResult<Qid>;

    /// Create `name` in this directory as a symlink pointing at `target`.
    async fn symlink(&self, name: &str, target: &str, gid: u32) -> VfsResult<Qid>;

    /// Create `name` in this directory as a hard link to `target`.
    async fn link(&self, target: &dyn Node, name: &str) -> VfsResult<()>;

    async fn mknod(&self, name: &str, mode: u32, major: u32, minor: u32, gid: u32)
    -> VfsResult<Qid>;

    /// Move this object into `new_dir` under `new_name`.
    async fn rename(&self, new_dir: &dyn Node, new_name: &str) -> VfsResult<()>;

    /// Move `old_name` in this directory to `new_name` in `new_dir`.
    async fn rename_at(&self, old_name: &str, new_dir: &dyn Node, new_name: &str)
    -> VfsResult<()>;

    async fn unlink_at(&self, name: &str, flags: u32) -> VfsResult<()>;

    async fn setattr(&self, attr: SetAttr) -> VfsResult<()>;

    async fn fsync(&self) -> VfsResult<()> {
        Ok(())
    }

    // ========================================================================
    // Locks and extended attributes
    // ========================================================================

    async fn lock(&self, _request: &LockRequest) -> VfsResult<LockStatus> {
        Err(VfsError::unsupported("lock"))
    }

    /// Report a conflicting lock, or the request back with [`LockType::Unlock`]
    /// when there is none.
    async fn getlock(&self, request: &LockRequest) -> VfsResult<LockRequest> {
        Ok(LockRequest {
            kind: LockType::Unlock,
            ..request.clone()
        })
    }

    async fn get_xattr(&self, _name: &str) -> VfsResult<Vec<u8>> {
        Err(VfsError::unsupported("getxattr"))
    }

    async fn set_xattr(&self, _name: &str, _value: &[u8], _flags: u32) -> VfsResult<()> {
        Err(VfsError::unsupported("setxattr"))
    }

    async fn list_xattrs(&self) -> VfsResult<Vec<String>> {
        Err(VfsError::unsupported("listxattr"))
    }

    async fn remove_xattr(&self, _name: &str) -> VfsResult<()> {
        Err(VfsError::unsupported("removexattr"))
    }

    /// Access to the concrete node, for operations that pair two handles of
    /// the same backend.
    fn as_any(&self) -> &dyn Any;
}

/// Validate a single path component received from a client.
pub(crate) fn check_component(name: &str) -> VfsResult<()> {
    if name.is_empty() || name.contains('/') || name.contains('\0') {
        return Err(VfsError::invalid_argument(format!("bad name {name:?}")));
    }
    Ok(())
}

/// Slice a full listing according to a readdir cookie and count.
pub(crate) fn page(entries: Vec<DirEntry>, offset: u64, count: u32) -> Vec<DirEntry> {
    entries
        .into_iter()
        .skip(offset as usize)
        .take(count as usize)
        .collect()
}
