//! File-tree backends for the utsushi back-channel.
//!
//! Everything a 9P2000.L server needs to present a tree, without any wire
//! concerns:
//!
//! - [`Backend`] / [`Node`] - the handle-shaped file-operations contract
//! - [`PassthroughBackend`] - live view of a local directory
//! - [`ArchiveBackend`] - read-only view of a CPIO archive
//! - [`UnionBackend`] - ordered `(prefix, backend)` mounts as one tree
//!
//! ## Design Decisions
//!
//! - **Handles, not paths**: a [`Node`] is bound to one object and carries
//!   its own open state, matching 9P fids one-to-one.
//! - **Fresh QIDs**: identities are recomputed from the backing store on
//!   every lookup (inode, archive index, or a hash of the union path).
//! - **Delegation below divergence**: once a union path resolves to one
//!   mount, the caller holds that backend's own node.

pub mod backends;
pub mod cpio;
mod error;
mod ops;
#[cfg_attr(not(unix), allow(dead_code))]
mod owner;
mod types;

pub use backends::{ArchiveBackend, UnionBackend, UnionMount};
#[cfg(unix)]
pub use backends::PassthroughBackend;
pub use error::{VfsError, VfsResult, errno};
pub use ops::{Backend, Node};
pub use types::{
    AT_REMOVEDIR, AttrMask, DirEntry, FileAttr, LOCK_FLAGS_BLOCK, LockRequest, LockStatus,
    LockType, OpenFlags, Qid, QidType, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG, SetAttr, SetTime,
    StatFs, Timespec, dirent_type,
};
