//! Union backend.
//!
//! An ordered list of `(prefix, backend)` mounts presented as one tree.
//! Paths owned by a mount are delegated to that backend's own nodes;
//! directories that exist only because a longer prefix passes through them
//! are synthesised here.
//!
//! `..` is resolved against the union path only while a walk is still in
//! union hands. A node returned from a mount belongs to that backend, so a
//! later walk of `..` from the mount's root stays at that root, the same as
//! `..` at the root of the backend itself.

use async_trait::async_trait;
use std::any::Any;
use std::collections::HashSet;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::error::{VfsError, VfsResult};
use crate::ops::{Backend, Node, check_component, page};
use crate::types::{
    AttrMask, DirEntry, FileAttr, OpenFlags, Qid, QidType, SetAttr, StatFs,
};

const READDIR_BATCH: u32 = 1024;

/// One union member: a backend grafted at `prefix`.
#[derive(Clone)]
pub struct UnionMount {
    pub prefix: Vec<String>,
    pub backend: Arc<dyn Backend>,
}

impl UnionMount {
    /// Mount `backend` at a slash-separated `prefix` (`""` or `/` is the root).
    pub fn new(prefix: &str, backend: Arc<dyn Backend>) -> Self {
        let prefix = prefix
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect();
        Self { prefix, backend }
    }
}

impl std::fmt::Debug for UnionMount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnionMount")
            .field("prefix", &self.prefix.join("/"))
            .finish_non_exhaustive()
    }
}

/// How a union path is served.
#[derive(Debug, PartialEq, Eq)]
enum Resolution {
    /// Walk `rest` inside the root of mount `mount`.
    Delegate { mount: usize, rest: Vec<String> },
    /// Synthetic directory; lists the given mounts in order.
    Synthetic { reachable: Vec<usize> },
}

#[derive(Debug)]
struct Mounts(Vec<UnionMount>);

impl Mounts {
    fn resolve(&self, path: &[String]) -> VfsResult<Resolution> {
        let mounts = &self.0;

        let extends = |m: &UnionMount| m.prefix.len() > path.len() && m.prefix.starts_with(path);
        let covers = |m: &UnionMount| m.prefix.len() <= path.len() && path.starts_with(&m.prefix);
        let ancestor = |m: &UnionMount| m.prefix.len() < path.len() && path.starts_with(&m.prefix);

        // A longer prefix passing through forces a merged directory, even
        // over a mount sitting exactly here.
        if (path.is_empty() && !mounts.iter().any(covers)) || mounts.iter().any(extends) {
            let reachable = mounts
                .iter()
                .enumerate()
                .filter(|&(_, m)| extends(m) || covers(m))
                .map(|(i, _)| i)
                .collect();
            return Ok(Resolution::Synthetic { reachable });
        }

        if let Some(mount) = mounts.iter().position(|m| m.prefix == path) {
            return Ok(Resolution::Delegate {
                mount,
                rest: Vec::new(),
            });
        }

        if let Some(mount) = mounts.iter().position(ancestor) {
            let rest = path[mounts[mount].prefix.len()..].to_vec();
            return Ok(Resolution::Delegate { mount, rest });
        }

        Err(VfsError::not_found(format!("/{}", path.join("/"))))
    }

    async fn delegate(&self, mount: usize, rest: &[String]) -> VfsResult<(Qid, Arc<dyn Node>)> {
        let root = self.0[mount].backend.attach("").await?;
        let (qids, node) = root.walk(rest).await?;
        let qid = qids
            .last()
            .copied()
            .ok_or_else(|| VfsError::not_found(rest.join("/")))?;
        Ok((qid, node))
    }
}

fn synthetic_qid(path: &[String]) -> Qid {
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    Qid::new(QidType::DIR, hasher.finish() | (1 << 63))
}

fn dirent_kind(qid: Qid) -> u8 {
    if qid.kind.is_dir() {
        4
    } else if qid.kind.is_symlink() {
        10
    } else {
        8
    }
}

/// Ordered union of mounts. Earlier mounts win on overlap.
#[derive(Debug, Clone)]
pub struct UnionBackend {
    mounts: Arc<Mounts>,
}

impl UnionBackend {
    pub fn new(mounts: Vec<UnionMount>) -> Self {
        Self {
            mounts: Arc::new(Mounts(mounts)),
        }
    }

    pub fn mounts(&self) -> &[UnionMount] {
        &self.mounts.0
    }
}

#[async_trait]
impl Backend for UnionBackend {
    async fn attach(&self, _aname: &str) -> VfsResult<Arc<dyn Node>> {
        match self.mounts.resolve(&[])? {
            Resolution::Delegate { mount, rest } => {
                let (_, node) = self.mounts.delegate(mount, &rest).await?;
                Ok(node)
            }
            Resolution::Synthetic { .. } => Ok(Arc::new(UnionDir {
                mounts: Arc::clone(&self.mounts),
                at: Vec::new(),
            })),
        }
    }
}

/// A directory that exists only in the union.
#[derive(Debug)]
pub struct UnionDir {
    mounts: Arc<Mounts>,
    at: Vec<String>,
}

impl UnionDir {
    fn qid(&self) -> Qid {
        synthetic_qid(&self.at)
    }

    fn synthetic(op: &str) -> VfsError {
        VfsError::unsupported(format!("{op} on synthetic directory"))
    }

    /// Full listing of one ancestor mount's view of this directory.
    async fn ancestor_listing(&self, mount: usize) -> VfsResult<Vec<DirEntry>> {
        let rest = &self.at[self.mounts.0[mount].prefix.len()..];
        let (_, node) = self.mounts.delegate(mount, rest).await?;
        let mut all = Vec::new();
        let mut offset = 0;
        loop {
            let batch = node.readdir(offset, READDIR_BATCH).await?;
            let Some(last) = batch.last() else {
                break;
            };
            offset = last.offset;
            all.extend(batch);
        }
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }
}

#[async_trait]
impl Node for UnionDir {
    async fn walk(&self, names: &[String]) -> VfsResult<(Vec<Qid>, Arc<dyn Node>)> {
        if names.is_empty() {
            let clone = UnionDir {
                mounts: Arc::clone(&self.mounts),
                at: self.at.clone(),
            };
            return Ok((vec![self.qid()], Arc::new(clone)));
        }

        let mut path = self.at.clone();
        let mut qids = Vec::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            match name.as_str() {
                "." => {}
                ".." => {
                    path.pop();
                }
                _ => {
                    check_component(name)?;
                    path.push(name.clone());
                }
            }

            match self.mounts.resolve(&path)? {
                Resolution::Synthetic { .. } => qids.push(synthetic_qid(&path)),
                Resolution::Delegate { mount, rest } => {
                    let (qid, node) = self.mounts.delegate(mount, &rest).await?;
                    qids.push(qid);
                    let remaining = &names[i + 1..];
                    if remaining.is_empty() {
                        return Ok((qids, node));
                    }
                    // A later `..` may climb back out of the mount, so keep
                    // resolving against the union path until none is left.
                    if remaining.iter().any(|n| n == "..") {
                        continue;
                    }
                    let (more, node) = node.walk(remaining).await?;
                    qids.extend(more);
                    return Ok((qids, node));
                }
            }
        }

        let node = UnionDir {
            mounts: Arc::clone(&self.mounts),
            at: path,
        };
        Ok((qids, Arc::new(node)))
    }

    async fn open(&self, flags: OpenFlags) -> VfsResult<(Qid, u32)> {
        if flags.mutates() {
            return Err(Self::synthetic("open for write"));
        }
        Ok((self.qid(), 0))
    }

    async fn close(&self) -> VfsResult<()> {
        Ok(())
    }

    async fn read_at(&self, _offset: u64, _count: u32) -> VfsResult<Vec<u8>> {
        Err(Self::synthetic("read"))
    }

    async fn readdir(&self, offset: u64, count: u32) -> VfsResult<Vec<DirEntry>> {
        let reachable = match self.mounts.resolve(&self.at)? {
            Resolution::Synthetic { reachable } => reachable,
            Resolution::Delegate { .. } => Vec::new(),
        };

        let mut listing = vec![DirEntry {
            qid: self.qid(),
            offset: 0,
            kind: 4,
            name: ".".to_owned(),
        }];
        let mut seen: HashSet<String> = HashSet::from([".".to_owned()]);

        for mount in reachable {
            let prefix = &self.mounts.0[mount].prefix;
            if prefix.len() > self.at.len() {
                let name = prefix[self.at.len()].clone();
                if seen.contains(&name) {
                    continue;
                }
                let (qids, _) = self.walk(std::slice::from_ref(&name)).await?;
                let qid = qids[0];
                seen.insert(name.clone());
                listing.push(DirEntry {
                    qid,
                    offset: 0,
                    kind: dirent_kind(qid),
                    name,
                });
                continue;
            }

            let entries = match self.ancestor_listing(mount).await {
                Ok(entries) => entries,
                Err(VfsError::NotFound(_)) | Err(VfsError::NotADirectory(_)) => continue,
                Err(e) => return Err(e),
            };
            for entry in entries {
                if entry.name == "." || entry.name == ".." || !seen.insert(entry.name.clone()) {
                    continue;
                }
                listing.push(entry);
            }
        }

        for (i, entry) in listing.iter_mut().enumerate() {
            entry.offset = i as u64 + 1;
        }
        Ok(page(listing, offset, count))
    }

    async fn readlink(&self) -> VfsResult<String> {
        Err(Self::synthetic("readlink"))
    }

    async fn getattr(&self, _mask: AttrMask) -> VfsResult<(Qid, AttrMask, FileAttr)> {
        Ok((self.qid(), AttrMask::BASIC, FileAttr::synthetic_dir()))
    }

    async fn statfs(&self) -> VfsResult<StatFs> {
        Err(Self::synthetic("statfs"))
    }

    async fn write_at(&self, _data: &[u8], _offset: u64) -> VfsResult<u32> {
        Err(Self::synthetic("write"))
    }

    async fn create(
        &self,
        _name: &str,
        _flags: OpenFlags,
        _mode: u32,
        _gid: u32,
    ) -> VfsResult<(Arc<dyn Node>, Qid, u32)> {
        Err(Self::synthetic("create"))
    }

    async fn mkdir(&self, _name: &str, _mode: u32, _gid: u32) -> VfsResult<Qid> {
        Err(Self::synthetic("mkdir"))
    }

    async fn symlink(&self, _name: &str, _target: &str, _gid: u32) -> VfsResult<Qid> {
        Err(Self::synthetic("symlink"))
    }

    async fn link(&self, _target: &dyn Node, _name: &str) -> VfsResult<()> {
        Err(Self::synthetic("link"))
    }

    async fn mknod(
        &self,
        _name: &str,
        _mode: u32,
        _major: u32,
        _minor: u32,
        _gid: u32,
    ) -> VfsResult<Qid> {
        Err(Self::synthetic("mknod"))
    }

    async fn rename(&self, _new_dir: &dyn Node, _new_name: &str) -> VfsResult<()> {
        Err(Self::synthetic("rename"))
    }

    async fn rename_at(
        &self,
        _old_name: &str,
        _new_dir: &dyn Node,
        _new_name: &str,
    ) -> VfsResult<()> {
        Err(Self::synthetic("renameat"))
    }

    async fn unlink_at(&self, _name: &str, _flags: u32) -> VfsResult<()> {
        Err(Self::synthetic("unlinkat"))
    }

    async fn setattr(&self, _attr: SetAttr) -> VfsResult<()> {
        Err(Self::synthetic("setattr"))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
