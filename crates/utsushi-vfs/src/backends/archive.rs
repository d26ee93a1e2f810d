//! Archive backend.
//!
//! A read-only tree materialised from a CPIO archive. The archive is loaded
//! whole and indexed once; nodes are just an index into that table.

use async_trait::async_trait;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

use crate::cpio::{self, CpioEntry};
use crate::error::{VfsError, VfsResult};
use crate::ops::{Backend, Node, page};
use crate::types::{
    AttrMask, DirEntry, FileAttr, LockRequest, LockStatus, OpenFlags, Qid, S_IFDIR, S_IFMT,
    S_IFREG, SetAttr, StatFs, Timespec, dirent_type,
};

/// One indexed archive member.
#[derive(Debug, Clone)]
struct Record {
    /// Normalised path, `""` for the root.
    path: String,
    name: String,
    parent: usize,
    attr: FileAttr,
    data: Range<usize>,
    children: Vec<usize>,
}

#[derive(Debug)]
struct ArchiveIndex {
    bytes: Vec<u8>,
    records: Vec<Record>,
    by_path: HashMap<String, usize>,
}

/// Normalise a member name: leading `./` and `/` are dropped, `.` is the root.
fn normalise(name: &str) -> String {
    let parts: Vec<&str> = name
        .split('/')
        .filter(|p| !p.is_empty() && *p != ".")
        .collect();
    parts.join("/")
}

fn parent_of(path: &str) -> &str {
    path.rsplit_once('/').map_or("", |(parent, _)| parent)
}

fn encode_rdev(major: u32, minor: u32) -> u64 {
    let (major, minor) = (u64::from(major), u64::from(minor));
    ((major & 0xfff) << 8) | (minor & 0xff) | ((minor & !0xff) << 12) | ((major & !0xfff) << 32)
}

fn attr_of(entry: &CpioEntry, size: u64) -> FileAttr {
    let mtime = Timespec::new(u64::from(entry.mtime), 0);
    FileAttr {
        mode: entry.mode,
        uid: entry.uid,
        gid: entry.gid,
        nlink: u64::from(entry.nlink.max(1)),
        rdev: encode_rdev(entry.rdev_major, entry.rdev_minor),
        size,
        blksize: 512,
        blocks: size.div_ceil(512),
        atime: mtime,
        mtime,
        ctime: mtime,
        btime: mtime,
    }
}

fn synthetic_dir_attr() -> FileAttr {
    FileAttr {
        mode: S_IFDIR | 0o755,
        ..FileAttr::synthetic_dir()
    }
}

impl ArchiveIndex {
    fn build(bytes: Vec<u8>) -> VfsResult<Self> {
        let mut entries = cpio::parse(&bytes)?;
        link_hard_links(&mut entries);

        // Later members replace earlier ones with the same path.
        let mut tree: BTreeMap<String, (FileAttr, Range<usize>)> = BTreeMap::new();
        for entry in &entries {
            let path = normalise(&entry.name);
            let size = (entry.data.end - entry.data.start) as u64;
            tree.insert(path, (attr_of(entry, size), entry.data.clone()));
        }

        let missing: Vec<String> = tree
            .keys()
            .flat_map(|path| {
                let mut ancestors = Vec::new();
                let mut p = path.as_str();
                while !p.is_empty() {
                    p = parent_of(p);
                    ancestors.push(p.to_owned());
                }
                ancestors
            })
            .filter(|p| !tree.contains_key(p))
            .collect();
        for path in missing {
            tree.entry(path).or_insert_with(|| (synthetic_dir_attr(), 0..0));
        }
        tree.entry(String::new())
            .or_insert_with(|| (synthetic_dir_attr(), 0..0));

        let mut records: Vec<Record> = Vec::with_capacity(tree.len());
        let mut by_path = HashMap::with_capacity(tree.len());
        for (i, (path, (attr, data))) in tree.into_iter().enumerate() {
            let name = path.rsplit('/').next().unwrap_or_default().to_owned();
            by_path.insert(path.clone(), i);
            records.push(Record {
                path,
                name,
                parent: 0,
                attr,
                data,
                children: Vec::new(),
            });
        }

        for i in 1..records.len() {
            let parent = by_path
                .get(parent_of(&records[i].path))
                .copied()
                .unwrap_or(0);
            if records[parent].attr.mode & S_IFMT != S_IFDIR {
                return Err(VfsError::archive(format!(
                    "{} is inside non-directory {}",
                    records[i].path, records[parent].path
                )));
            }
            records[i].parent = parent;
            records[parent].children.push(i);
        }

        tracing::debug!(records = records.len(), bytes = bytes.len(), "indexed archive");
        Ok(Self {
            bytes,
            records,
            by_path,
        })
    }

    fn qid(&self, index: usize) -> Qid {
        Qid::from_mode(self.records[index].attr.mode, index as u64)
    }

    fn child(&self, dir: usize, name: &str) -> Option<usize> {
        let parent = &self.records[dir].path;
        let path = if parent.is_empty() {
            name.to_owned()
        } else {
            format!("{parent}/{name}")
        };
        self.by_path.get(&path).copied()
    }
}

/// Members of a hard-link group share the data of whichever one carries it.
fn link_hard_links(entries: &mut [CpioEntry]) {
    let mut carriers: HashMap<(u32, u32, u32), Range<usize>> = HashMap::new();
    for entry in entries.iter() {
        if entry.nlink > 1 && entry.mode & S_IFMT == S_IFREG && !entry.data.is_empty() {
            carriers.insert(
                (entry.dev_major, entry.dev_minor, entry.ino),
                entry.data.clone(),
            );
        }
    }
    for entry in entries.iter_mut() {
        if entry.nlink > 1 && entry.mode & S_IFMT == S_IFREG && entry.data.is_empty() {
            if let Some(data) = carriers.get(&(entry.dev_major, entry.dev_minor, entry.ino)) {
                entry.data = data.clone();
            }
        }
    }
}

/// Read-only file tree backed by an in-memory CPIO archive.
#[derive(Debug, Clone)]
pub struct ArchiveBackend {
    index: Arc<ArchiveIndex>,
}

impl ArchiveBackend {
    /// Load and index the archive at `path`.
    pub async fn open(path: impl AsRef<Path>) -> VfsResult<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| VfsError::from_io(e, path.display()))?;
        let backend = Self::from_bytes(bytes).map_err(|e| match e {
            VfsError::Archive(msg) => VfsError::archive(format!("{}: {msg}", path.display())),
            other => other,
        })?;
        tracing::info!(path = %path.display(), "opened archive");
        Ok(backend)
    }

    /// Index an archive already held in memory.
    pub fn from_bytes(bytes: Vec<u8>) -> VfsResult<Self> {
        Ok(Self {
            index: Arc::new(ArchiveIndex::build(bytes)?),
        })
    }

    /// Number of indexed records, synthesised directories included.
    pub fn len(&self) -> usize {
        self.index.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.records.len() <= 1
    }
}

#[async_trait]
impl Backend for ArchiveBackend {
    async fn attach(&self, _aname: &str) -> VfsResult<Arc<dyn Node>> {
        Ok(Arc::new(ArchiveNode {
            index: Arc::clone(&self.index),
            record: 0,
        }))
    }
}

/// Handle onto one archive record.
#[derive(Debug)]
pub struct ArchiveNode {
    index: Arc<ArchiveIndex>,
    record: usize,
}

impl ArchiveNode {
    fn record(&self) -> &Record {
        &self.index.records[self.record]
    }

    fn is_dir(&self) -> bool {
        self.record().attr.is_dir()
    }

    fn data(&self) -> &[u8] {
        &self.index.bytes[self.record().data.clone()]
    }

    fn read_only(op: &str) -> VfsError {
        VfsError::unsupported(format!("{op} on read-only archive"))
    }
}

#[async_trait]
impl Node for ArchiveNode {
    async fn walk(&self, names: &[String]) -> VfsResult<(Vec<Qid>, Arc<dyn Node>)> {
        let index = &self.index;
        let mut current = self.record;
        let mut qids = Vec::with_capacity(names.len().max(1));

        if names.is_empty() {
            qids.push(index.qid(current));
        }
        for name in names {
            current = match name.as_str() {
                "." => current,
                ".." => index.records[current].parent,
                _ => {
                    if !index.records[current].attr.is_dir() {
                        return Err(VfsError::NotADirectory(index.records[current].path.clone()));
                    }
                    index
                        .child(current, name)
                        .ok_or_else(|| VfsError::not_found(name.clone()))?
                }
            };
            qids.push(index.qid(current));
        }

        let node = ArchiveNode {
            index: Arc::clone(index),
            record: current,
        };
        Ok((qids, Arc::new(node)))
    }

    async fn open(&self, flags: OpenFlags) -> VfsResult<(Qid, u32)> {
        if flags.mutates() {
            return Err(Self::read_only("open for write"));
        }
        Ok((self.index.qid(self.record), 0))
    }

    async fn close(&self) -> VfsResult<()> {
        Ok(())
    }

    async fn read_at(&self, offset: u64, count: u32) -> VfsResult<Vec<u8>> {
        if self.is_dir() {
            return Err(VfsError::IsADirectory(self.record().path.clone()));
        }
        let data = self.data();
        let start = (offset.min(data.len() as u64)) as usize;
        let end = start.saturating_add(count as usize).min(data.len());
        Ok(data[start..end].to_vec())
    }

    async fn readdir(&self, offset: u64, count: u32) -> VfsResult<Vec<DirEntry>> {
        if !self.is_dir() {
            return Err(VfsError::NotADirectory(self.record().path.clone()));
        }
        let index = &self.index;
        let entries = self
            .record()
            .children
            .iter()
            .enumerate()
            .map(|(i, &child)| {
                let record = &index.records[child];
                DirEntry {
                    qid: index.qid(child),
                    offset: i as u64 + 1,
                    kind: dirent_type(record.attr.mode),
                    name: record.name.clone(),
                }
            })
            .collect();
        Ok(page(entries, offset, count))
    }

    async fn readlink(&self) -> VfsResult<String> {
        if !self.record().attr.is_symlink() {
            return Err(VfsError::invalid_argument(format!(
                "{} is not a symlink",
                self.record().path
            )));
        }
        Ok(String::from_utf8_lossy(self.data()).into_owned())
    }

    async fn getattr(&self, _mask: AttrMask) -> VfsResult<(Qid, AttrMask, FileAttr)> {
        Ok((
            self.index.qid(self.record),
            AttrMask::BASIC,
            self.record().attr.clone(),
        ))
    }

    async fn statfs(&self) -> VfsResult<StatFs> {
        Err(Self::read_only("statfs"))
    }

    async fn write_at(&self, _data: &[u8], _offset: u64) -> VfsResult<u32> {
        Err(Self::read_only("write"))
    }

    async fn create(
        &self,
        _name: &str,
        _flags: OpenFlags,
        _mode: u32,
        _gid: u32,
    ) -> VfsResult<(Arc<dyn Node>, Qid, u32)> {
        Err(Self::read_only("create"))
    }

    async fn mkdir(&self, _name: &str, _mode: u32, _gid: u32) -> VfsResult<Qid> {
        Err(Self::read_only("mkdir"))
    }

    async fn symlink(&self, _name: &str, _target: &str, _gid: u32) -> VfsResult<Qid> {
        Err(Self::read_only("symlink"))
    }

    async fn link(&self, _target: &dyn Node, _name: &str) -> VfsResult<()> {
        Err(Self::read_only("link"))
    }

    async fn mknod(
        &self,
        _name: &str,
        _mode: u32,
        _major: u32,
        _minor: u32,
        _gid: u32,
    ) -> VfsResult<Qid> {
        Err(Self::read_only("mknod"))
    }

    async fn rename(&self, _new_dir: &dyn Node, _new_name: &str) -> VfsResult<()> {
        Err(Self::read_only("rename"))
    }

    async fn rename_at(
        &self,
        _old_name: &str,
        _new_dir: &dyn Node,
        _new_name: &str,
    ) -> VfsResult<()> {
        Err(Self::read_only("renameat"))
    }

    async fn unlink_at(&self, _name: &str, _flags: u32) -> VfsResult<()> {
        Err(Self::read_only("unlinkat"))
    }

    async fn setattr(&self, _attr: SetAttr) -> VfsResult<()> {
        Err(Self::read_only("setattr"))
    }

    async fn lock(&self, _request: &LockRequest) -> VfsResult<LockStatus> {
        // Nothing can change underneath a reader.
        Ok(LockStatus::Ok)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
