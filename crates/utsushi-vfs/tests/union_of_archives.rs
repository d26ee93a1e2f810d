//! End-to-end behaviour of the three backends composed together.

use std::sync::Arc;

use utsushi_vfs::cpio::CpioWriter;
use utsushi_vfs::{
    ArchiveBackend, AttrMask, Backend, Node, OpenFlags, PassthroughBackend, SetAttr,
    UnionBackend, UnionMount, VfsError,
};

fn names(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

fn archive_a() -> Arc<dyn Backend> {
    let bytes = CpioWriter::new()
        .file("b/c/hi", 0o644, b"hi\n")
        .dir("root", 0o700)
        .symlink("hosts", "/etc/hosts")
        .finish();
    Arc::new(ArchiveBackend::from_bytes(bytes).unwrap())
}

fn archive_b() -> Arc<dyn Backend> {
    let bytes = CpioWriter::new().file("b", 0o644, b"from b\n").finish();
    Arc::new(ArchiveBackend::from_bytes(bytes).unwrap())
}

#[tokio::test]
async fn archive_read_at_offset() {
    let root = archive_a().attach("").await.unwrap();
    let (qids, hi) = root.walk(&names(&["b", "c", "hi"])).await.unwrap();
    assert_eq!(qids.len(), 3);
    hi.open(OpenFlags::read_only()).await.unwrap();
    assert_eq!(hi.read_at(1, 2).await.unwrap(), b"i\n");
}

#[tokio::test]
async fn archive_file_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a.cpio");
    std::fs::write(
        &path,
        CpioWriter::new().file("x", 0o644, b"disk").finish(),
    )
    .unwrap();

    let backend = ArchiveBackend::open(&path).await.unwrap();
    let root = backend.attach("").await.unwrap();
    let (_, x) = root.walk(&names(&["x"])).await.unwrap();
    assert_eq!(x.read_at(0, 10).await.unwrap(), b"disk");

    assert!(ArchiveBackend::open(dir.path().join("missing.cpio")).await.is_err());
}

#[tokio::test]
async fn union_root_merges_mounts() {
    let union = UnionBackend::new(vec![
        UnionMount::new("/home", archive_b()),
        UnionMount::new("/", archive_a()),
    ]);
    let root = union.attach("").await.unwrap();

    let entries = root.readdir(0, 100).await.unwrap();
    let listed: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(listed, [".", "home", "b", "hosts", "root"]);

    // Offsets continue the listing.
    let rest = root.readdir(entries[1].offset, 100).await.unwrap();
    assert_eq!(rest.len(), 3);
    assert_eq!(rest[0].name, "b");

    let (_, file) = root.walk(&names(&["home", "b"])).await.unwrap();
    assert_eq!(file.read_at(0, 100).await.unwrap(), b"from b\n");

    let (_, hi) = root.walk(&names(&["b", "c", "hi"])).await.unwrap();
    assert_eq!(hi.read_at(0, 100).await.unwrap(), b"hi\n");
}

#[tokio::test]
async fn archive_mutators_are_unsupported() {
    let root = archive_a().attach("").await.unwrap();
    let (_, hi) = root.walk(&names(&["b", "c", "hi"])).await.unwrap();

    let unsupported = |r: Result<(), VfsError>| matches!(r, Err(VfsError::Unsupported(_)));

    assert!(unsupported(hi.write_at(b"x", 0).await.map(|_| ())));
    assert!(unsupported(root.create("n", OpenFlags::read_write(), 0o644, 0).await.map(|_| ())));
    assert!(unsupported(root.mkdir("d", 0o755, 0).await.map(|_| ())));
    assert!(unsupported(root.symlink("s", "t", 0).await.map(|_| ())));
    assert!(unsupported(root.link(hi.as_ref(), "l").await));
    assert!(unsupported(root.mknod("m", 0o10644, 0, 0, 0).await.map(|_| ())));
    assert!(unsupported(hi.rename(root.as_ref(), "r").await));
    assert!(unsupported(root.rename_at("hosts", root.as_ref(), "h2").await));
    assert!(unsupported(root.unlink_at("hosts", 0).await));
    assert!(unsupported(hi.setattr(SetAttr::new().with_size(0)).await));
    assert!(unsupported(root.statfs().await.map(|_| ())));
}

#[tokio::test]
async fn symlink_targets_survive() {
    let root = archive_a().attach("").await.unwrap();
    let (_, link) = root.walk(&names(&["hosts"])).await.unwrap();
    assert_eq!(link.readlink().await.unwrap(), "/etc/hosts");

    let dir = tempfile::tempdir().unwrap();
    let live = PassthroughBackend::new(dir.path()).attach("").await.unwrap();
    live.symlink("rel", "../some where/odd", 0).await.unwrap();
    let (_, rel) = live.walk(&names(&["rel"])).await.unwrap();
    assert_eq!(rel.readlink().await.unwrap(), "../some where/odd");
}

#[tokio::test]
async fn passthrough_under_union_is_writable() {
    let dir = tempfile::tempdir().unwrap();
    let union = UnionBackend::new(vec![
        UnionMount::new("/etc", archive_a()),
        UnionMount::new("/", Arc::new(PassthroughBackend::new(dir.path()))),
    ]);
    let root = union.attach("").await.unwrap();

    // The merged root itself refuses changes...
    assert!(matches!(
        root.mkdir("nope", 0o755, 0).await,
        Err(VfsError::Unsupported(_))
    ));

    // ...but a directory reached through the catch-all is the live tree.
    std::fs::create_dir(dir.path().join("work")).unwrap();
    let (_, work) = root.walk(&names(&["work"])).await.unwrap();
    let (file, _, _) = work
        .create("out.txt", OpenFlags::read_write(), 0o644, 0)
        .await
        .unwrap();
    file.write_at(b"written through the union", 0).await.unwrap();
    assert_eq!(
        std::fs::read(dir.path().join("work/out.txt")).unwrap(),
        b"written through the union"
    );

    let (_, _, attr) = file.getattr(AttrMask::BASIC).await.unwrap();
    assert_eq!(attr.size, 25);
}

#[tokio::test]
async fn empty_union_has_only_itself() {
    let root = UnionBackend::new(Vec::new()).attach("").await.unwrap();
    let entries = root.readdir(0, 10).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, ".");
    assert!(matches!(
        root.walk(&names(&["x"])).await.err().unwrap(),
        VfsError::NotFound(_)
    ));
}
