//! Drive the dispatcher through a real framed stream.

use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use utsushi_9p::fcall::{self, NOFID, NOTAG, SetAttrRequest, VERSION_9P2000_L, setattr};
use utsushi_9p::{Fcall, Msg, NinePCodec, ProtocolError, ServeError, ServerConfig, serve};
use utsushi_vfs::cpio::CpioWriter;
use utsushi_vfs::{
    ArchiveBackend, Backend, OpenFlags, PassthroughBackend, UnionBackend, UnionMount, errno,
};

struct Client {
    framed: Framed<DuplexStream, NinePCodec>,
    tag: u16,
    server: JoinHandle<Result<(), ServeError>>,
}

impl Client {
    fn start(backend: Arc<dyn Backend>, max_msize: u32) -> Self {
        let (ours, theirs) = tokio::io::duplex(1 << 20);
        let config = ServerConfig {
            max_msize,
            trace_requests: true,
        };
        let server = tokio::spawn(serve(theirs, backend, config));
        Self {
            framed: Framed::new(ours, NinePCodec::new(1 << 20)),
            tag: 0,
            server,
        }
    }

    async fn rpc(&mut self, body: Fcall) -> Fcall {
        self.tag += 1;
        let tag = if matches!(body, Fcall::Tversion { .. }) {
            NOTAG
        } else {
            self.tag
        };
        self.framed.send(Msg { tag, body }).await.unwrap();
        let reply = self.framed.next().await.unwrap().unwrap();
        assert_eq!(reply.tag, tag);
        reply.body
    }

    async fn attach(&mut self, msize: u32) -> Fcall {
        let version = self
            .rpc(Fcall::Tversion {
                msize,
                version: VERSION_9P2000_L.into(),
            })
            .await;
        assert!(matches!(version, Fcall::Rversion { .. }));
        self.rpc(Fcall::Tattach {
            fid: 0,
            afid: NOFID,
            uname: "me".into(),
            aname: String::new(),
            n_uname: 1000,
        })
        .await
    }

    async fn walk(&mut self, fid: u32, newfid: u32, names: &[&str]) -> Fcall {
        self.rpc(Fcall::Twalk {
            fid,
            newfid,
            wnames: names.iter().map(|s| s.to_string()).collect(),
        })
        .await
    }

    /// Write a hand-built frame, bypassing the encoder.
    async fn send_raw(&mut self, kind: u8, tag: u16, body: &[u8]) {
        let size = (7 + body.len()) as u32;
        let mut frame = size.to_le_bytes().to_vec();
        frame.push(kind);
        frame.extend_from_slice(&tag.to_le_bytes());
        frame.extend_from_slice(body);
        self.framed.get_mut().write_all(&frame).await.unwrap();
    }

    async fn reply(&mut self) -> Msg {
        self.framed.next().await.unwrap().unwrap()
    }

    async fn finish(self) -> Result<(), ServeError> {
        drop(self.framed);
        self.server.await.unwrap()
    }
}

fn sample_union() -> Arc<dyn Backend> {
    let a = CpioWriter::new()
        .file("b/c/hi", 0o644, b"hi\n")
        .dir("root", 0o700)
        .symlink("hosts", "/etc/hosts")
        .finish();
    let b = CpioWriter::new().file("b", 0o644, b"bee").finish();
    Arc::new(UnionBackend::new(vec![
        UnionMount::new("home", Arc::new(ArchiveBackend::from_bytes(b).unwrap())),
        UnionMount::new("", Arc::new(ArchiveBackend::from_bytes(a).unwrap())),
    ]))
}

fn lerror(reply: &Fcall) -> u32 {
    match reply {
        Fcall::Rlerror { ecode } => *ecode,
        other => panic!("expected Rlerror, got {other:?}"),
    }
}

#[tokio::test]
async fn version_negotiates_smaller_msize() {
    let mut client = Client::start(sample_union(), 65536);
    let reply = client
        .rpc(Fcall::Tversion {
            msize: 1 << 20,
            version: VERSION_9P2000_L.into(),
        })
        .await;
    assert_eq!(
        reply,
        Fcall::Rversion {
            msize: 65536,
            version: VERSION_9P2000_L.into()
        }
    );

    let reply = client
        .rpc(Fcall::Tversion {
            msize: 8192,
            version: "9P2000.u".into(),
        })
        .await;
    assert_eq!(
        reply,
        Fcall::Rversion {
            msize: 8192,
            version: "unknown".into()
        }
    );
    client.finish().await.unwrap();
}

#[tokio::test]
async fn auth_is_not_offered() {
    let mut client = Client::start(sample_union(), 8192);
    let reply = client
        .rpc(Fcall::Tauth {
            afid: 1,
            uname: "me".into(),
            aname: String::new(),
            n_uname: 0,
        })
        .await;
    assert_eq!(lerror(&reply), errno::EOPNOTSUPP);
    client.finish().await.unwrap();
}

#[tokio::test]
async fn walk_open_read() {
    let mut client = Client::start(sample_union(), 8192);
    assert!(matches!(client.attach(8192).await, Fcall::Rattach { .. }));

    match client.walk(0, 1, &["b", "c", "hi"]).await {
        Fcall::Rwalk { wqids } => assert_eq!(wqids.len(), 3),
        other => panic!("unexpected {other:?}"),
    }
    match client.rpc(Fcall::Tlopen { fid: 1, flags: 0 }).await {
        Fcall::Rlopen { iounit, .. } => assert_eq!(iounit, 8192 - fcall::IOHDRSZ),
        other => panic!("unexpected {other:?}"),
    }
    let reply = client
        .rpc(Fcall::Tread {
            fid: 1,
            offset: 1,
            count: 2,
        })
        .await;
    assert_eq!(reply, Fcall::Rread { data: b"i\n".to_vec() });

    assert_eq!(client.rpc(Fcall::Tclunk { fid: 1 }).await, Fcall::Rclunk);
    let reply = client
        .rpc(Fcall::Tread {
            fid: 1,
            offset: 0,
            count: 2,
        })
        .await;
    assert_eq!(lerror(&reply), errno::EBADF);
    client.finish().await.unwrap();
}

#[tokio::test]
async fn clone_walk_has_no_qids() {
    let mut client = Client::start(sample_union(), 8192);
    client.attach(8192).await;
    assert_eq!(client.walk(0, 5, &[]).await, Fcall::Rwalk { wqids: vec![] });
    // newfid in use
    assert_eq!(lerror(&client.walk(0, 5, &[]).await), errno::EBADF);
    client.finish().await.unwrap();
}

#[tokio::test]
async fn walk_limits_and_misses() {
    let mut client = Client::start(sample_union(), 8192);
    client.attach(8192).await;

    let long: Vec<&str> = std::iter::repeat_n(".", 17).collect();
    assert_eq!(lerror(&client.walk(0, 1, &long).await), errno::EINVAL);
    assert_eq!(lerror(&client.walk(0, 1, &["nope"]).await), errno::ENOENT);
    assert_eq!(lerror(&client.walk(9, 1, &["b"]).await), errno::EBADF);
    client.finish().await.unwrap();
}

#[tokio::test]
async fn readdir_packs_merged_root() {
    let mut client = Client::start(sample_union(), 8192);
    client.attach(8192).await;
    client.rpc(Fcall::Tlopen { fid: 0, flags: 0 }).await;

    let reply = client
        .rpc(Fcall::Treaddir {
            fid: 0,
            offset: 0,
            count: 4096,
        })
        .await;
    let Fcall::Rreaddir { data } = reply else {
        panic!("unexpected {reply:?}");
    };
    let entries = fcall::parse_dirents(&data).unwrap();
    let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, [".", "home", "b", "hosts", "root"]);

    // A tight byte budget returns a prefix; the cookie resumes after it.
    let reply = client
        .rpc(Fcall::Treaddir {
            fid: 0,
            offset: 0,
            count: 60,
        })
        .await;
    let Fcall::Rreaddir { data } = reply else {
        panic!("unexpected {reply:?}");
    };
    let first = fcall::parse_dirents(&data).unwrap();
    assert_eq!(first.len(), 2);

    let reply = client
        .rpc(Fcall::Treaddir {
            fid: 0,
            offset: first[1].offset,
            count: 4096,
        })
        .await;
    let Fcall::Rreaddir { data } = reply else {
        panic!("unexpected {reply:?}");
    };
    let rest = fcall::parse_dirents(&data).unwrap();
    assert_eq!(rest.len(), 3);
    assert_eq!(rest[0].name, "b");
    client.finish().await.unwrap();
}

#[tokio::test]
async fn readlink_and_getattr() {
    let mut client = Client::start(sample_union(), 8192);
    client.attach(8192).await;
    client.walk(0, 1, &["hosts"]).await;

    assert_eq!(
        client.rpc(Fcall::Treadlink { fid: 1 }).await,
        Fcall::Rreadlink {
            target: "/etc/hosts".into()
        }
    );
    match client
        .rpc(Fcall::Tgetattr {
            fid: 1,
            request_mask: 0x7ff,
        })
        .await
    {
        Fcall::Rgetattr { qid, attr, .. } => {
            assert!(qid.kind.is_symlink());
            assert!(attr.is_symlink());
            assert_eq!(attr.size, 10);
        }
        other => panic!("unexpected {other:?}"),
    }
    client.finish().await.unwrap();
}

#[tokio::test]
async fn archive_write_is_refused() {
    let mut client = Client::start(sample_union(), 8192);
    client.attach(8192).await;
    client.walk(0, 1, &["b", "c", "hi"]).await;

    let reply = client.rpc(Fcall::Tlopen { fid: 1, flags: 2 }).await;
    assert_eq!(lerror(&reply), errno::EOPNOTSUPP);
    let reply = client
        .rpc(Fcall::Tmkdir {
            dfid: 0,
            name: "x".into(),
            mode: 0o755,
            gid: 0,
        })
        .await;
    assert_eq!(lerror(&reply), errno::EOPNOTSUPP);
    client.finish().await.unwrap();
}

#[tokio::test]
async fn remove_clunks_anyway() {
    let mut client = Client::start(sample_union(), 8192);
    client.attach(8192).await;
    client.walk(0, 1, &["root"]).await;

    assert_eq!(
        lerror(&client.rpc(Fcall::Tremove { fid: 1 }).await),
        errno::EOPNOTSUPP
    );
    assert_eq!(lerror(&client.rpc(Fcall::Tclunk { fid: 1 }).await), errno::EBADF);
    client.finish().await.unwrap();
}

#[tokio::test]
async fn passthrough_create_write_setattr() {
    let dir = tempfile::tempdir().unwrap();
    let backend: Arc<dyn Backend> = Arc::new(PassthroughBackend::new(dir.path()));
    let mut client = Client::start(backend, 8192);
    client.attach(8192).await;
    client.walk(0, 1, &[]).await;

    match client
        .rpc(Fcall::Tlcreate {
            fid: 1,
            name: "new.txt".into(),
            flags: OpenFlags::RDWR,
            mode: 0o644,
            gid: 0,
        })
        .await
    {
        Fcall::Rlcreate { qid, .. } => assert!(!qid.kind.is_dir()),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(
        client
            .rpc(Fcall::Twrite {
                fid: 1,
                offset: 0,
                data: b"hello world".to_vec(),
            })
            .await,
        Fcall::Rwrite { count: 11 }
    );

    let reply = client
        .rpc(Fcall::Tsetattr {
            fid: 1,
            attr: SetAttrRequest {
                valid: setattr::SIZE,
                size: 5,
                ..Default::default()
            },
        })
        .await;
    assert_eq!(reply, Fcall::Rsetattr);
    assert_eq!(client.rpc(Fcall::Tclunk { fid: 1 }).await, Fcall::Rclunk);
    assert_eq!(std::fs::read(dir.path().join("new.txt")).unwrap(), b"hello");

    assert_eq!(
        client
            .rpc(Fcall::Tunlinkat {
                dirfd: 0,
                name: "new.txt".into(),
                flags: 0,
            })
            .await,
        Fcall::Runlinkat
    );
    assert!(!dir.path().join("new.txt").exists());
    client.finish().await.unwrap();
}

#[tokio::test]
async fn oversized_frame_ends_session() {
    let mut client = Client::start(sample_union(), 8192);
    client.attach(8192).await;

    client
        .framed
        .send(Msg {
            tag: 1,
            body: Fcall::Twrite {
                fid: 0,
                offset: 0,
                data: vec![0; 9000],
            },
        })
        .await
        .unwrap();
    let result = client.server.await.unwrap();
    assert!(matches!(
        result,
        Err(ServeError::Protocol(ProtocolError::FrameTooLarge { max: 8192, .. }))
    ));
}

#[tokio::test]
async fn undersized_frame_ends_session() {
    let mut client = Client::start(sample_union(), 8192);
    client.attach(8192).await;

    client
        .framed
        .get_mut()
        .write_all(&[3, 0, 0, 0, 0, 0, 0])
        .await
        .unwrap();
    let result = client.server.await.unwrap();
    assert!(matches!(
        result,
        Err(ServeError::Protocol(ProtocolError::FrameTooShort(3)))
    ));
}

#[tokio::test]
async fn non_utf8_name_fails_only_its_request() {
    let mut client = Client::start(sample_union(), 8192);
    client.attach(8192).await;

    // Twalk fid=0 newfid=1 wnames=[b"\xff"]
    let mut body = Vec::new();
    body.extend_from_slice(&0u32.to_le_bytes());
    body.extend_from_slice(&1u32.to_le_bytes());
    body.extend_from_slice(&1u16.to_le_bytes());
    body.extend_from_slice(&1u16.to_le_bytes());
    body.push(0xff);
    client.send_raw(fcall::kind::TWALK, 40, &body).await;

    let reply = client.reply().await;
    assert_eq!(reply.tag, 40);
    assert_eq!(lerror(&reply.body), errno::EINVAL);

    // fid 1 was never bound, and the session still answers.
    let reply = client.rpc(Fcall::Tclunk { fid: 1 }).await;
    assert_eq!(lerror(&reply), errno::EBADF);
    match client.walk(0, 1, &["b", "c", "hi"]).await {
        Fcall::Rwalk { wqids } => assert_eq!(wqids.len(), 3),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(client.rpc(Fcall::Tclunk { fid: 1 }).await, Fcall::Rclunk);
    client.finish().await.unwrap();
}

#[tokio::test]
async fn truncated_body_fails_only_its_request() {
    let mut client = Client::start(sample_union(), 8192);
    client.attach(8192).await;

    // Tclunk needs four bytes of fid.
    client.send_raw(fcall::kind::TCLUNK, 41, &[0, 0]).await;
    let reply = client.reply().await;
    assert_eq!(reply.tag, 41);
    assert_eq!(lerror(&reply.body), errno::EINVAL);

    assert_eq!(client.rpc(Fcall::Tclunk { fid: 0 }).await, Fcall::Rclunk);
    client.finish().await.unwrap();
}

#[tokio::test]
async fn eof_is_clean() {
    let client = Client::start(sample_union(), 8192);
    client.finish().await.unwrap();
}
