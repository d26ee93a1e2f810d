//! From environment variables to a bound namespace, with mount(2) replaced
//! by a recorder.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::process::Command;

use utsushi_remote::{
    Assembler, FstabEntry, Mounter, Privileges, RemoteEnv, State, TransportOptions, Warning,
};

#[derive(Default)]
struct Recorder {
    transport: Option<(RawFd, PathBuf, String)>,
    binds: Vec<(PathBuf, PathBuf)>,
    mounts: Vec<String>,
    refuse: Vec<PathBuf>,
}

impl Mounter for Recorder {
    fn mount_transport(
        &mut self,
        fd: RawFd,
        target: &Path,
        options: &TransportOptions,
    ) -> io::Result<()> {
        self.transport = Some((fd, target.to_path_buf(), options.data(fd)));
        Ok(())
    }

    fn bind_mount(&mut self, source: &Path, target: &Path) -> io::Result<()> {
        if self.refuse.iter().any(|p| p == target) {
            return Err(io::ErrorKind::NotFound.into());
        }
        self.binds.push((source.to_path_buf(), target.to_path_buf()));
        Ok(())
    }

    fn mount(&mut self, entry: &FstabEntry) -> io::Result<()> {
        self.mounts.push(format!("{}:{}", entry.vfstype, entry.file));
        Ok(())
    }
}

struct Unprivileged;

impl Privileges for Unprivileged {
    fn is_elevated(&self) -> bool {
        false
    }

    fn drop_to_real(&mut self) -> io::Result<()> {
        unreachable!("never elevated")
    }
}

fn vars(pairs: &[(&str, String)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[test]
fn test_environment_drives_assembly() {
    let dir = tempfile::tempdir().unwrap();
    let staging = dir.path().join("staging");
    let scratch = dir.path().join("scratch");

    let env = RemoteEnv::from_map(&vars(&[
        ("UTSUSHI_NAMESPACE", "/home:/etc/hosts:/work=/src/project".into()),
        ("UTSUSHI_PORT9P", "5640".into()),
        ("UTSUSHI_NONCE", "0123456789abcdef0123456789abcdef".into()),
        ("UTSUSHI_MSIZE", "262144".into()),
        ("UTSUSHI_FSTAB", format!("tmpfs {} tmpfs size=8m\n", scratch.display())),
    ]))
    .unwrap();

    let recorder = Recorder {
        refuse: vec![PathBuf::from("/etc/hosts")],
        ..Default::default()
    };
    let mut asm = Assembler::new(recorder, Unprivileged, &staging);

    let options = TransportOptions {
        msize: env.msize,
        uname: "tester".into(),
    };
    asm.mount_transport(9, &options).unwrap();
    asm.bind(&env.namespace, &env.fstab).unwrap();
    asm.drop_privileges().unwrap();
    assert_eq!(asm.state(), State::PrivilegeDropped);

    let mounter = asm.mounter();
    let (fd, target, data) = mounter.transport.clone().unwrap();
    assert_eq!(fd, 9);
    assert_eq!(target, staging);
    assert!(data.contains("msize=262144"));
    assert!(data.contains("uname=tester"));

    assert_eq!(
        mounter.binds,
        vec![
            (staging.join("home"), PathBuf::from("/home")),
            (staging.join("src/project"), PathBuf::from("/work")),
        ]
    );
    assert_eq!(mounter.mounts, vec![format!("tmpfs:{}", scratch.display())]);

    assert_eq!(asm.warnings().len(), 1);
    assert!(matches!(&asm.warnings()[0], Warning::Bind { to, .. } if to == Path::new("/etc/hosts")));

    let status = asm.run(&mut Command::new("true")).unwrap();
    assert!(status.success());
}

#[test]
fn test_disabled_namespace_runs_without_transport() {
    let dir = tempfile::tempdir().unwrap();
    let env = RemoteEnv::from_map(&vars(&[("UTSUSHI_NAMESPACE", "none".into())])).unwrap();
    assert!(env.channel.is_none());

    let mut asm = Assembler::new(Recorder::default(), Unprivileged, dir.path().join("staging"));
    asm.skip_transport().unwrap();
    asm.bind(&env.namespace, &env.fstab).unwrap();
    asm.drop_privileges().unwrap();

    let status = asm
        .run(Command::new("sh").args(["-c", "exit 2"]))
        .unwrap();
    assert_eq!(status.code(), Some(2));
    assert!(asm.mounter().transport.is_none());
    assert!(!dir.path().join("staging").exists());
}
