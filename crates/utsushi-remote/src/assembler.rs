//! Builds the command's view of the filesystem one stage at a time.
//!
//! `Unconfigured -> Mounted -> Bound -> PrivilegeDropped -> Running`
//!
//! Only the transport mount and the privilege drop can fail the session.
//! Binds and fstab entries that fail are kept as [`Warning`]s and the
//! command still runs in whatever namespace could be built.

use std::io;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};

use tracing::{debug, info, warn};

use crate::fstab::FstabEntry;
use crate::mount::{Mounter, TransportOptions};
use crate::namespace::{Bind, NamespaceSpec};
use crate::privilege::Privileges;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Unconfigured,
    Mounted,
    Bound,
    PrivilegeDropped,
    Running,
}

#[derive(Debug, thiserror::Error)]
pub enum AssemblyError {
    #[error("cannot {action} in state {state:?}")]
    InvalidTransition { action: &'static str, state: State },
    #[error("failed to create staging directory {path:?}: {error}")]
    Staging { path: PathBuf, error: io::Error },
    #[error("failed to mount back-channel at {target:?}: {error}")]
    TransportMount { target: PathBuf, error: io::Error },
    #[error("failed to drop privileges: {0}")]
    PrivilegeDrop(io::Error),
    #[error("failed to run {program}: {error}")]
    Command { program: String, error: io::Error },
}

/// Something that did not make it into the namespace.
#[derive(Debug, thiserror::Error)]
pub enum Warning {
    #[error("bind {from:?} over {to:?} failed: {error}")]
    Bind {
        from: PathBuf,
        to: PathBuf,
        error: io::Error,
    },
    #[error("fstab mount {spec} on {target} failed: {error}")]
    Fstab {
        spec: String,
        target: String,
        error: io::Error,
    },
}

pub struct Assembler<M, P> {
    state: State,
    mounter: M,
    privileges: P,
    staging: PathBuf,
    transport: bool,
    warnings: Vec<Warning>,
}

impl<M: Mounter, P: Privileges> Assembler<M, P> {
    pub fn new(mounter: M, privileges: P, staging: impl Into<PathBuf>) -> Self {
        Self {
            state: State::Unconfigured,
            mounter,
            privileges,
            staging: staging.into(),
            transport: false,
            warnings: Vec::new(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn staging(&self) -> &Path {
        &self.staging
    }

    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    pub fn is_degraded(&self) -> bool {
        !self.warnings.is_empty()
    }

    pub fn mounter(&self) -> &M {
        &self.mounter
    }

    fn require(&self, state: State, action: &'static str) -> Result<(), AssemblyError> {
        if self.state == state {
            Ok(())
        } else {
            Err(AssemblyError::InvalidTransition {
                action,
                state: self.state,
            })
        }
    }

    /// Mounts the authenticated connection on `fd` at the staging path.
    ///
    /// Must run inside a private mount namespace.
    pub fn mount_transport(
        &mut self,
        fd: RawFd,
        options: &TransportOptions,
    ) -> Result<(), AssemblyError> {
        self.require(State::Unconfigured, "mount transport")?;
        std::fs::create_dir_all(&self.staging).map_err(|error| AssemblyError::Staging {
            path: self.staging.clone(),
            error,
        })?;
        self.mounter
            .mount_transport(fd, &self.staging, options)
            .map_err(|error| AssemblyError::TransportMount {
                target: self.staging.clone(),
                error,
            })?;
        info!(staging = %self.staging.display(), "back-channel mounted");
        self.transport = true;
        self.state = State::Mounted;
        Ok(())
    }

    /// For sessions without a back-channel; binds are then skipped.
    pub fn skip_transport(&mut self) -> Result<(), AssemblyError> {
        self.require(State::Unconfigured, "skip transport")?;
        self.state = State::Mounted;
        Ok(())
    }

    /// Applies every bind from `spec`, then every fstab entry.
    ///
    /// Binds keep their listed order, except that a bind whose target is
    /// the staging path or one of its ancestors hides the back-channel and
    /// is deferred until the others are in place.
    pub fn bind(
        &mut self,
        spec: &NamespaceSpec,
        fstab: &[FstabEntry],
    ) -> Result<(), AssemblyError> {
        self.require(State::Mounted, "bind")?;

        if self.transport {
            let (covering, plain): (Vec<&Bind>, Vec<&Bind>) = spec
                .binds()
                .iter()
                .partition(|bind| self.staging.starts_with(&bind.local));
            for bind in &covering {
                warn!(
                    target = %bind.local.display(),
                    staging = %self.staging.display(),
                    "bind covers the back-channel, applying it last"
                );
            }
            for bind in plain.into_iter().chain(covering) {
                let from = bind.source(&self.staging);
                match self.mounter.bind_mount(&from, &bind.local) {
                    Ok(()) => debug!(from = %from.display(), to = %bind.local.display(), "bound"),
                    Err(error) => self.warn(Warning::Bind {
                        from,
                        to: bind.local.clone(),
                        error,
                    }),
                }
            }
        }

        for entry in fstab {
            if let Err(e) = std::fs::create_dir_all(&entry.file) {
                debug!(target = %entry.file, "could not create mount point: {}", e);
            }
            if let Err(error) = self.mounter.mount(entry) {
                self.warn(Warning::Fstab {
                    spec: entry.spec.clone(),
                    target: entry.file.clone(),
                    error,
                });
            }
        }

        self.state = State::Bound;
        Ok(())
    }

    pub fn drop_privileges(&mut self) -> Result<(), AssemblyError> {
        self.require(State::Bound, "drop privileges")?;
        if self.privileges.is_elevated() {
            self.privileges
                .drop_to_real()
                .map_err(AssemblyError::PrivilegeDrop)?;
        } else {
            debug!("not elevated, keeping credentials");
        }
        self.state = State::PrivilegeDropped;
        Ok(())
    }

    /// Runs `command` to completion inside the assembled namespace.
    pub fn run(&mut self, command: &mut Command) -> Result<ExitStatus, AssemblyError> {
        self.require(State::PrivilegeDropped, "run")?;
        let program = command.get_program().to_string_lossy().into_owned();
        let mut child = command.spawn().map_err(|error| AssemblyError::Command {
            program: program.clone(),
            error,
        })?;
        self.state = State::Running;
        child
            .wait()
            .map_err(|error| AssemblyError::Command { program, error })
    }

    fn warn(&mut self, warning: Warning) {
        warn!("{}", warning);
        self.warnings.push(warning);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fstab;

    #[derive(Default)]
    struct Recorder {
        calls: Vec<String>,
        fail_transport: bool,
        fail_targets: Vec<PathBuf>,
    }

    impl Mounter for Recorder {
        fn mount_transport(
            &mut self,
            fd: RawFd,
            target: &Path,
            options: &TransportOptions,
        ) -> io::Result<()> {
            if self.fail_transport {
                return Err(io::Error::other("no 9p support"));
            }
            self.calls
                .push(format!("9p {} {}", target.display(), options.data(fd)));
            Ok(())
        }

        fn bind_mount(&mut self, source: &Path, target: &Path) -> io::Result<()> {
            if self.fail_targets.iter().any(|t| t == target) {
                return Err(io::ErrorKind::NotFound.into());
            }
            self.calls
                .push(format!("bind {} {}", source.display(), target.display()));
            Ok(())
        }

        fn mount(&mut self, entry: &FstabEntry) -> io::Result<()> {
            if self.fail_targets.iter().any(|t| t == Path::new(&entry.file)) {
                return Err(io::ErrorKind::PermissionDenied.into());
            }
            self.calls
                .push(format!("{} {} {}", entry.vfstype, entry.spec, entry.file));
            Ok(())
        }
    }

    struct FakePrivileges {
        elevated: bool,
        dropped: bool,
        fail: bool,
    }

    impl FakePrivileges {
        fn new(elevated: bool) -> Self {
            Self {
                elevated,
                dropped: false,
                fail: false,
            }
        }
    }

    impl Privileges for FakePrivileges {
        fn is_elevated(&self) -> bool {
            self.elevated && !self.dropped
        }

        fn drop_to_real(&mut self) -> io::Result<()> {
            if self.fail {
                return Err(io::ErrorKind::PermissionDenied.into());
            }
            self.dropped = true;
            Ok(())
        }
    }

    fn options() -> TransportOptions {
        TransportOptions {
            msize: 8192,
            uname: "me".into(),
        }
    }

    fn assembler(
        mounter: Recorder,
        privileges: FakePrivileges,
    ) -> (tempfile::TempDir, Assembler<Recorder, FakePrivileges>) {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("staging");
        (dir, Assembler::new(mounter, privileges, staging))
    }

    #[test]
    fn test_full_sequence() {
        let (_dir, mut asm) = assembler(Recorder::default(), FakePrivileges::new(true));
        let staging = asm.staging().to_path_buf();

        asm.mount_transport(7, &options()).unwrap();
        assert_eq!(asm.state(), State::Mounted);
        assert!(staging.is_dir());

        let spec = NamespaceSpec::parse("/home:/opt=/srv/opt");
        asm.bind(&spec, &[]).unwrap();
        assert_eq!(asm.state(), State::Bound);

        asm.drop_privileges().unwrap();
        assert_eq!(asm.state(), State::PrivilegeDropped);
        assert!(!asm.privileges.is_elevated());

        let status = asm
            .run(Command::new("sh").args(["-c", "exit 3"]))
            .unwrap();
        assert_eq!(status.code(), Some(3));
        assert_eq!(asm.state(), State::Running);
        assert!(!asm.is_degraded());

        let calls = &asm.mounter().calls;
        assert_eq!(
            calls[0],
            format!(
                "9p {} version=9p2000.L,trans=fd,rfdno=7,wfdno=7,msize=8192,uname=me",
                staging.display()
            )
        );
        assert_eq!(calls[1], format!("bind {}/home /home", staging.display()));
        assert_eq!(calls[2], format!("bind {}/srv/opt /opt", staging.display()));
    }

    #[test]
    fn test_bind_over_staging_ancestor_goes_last() {
        let dir = tempfile::tempdir().unwrap();
        let parent = dir.path().to_path_buf();
        let staging = parent.join("staging");
        let mut asm = Assembler::new(Recorder::default(), FakePrivileges::new(false), &staging);
        asm.mount_transport(3, &options()).unwrap();

        let spec = NamespaceSpec::parse(&format!("{}:/home:/opt", parent.display()));
        asm.bind(&spec, &[]).unwrap();

        let calls = &asm.mounter().calls;
        assert_eq!(calls[1], format!("bind {}/home /home", staging.display()));
        assert_eq!(calls[2], format!("bind {}/opt /opt", staging.display()));
        assert_eq!(
            calls[3],
            format!(
                "bind {}{} {}",
                staging.display(),
                parent.display(),
                parent.display()
            )
        );
        assert!(!asm.is_degraded());
    }

    #[test]
    fn test_out_of_order_rejected() {
        let (_dir, mut asm) = assembler(Recorder::default(), FakePrivileges::new(false));
        assert!(matches!(
            asm.bind(&NamespaceSpec::Disabled, &[]),
            Err(AssemblyError::InvalidTransition {
                state: State::Unconfigured,
                ..
            })
        ));
        assert!(matches!(
            asm.drop_privileges(),
            Err(AssemblyError::InvalidTransition { .. })
        ));
        asm.skip_transport().unwrap();
        assert!(matches!(
            asm.mount_transport(3, &options()),
            Err(AssemblyError::InvalidTransition {
                state: State::Mounted,
                ..
            })
        ));
        assert!(matches!(
            asm.run(&mut Command::new("true")),
            Err(AssemblyError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_transport_failure_is_fatal() {
        let mounter = Recorder {
            fail_transport: true,
            ..Default::default()
        };
        let (_dir, mut asm) = assembler(mounter, FakePrivileges::new(false));
        assert!(matches!(
            asm.mount_transport(3, &options()),
            Err(AssemblyError::TransportMount { .. })
        ));
        assert_eq!(asm.state(), State::Unconfigured);
    }

    #[test]
    fn test_failed_binds_are_warnings() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        let scratch = dir.path().join("scratch");
        let mounter = Recorder {
            fail_targets: vec![missing.clone()],
            ..Default::default()
        };
        let mut asm = Assembler::new(mounter, FakePrivileges::new(false), dir.path().join("staging"));
        asm.mount_transport(3, &options()).unwrap();

        let table = fstab::parse(&format!(
            "tmpfs {} tmpfs size=1m\n/srv {} none bind\n",
            scratch.display(),
            missing.display()
        ))
        .unwrap();
        let spec = NamespaceSpec::parse(&format!("/home:{}", missing.display()));
        asm.bind(&spec, &table).unwrap();

        assert_eq!(asm.state(), State::Bound);
        assert_eq!(asm.warnings().len(), 2);
        assert!(matches!(asm.warnings()[0], Warning::Bind { .. }));
        assert!(matches!(asm.warnings()[1], Warning::Fstab { .. }));
        assert!(scratch.is_dir());
        assert_eq!(asm.mounter().calls.len(), 3);
    }

    #[test]
    fn test_no_transport_skips_binds() {
        let (_dir, mut asm) = assembler(Recorder::default(), FakePrivileges::new(false));
        asm.skip_transport().unwrap();
        asm.bind(&NamespaceSpec::parse("/home"), &[]).unwrap();
        assert!(asm.mounter().calls.is_empty());
        assert!(!asm.is_degraded());
    }

    #[test]
    fn test_privilege_drop_failure_is_fatal() {
        let mut privileges = FakePrivileges::new(true);
        privileges.fail = true;
        let (_dir, mut asm) = assembler(Recorder::default(), privileges);
        asm.skip_transport().unwrap();
        asm.bind(&NamespaceSpec::Disabled, &[]).unwrap();
        assert!(matches!(
            asm.drop_privileges(),
            Err(AssemblyError::PrivilegeDrop(_))
        ));
        assert_eq!(asm.state(), State::Bound);
    }

    #[test]
    fn test_unprivileged_skips_drop() {
        let (_dir, mut asm) = assembler(Recorder::default(), FakePrivileges::new(false));
        asm.skip_transport().unwrap();
        asm.bind(&NamespaceSpec::Disabled, &[]).unwrap();
        asm.drop_privileges().unwrap();
        assert!(!asm.privileges.dropped);
    }

    #[test]
    fn test_missing_program_is_command_error() {
        let (_dir, mut asm) = assembler(Recorder::default(), FakePrivileges::new(false));
        asm.skip_transport().unwrap();
        asm.bind(&NamespaceSpec::Disabled, &[]).unwrap();
        asm.drop_privileges().unwrap();
        assert!(matches!(
            asm.run(&mut Command::new("/nonexistent/utsushi-test")),
            Err(AssemblyError::Command { .. })
        ));
        assert_eq!(asm.state(), State::PrivilegeDropped);
    }
}
