//! utsushi-remote: started by `utsushi` on the remote host.
//!
//! Usage (normally assembled by the client):
//!   UTSUSHI_NAMESPACE=/home UTSUSHI_PORT9P=40123 UTSUSHI_NONCE=... \
//!     utsushi-remote make test

use std::collections::HashMap;
use std::process::{Command, ExitCode, ExitStatus};

use tracing::error;
use tracing_subscriber::{EnvFilter, fmt};

use utsushi_remote::RemoteEnv;
use utsushi_remote::constants::{DEFAULT_SHELL, ENV_FALLBACK_SHELL};
use utsushi_remote::env::PRIVATE_VARS;

fn main() -> ExitCode {
    // stderr only: stdout belongs to the command
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let vars: HashMap<String, String> = std::env::vars().collect();
    let command: Vec<String> = std::env::args().skip(1).collect();
    let fallback = vars
        .get(ENV_FALLBACK_SHELL)
        .filter(|s| !s.is_empty())
        .cloned();

    let result = RemoteEnv::from_map(&vars)
        .map_err(anyhow::Error::from)
        .and_then(|env| run(&env, &command));

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{:#}", e);
            if let Some(shell) = fallback {
                fallback_after_failure(&shell);
            }
            ExitCode::FAILURE
        }
    }
}

/// The target command with stdio inherited and client-only variables removed.
fn target_command(env: &RemoteEnv, command: &[String]) -> Command {
    let mut cmd = match command.split_first() {
        Some((program, args)) => {
            let mut cmd = Command::new(program);
            cmd.args(args);
            cmd
        }
        None => Command::new(std::env::var("SHELL").unwrap_or_else(|_| DEFAULT_SHELL.into())),
    };
    for var in PRIVATE_VARS {
        cmd.env_remove(var);
    }
    if let Some(pwd) = &env.pwd {
        if pwd.is_dir() {
            cmd.current_dir(pwd);
        } else {
            tracing::warn!(pwd = %pwd.display(), "working directory not present, staying put");
        }
    }
    cmd
}

fn exit_code(status: ExitStatus) -> u8 {
    use std::os::unix::process::ExitStatusExt;

    let code = status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(1);
    u8::try_from(code).unwrap_or(1)
}

fn run_shell(shell: &str) {
    tracing::warn!(shell, "starting fallback shell");
    if let Err(e) = Command::new(shell).status() {
        error!(shell, "fallback shell failed: {}", e);
    }
}

#[cfg(target_os = "linux")]
fn run(env: &RemoteEnv, command: &[String]) -> anyhow::Result<u8> {
    use std::os::fd::AsRawFd;
    use std::path::Path;

    use anyhow::Context;
    use rustix::thread::{UnshareFlags, unshare};

    use utsushi_remote::constants::STAGING_PATH;
    use utsushi_remote::{Assembler, LibcPrivileges, LinuxMounter, TransportOptions, dial};

    if env.needs_namespace() {
        unshare(UnshareFlags::NEWNS).context("entering a private mount namespace")?;
        LinuxMounter::make_private(Path::new("/")).context("making mounts private")?;
    }

    let mut assembler = Assembler::new(LinuxMounter::new(), LibcPrivileges, STAGING_PATH);

    // Held open for the life of the command.
    let _channel = match &env.channel {
        Some(channel) => {
            let stream = dial::dial(channel.port, &channel.nonce)
                .with_context(|| format!("dialing back-channel on port {}", channel.port))?;
            let options = TransportOptions {
                msize: env.msize,
                uname: whoami::username(),
            };
            assembler.mount_transport(stream.as_raw_fd(), &options)?;
            Some(stream)
        }
        None => {
            assembler.skip_transport()?;
            None
        }
    };

    assembler.bind(&env.namespace, &env.fstab)?;
    assembler.drop_privileges()?;

    if assembler.is_degraded() {
        if let Some(shell) = &env.fallback_shell {
            run_shell(shell);
        }
    }

    let status = assembler.run(&mut target_command(env, command))?;
    Ok(exit_code(status))
}

#[cfg(not(target_os = "linux"))]
fn run(_env: &RemoteEnv, _command: &[String]) -> anyhow::Result<u8> {
    anyhow::bail!("utsushi-remote needs Linux mount namespaces")
}

/// Only offers a shell once running as the real user.
#[cfg(target_os = "linux")]
fn fallback_after_failure(shell: &str) {
    use utsushi_remote::{LibcPrivileges, Privileges};

    let mut privileges = LibcPrivileges;
    if privileges.is_elevated() {
        if let Err(e) = privileges.drop_to_real() {
            error!("not starting fallback shell, privileges kept: {}", e);
            return;
        }
    }
    run_shell(shell);
}

#[cfg(not(target_os = "linux"))]
fn fallback_after_failure(shell: &str) {
    run_shell(shell);
}
