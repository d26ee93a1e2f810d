//! utsushi: run a command on another machine with your files.
//!
//! Usage:
//!   utsushi --host build01 -- make test
//!   utsushi --host build01 --namespace /home/me:/tmp -- sh
//!   utsushi --local --root /srv/image --archive opt=/srv/tools.cpio -- ls /opt

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt};

use utsushi_client::{
    ArchiveMount, ClientConfig, LocalTransport, Session, SessionOptions, SshConfig, SshTransport,
    Transport, backend_from_config, config,
};

/// Run a remote command inside a namespace backed by local files.
#[derive(Parser, Debug)]
#[command(name = "utsushi")]
#[command(about = "Run a remote command with a live view of local files")]
struct Args {
    /// Config file (default: ~/.config/utsushi/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// SSH host to run on
    #[arg(long)]
    host: Option<String>,

    /// SSH port
    #[arg(short, long)]
    port: Option<u16>,

    /// Remote user name
    #[arg(short = 'l', long)]
    user: Option<String>,

    /// Run the remote side on this machine instead of over SSH
    #[arg(long, conflicts_with = "host")]
    local: bool,

    /// Colon-separated paths to share, or "none"
    #[arg(long)]
    namespace: Option<String>,

    /// Local directory served as the remote's root
    #[arg(long)]
    root: Option<PathBuf>,

    /// Layer a CPIO archive at a prefix (PREFIX=FILE, repeatable)
    #[arg(long = "archive", value_parser = parse_archive)]
    archives: Vec<ArchiveMount>,

    /// Handshake timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Largest 9P message size
    #[arg(long)]
    msize: Option<u32>,

    /// Program to start on the remote host
    #[arg(long)]
    remote_binary: Option<String>,

    /// Extra mounts for the remote, read from an fstab-style file
    #[arg(long)]
    fstab: Option<PathBuf>,

    /// Rely on setenv only; do not prefix the command with `env`
    #[arg(long)]
    no_env_in_command: bool,

    /// Debug logging and per-request protocol tracing
    #[arg(short, long)]
    verbose: bool,

    /// Command and arguments to run (default: the remote user's shell)
    #[arg(trailing_var_arg = true)]
    command: Vec<String>,
}

fn parse_archive(s: &str) -> Result<ArchiveMount, String> {
    ArchiveMount::parse(s).ok_or_else(|| format!("expected PREFIX=FILE, got {s:?}"))
}

impl Args {
    fn apply(self, mut config: ClientConfig) -> Result<(ClientConfig, Vec<String>, bool)> {
        if let Some(host) = self.host {
            config.host = Some(host);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(user) = self.user {
            config.user = Some(user);
        }
        if let Some(namespace) = self.namespace {
            config.namespace = namespace;
        }
        if let Some(root) = self.root {
            config.root = root;
        }
        if !self.archives.is_empty() {
            config.archives = self.archives;
        }
        if let Some(ms) = self.timeout_ms {
            config.handshake_timeout_ms = ms;
        }
        if let Some(msize) = self.msize {
            config.msize = msize;
        }
        if let Some(remote_binary) = self.remote_binary {
            config.remote_binary = remote_binary;
        }
        if let Some(path) = self.fstab {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading fstab {}", path.display()))?;
            config.fstab = Some(text);
        }
        if self.no_env_in_command {
            config.env_in_command = false;
        }
        config.verbose |= self.verbose;
        Ok((config, self.command, self.local))
    }
}

/// `RUST_LOG` wins when set and parseable; `-v` only picks the fallback.
fn log_filter(rust_log: Option<&str>, verbose: bool) -> EnvFilter {
    let fallback = if verbose { "debug" } else { "info" };
    rust_log
        .filter(|directives| !directives.trim().is_empty())
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(fallback))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // stderr only: stdout belongs to the remote command
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    fmt()
        .with_env_filter(log_filter(rust_log.as_deref(), args.verbose))
        .with_writer(std::io::stderr)
        .init();

    let config = match &args.config {
        Some(path) => ClientConfig::load_from(path)?,
        None => config::load_config(),
    };
    let (config, command, local) = args.apply(config)?;

    let mut options = SessionOptions::from_config(&config);
    options.pwd = std::env::current_dir()
        .ok()
        .map(|p| p.display().to_string());

    let backend = backend_from_config(&config)
        .await
        .context("building served tree")?;

    let mut ssh = None;
    let transport: Arc<dyn Transport> = if local {
        Arc::new(LocalTransport::new())
    } else {
        let Some(host) = config.host.clone() else {
            bail!("no host given; use --host, set `host` in the config, or pass --local");
        };
        let mut ssh_config = SshConfig::new(host);
        ssh_config.port = config.port;
        if let Some(user) = &config.user {
            ssh_config.username = user.clone();
        }
        ssh_config.env_in_command = config.env_in_command;
        let connected = Arc::new(SshTransport::connect(ssh_config).await?);
        ssh = Some(connected.clone());
        connected
    };

    let session = Session::new(transport, backend, options);
    let code = session.run(&command).await?;

    if let Some(ssh) = ssh {
        if let Err(e) = ssh.disconnect().await {
            tracing::debug!("disconnect: {}", e);
        }
    }

    Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
}
