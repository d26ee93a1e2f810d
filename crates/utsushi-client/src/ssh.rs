//! SSH transport
//!
//! Uses russh with SSH agent authentication. One connection provides:
//! - a `tcpip-forward` listener on the remote loopback for the back-channel
//! - an `exec` session channel running the remote command, with stdio
//!   relayed to this process

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use russh::client::{self, Config, Handle};
use russh::keys::agent::client::AgentClient;
use russh::keys::{HashAlg, PublicKey};
use russh::{Channel, ChannelMsg, Disconnect};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::constants::{
    CONNECT_TIMEOUT, DEFAULT_SSH_PORT, SSH_INACTIVITY_TIMEOUT, SSH_KEEPALIVE_INTERVAL,
    SSH_KEEPALIVE_MAX,
};
use crate::transport::{
    BoxedConnection, RemoteCommand, RemoteProcess, ReverseListener, Transport, TransportError,
};

/// SSH connection configuration
#[derive(Debug, Clone)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Also pass the environment as an `env K=V` prefix on the command line.
    pub env_in_command: bool,
}

impl SshConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_SSH_PORT,
            username: whoami::username(),
            env_in_command: true,
        }
    }
}

/// Forwarded channels waiting to be accepted, keyed by bound port.
type Forwards = Arc<Mutex<HashMap<u32, mpsc::UnboundedSender<Channel<client::Msg>>>>>;

/// Client handler for russh: host key verification and forwarded channels.
struct ClientHandler {
    host: String,
    port: u16,
    forwards: Forwards,
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256).to_string();
        match russh::keys::check_known_hosts(&self.host, self.port, server_public_key) {
            Ok(true) => {
                debug!(host = %self.host, %fingerprint, "server key matches known_hosts");
                Ok(true)
            }
            Ok(false) => Err(SshError::UnknownHostKey {
                host: self.host.clone(),
                fingerprint,
            }),
            Err(e) => Err(SshError::HostKeyMismatch(format!("{}: {}", self.host, e))),
        }
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        debug!(
            connected_address,
            connected_port, originator_address, originator_port, "forwarded channel opened"
        );
        let sender = self.forwards.lock().get(&connected_port).cloned();
        match sender {
            Some(tx) => {
                if tx.send(channel).is_err() {
                    debug!(connected_port, "forward no longer accepting");
                }
            }
            None => warn!(connected_port, "forwarded channel for unknown port"),
        }
        Ok(())
    }
}

/// Transport over one authenticated SSH connection.
pub struct SshTransport {
    config: SshConfig,
    session: tokio::sync::Mutex<Handle<ClientHandler>>,
    forwards: Forwards,
}

impl SshTransport {
    /// Connect and authenticate with the keys held by the SSH agent.
    pub async fn connect(config: SshConfig) -> Result<Self, SshError> {
        tokio::time::timeout(CONNECT_TIMEOUT, Self::connect_inner(config))
            .await
            .map_err(|_| SshError::ConnectionFailed(format!("timed out after {CONNECT_TIMEOUT:?}")))?
    }

    async fn connect_inner(config: SshConfig) -> Result<Self, SshError> {
        let mut agent = AgentClient::connect_env()
            .await
            .map_err(|e| SshError::AgentFailed(e.to_string()))?;
        let keys = agent
            .request_identities()
            .await
            .map_err(|e| SshError::AgentFailed(format!("listing identities: {e}")))?;
        if keys.is_empty() {
            return Err(SshError::NoKeysAvailable);
        }

        let forwards = Forwards::default();
        let mut session = Self::handshake(&config, forwards.clone()).await?;

        // server-sig-algs does not change between attempts.
        let rsa_hash = session
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();

        let mut attempts = KeyAttempts::default();
        let accepted = 'offer: {
            for key in keys {
                let fingerprint = key.fingerprint(HashAlg::Sha256).to_string();
                attempts.offered += 1;
                let outcome = session
                    .authenticate_publickey_with(&config.username, key, rsa_hash, &mut agent)
                    .await;
                match outcome {
                    Ok(auth) if auth.success() => break 'offer Some(fingerprint),
                    Ok(_) => attempts.rejected(&fingerprint),
                    Err(e) => attempts.failed(&fingerprint, e),
                }
            }
            None
        };
        let Some(fingerprint) = accepted else {
            return Err(attempts.exhausted(&config.username));
        };
        info!(user = %config.username, key = %fingerprint, "ssh session authenticated");

        Ok(Self {
            config,
            session: tokio::sync::Mutex::new(session),
            forwards,
        })
    }

    /// TCP connect, key exchange and host key check.
    async fn handshake(
        config: &SshConfig,
        forwards: Forwards,
    ) -> Result<Handle<ClientHandler>, SshError> {
        let ssh_config = Config {
            inactivity_timeout: Some(SSH_INACTIVITY_TIMEOUT),
            keepalive_interval: Some(SSH_KEEPALIVE_INTERVAL),
            keepalive_max: SSH_KEEPALIVE_MAX,
            ..<_>::default()
        };
        let handler = ClientHandler {
            host: config.host.clone(),
            port: config.port,
            forwards,
        };
        let session = client::connect(
            Arc::new(ssh_config),
            (config.host.as_str(), config.port),
            handler,
        )
        .await?;
        debug!(host = %config.host, port = config.port, "ssh transport up");
        Ok(session)
    }

    /// Disconnect from the server
    pub async fn disconnect(&self) -> Result<(), SshError> {
        self.session
            .lock()
            .await
            .disconnect(Disconnect::ByApplication, "session finished", "en")
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn open_reverse_listener(
        &self,
        bind_addr: &str,
    ) -> Result<Box<dyn ReverseListener>, TransportError> {
        let port = self
            .session
            .lock()
            .await
            .tcpip_forward(bind_addr, 0)
            .await
            .map_err(SshError::from)?;
        let port = u16::try_from(port)
            .map_err(|_| SshError::ChannelFailed(format!("server bound invalid port {port}")))?;

        let (tx, rx) = mpsc::unbounded_channel();
        self.forwards.lock().insert(u32::from(port), tx);
        debug!(bind_addr, port, "remote forward established");

        Ok(Box::new(SshListener {
            port,
            incoming: rx,
            forwards: self.forwards.clone(),
        }))
    }

    async fn spawn_remote(
        &self,
        command: RemoteCommand,
    ) -> Result<Box<dyn RemoteProcess>, TransportError> {
        let channel = self
            .session
            .lock()
            .await
            .channel_open_session()
            .await
            .map_err(|e| SshError::ChannelFailed(format!("exec: {e}")))?;

        for (key, value) in &command.env {
            // Most servers only accept a short AcceptEnv list; the command
            // line prefix covers the rest.
            if let Err(e) = channel.set_env(false, key.as_str(), value.as_str()).await {
                debug!(key, "setenv failed: {}", e);
            }
        }

        let line = command.to_shell_line(self.config.env_in_command);
        debug!(command = %line, "exec on remote");
        channel
            .exec(true, line)
            .await
            .map_err(|e| SshError::ChannelFailed(format!("exec: {e}")))?;

        let relay = tokio::spawn(relay_stdio(channel));
        Ok(Box::new(SshProcess { relay: Some(relay) }))
    }
}

struct SshListener {
    port: u16,
    incoming: mpsc::UnboundedReceiver<Channel<client::Msg>>,
    forwards: Forwards,
}

#[async_trait]
impl ReverseListener for SshListener {
    fn port(&self) -> u16 {
        self.port
    }

    async fn accept(&mut self) -> Result<BoxedConnection, TransportError> {
        let channel = self
            .incoming
            .recv()
            .await
            .ok_or(TransportError::ListenerClosed)?;
        Ok(Box::new(channel.into_stream()))
    }
}

impl Drop for SshListener {
    fn drop(&mut self) {
        // Later forwarded channels for this port are refused by the handler.
        self.forwards.lock().remove(&u32::from(self.port));
    }
}

struct SshProcess {
    relay: Option<tokio::task::JoinHandle<Result<i32, SshError>>>,
}

#[async_trait]
impl RemoteProcess for SshProcess {
    async fn wait(&mut self) -> Result<i32, TransportError> {
        let relay = self
            .relay
            .take()
            .ok_or_else(|| TransportError::Remote("already waited".into()))?;
        let code = relay
            .await
            .map_err(|e| TransportError::Remote(e.to_string()))??;
        Ok(code)
    }
}

/// Copies our stdin to the channel and its output to our stdout/stderr
/// until the remote closes, returning the exit status.
async fn relay_stdio(mut channel: Channel<client::Msg>) -> Result<i32, SshError> {
    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();
    let mut buf = vec![0u8; 8192];
    let mut stdin_open = true;
    let mut code = None;

    loop {
        tokio::select! {
            read = stdin.read(&mut buf), if stdin_open => match read {
                Ok(0) | Err(_) => {
                    stdin_open = false;
                    channel.eof().await?;
                }
                Ok(n) => channel.data(&buf[..n]).await?,
            },
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) => {
                    stdout.write_all(&data).await?;
                    stdout.flush().await?;
                }
                Some(ChannelMsg::ExtendedData { data, .. }) => {
                    stderr.write_all(&data).await?;
                    stderr.flush().await?;
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    code = Some(exit_status as i32);
                }
                Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                    warn!(?signal_name, "remote command killed by signal");
                    code.get_or_insert(255);
                }
                Some(ChannelMsg::Failure) => {
                    return Err(SshError::ChannelFailed("exec refused by server".into()));
                }
                Some(_) => {}
                None => break,
            },
        }
    }

    code.ok_or(SshError::Disconnected)
}

/// Bookkeeping for offering agent keys one at a time.
#[derive(Debug, Default)]
struct KeyAttempts {
    offered: usize,
    rejected: usize,
    last_error: Option<String>,
}

impl KeyAttempts {
    fn rejected(&mut self, fingerprint: &str) {
        self.rejected += 1;
        debug!(key = fingerprint, "key rejected");
    }

    fn failed(&mut self, fingerprint: &str, error: impl std::fmt::Display) {
        warn!(key = fingerprint, %error, "key attempt failed");
        self.last_error = Some(error.to_string());
    }

    fn exhausted(self, user: &str) -> SshError {
        if self.offered == 0 {
            return SshError::NoKeysAvailable;
        }
        let mut reason = format!(
            "{user}: {} of {} agent keys rejected",
            self.rejected, self.offered
        );
        if let Some(error) = self.last_error {
            reason.push_str(&format!(", last error: {error}"));
        }
        SshError::AuthFailed(reason)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SshError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Auth failed: {0}")]
    AuthFailed(String),
    #[error("Channel failed: {0}")]
    ChannelFailed(String),
    #[error("SSH agent error: {0}")]
    AgentFailed(String),
    #[error("No SSH keys available in agent")]
    NoKeysAvailable,
    #[error("Host {host} is not in known_hosts (key {fingerprint})")]
    UnknownHostKey { host: String, fingerprint: String },
    #[error("Host key verification failed: {0}")]
    HostKeyMismatch(String),
    #[error("Disconnected before the remote command reported an exit status")]
    Disconnected,
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<russh::Error> for SshError {
    fn from(e: russh::Error) -> Self {
        SshError::ConnectionFailed(e.to_string())
    }
}

impl From<std::io::Error> for SshError {
    fn from(e: std::io::Error) -> Self {
        SshError::Io(e.to_string())
    }
}
