//! What a session needs from the layer that reaches the remote host.
//!
//! A [`Transport`] can open one reverse-forwarded listener on the remote
//! loopback and start a command there. [`LocalTransport`] does both on this
//! machine, which is how the binary runs with `--local` and how the tests
//! exercise a whole session without an SSH server.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tracing::debug;

use crate::ssh::SshError;

/// A duplex byte stream the dispatcher can serve.
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Connection for T {}

pub type BoxedConnection = Box<dyn Connection>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Listener closed before a connection arrived")]
    ListenerClosed,
    #[error("Remote command failed: {0}")]
    Remote(String),
    #[error(transparent)]
    Ssh(#[from] SshError),
}

/// Listening side of a reverse forward.
#[async_trait]
pub trait ReverseListener: Send {
    /// Port the remote end should dial.
    fn port(&self) -> u16;

    async fn accept(&mut self) -> Result<BoxedConnection, TransportError>;
}

/// A command started on the remote host.
#[async_trait]
pub trait RemoteProcess: Send {
    /// Waits for the command to finish and returns its exit code.
    async fn wait(&mut self) -> Result<i32, TransportError>;
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn open_reverse_listener(
        &self,
        bind_addr: &str,
    ) -> Result<Box<dyn ReverseListener>, TransportError>;

    async fn spawn_remote(
        &self,
        command: RemoteCommand,
    ) -> Result<Box<dyn RemoteProcess>, TransportError>;
}

/// Program, arguments and environment for the remote side.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl RemoteCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn get_env(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Renders the command for a remote shell.
    ///
    /// With `with_env` the environment travels as an `env K=V ...` prefix,
    /// for servers that ignore `setenv` channel requests.
    pub fn to_shell_line(&self, with_env: bool) -> String {
        let mut words = Vec::new();
        if with_env && !self.env.is_empty() {
            words.push("env".to_string());
            for (key, value) in &self.env {
                words.push(format!("{key}={}", shell_quote(value)));
            }
        }
        words.push(shell_quote(&self.program));
        words.extend(self.args.iter().map(|a| shell_quote(a)));
        words.join(" ")
    }
}

/// Quotes `s` for a POSIX shell, leaving plainly safe words alone.
pub fn shell_quote(s: &str) -> String {
    let safe = !s.is_empty()
        && s.bytes().all(|b| {
            b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'/' | b':' | b',' | b'=' | b'+' | b'@')
        });
    if safe {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

/// Runs the "remote" command on this machine.
#[derive(Debug, Clone, Default)]
pub struct LocalTransport;

impl LocalTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn open_reverse_listener(
        &self,
        bind_addr: &str,
    ) -> Result<Box<dyn ReverseListener>, TransportError> {
        let listener = TcpListener::bind((bind_addr, 0)).await?;
        let port = listener.local_addr()?.port();
        debug!(port, "local reverse listener ready");
        Ok(Box::new(LocalListener { listener, port }))
    }

    async fn spawn_remote(
        &self,
        command: RemoteCommand,
    ) -> Result<Box<dyn RemoteProcess>, TransportError> {
        debug!(program = %command.program, "spawning local process");
        let child = Command::new(&command.program)
            .args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        Ok(Box::new(LocalProcess { child }))
    }
}

struct LocalListener {
    listener: TcpListener,
    port: u16,
}

#[async_trait]
impl ReverseListener for LocalListener {
    fn port(&self) -> u16 {
        self.port
    }

    async fn accept(&mut self) -> Result<BoxedConnection, TransportError> {
        let (stream, peer) = self.listener.accept().await?;
        debug!(%peer, "accepted back-connection");
        Ok(Box::new(stream))
    }
}

struct LocalProcess {
    child: Child,
}

#[async_trait]
impl RemoteProcess for LocalProcess {
    async fn wait(&mut self) -> Result<i32, TransportError> {
        let status = self.child.wait().await?;
        Ok(exit_code(status))
    }
}

#[cfg(unix)]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(1)
}

#[cfg(not(unix))]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("ls"), "ls");
        assert_eq!(shell_quote("/usr/bin/env"), "/usr/bin/env");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("$HOME"), "'$HOME'");
    }

    #[test]
    fn test_shell_line_with_env_prefix() {
        let cmd = RemoteCommand::new("utsushi-remote")
            .env("UTSUSHI_NAMESPACE", "/home/me:/tmp")
            .env("UTSUSHI_PWD", "/home/me/my dir")
            .args(["sh", "-c", "echo hi"]);
        assert_eq!(
            cmd.to_shell_line(true),
            "env UTSUSHI_NAMESPACE=/home/me:/tmp UTSUSHI_PWD='/home/me/my dir' \
             utsushi-remote sh -c 'echo hi'"
        );
        assert_eq!(cmd.to_shell_line(false), "utsushi-remote sh -c 'echo hi'");
    }

    #[test]
    fn test_get_env_prefers_last() {
        let cmd = RemoteCommand::new("x").env("A", "1").env("A", "2");
        assert_eq!(cmd.get_env("A"), Some("2"));
        assert_eq!(cmd.get_env("B"), None);
    }

    #[tokio::test]
    async fn test_local_listener_accepts() {
        let transport = LocalTransport::new();
        let mut listener = transport.open_reverse_listener("127.0.0.1").await.unwrap();
        let port = listener.port();
        assert_ne!(port, 0);

        let dial = tokio::spawn(async move {
            let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            stream.write_all(b"ping").await.unwrap();
        });

        let mut conn = listener.accept().await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        dial.await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_local_process_exit_code_and_env() {
        let transport = LocalTransport::new();
        let cmd = RemoteCommand::new("sh")
            .env("UTSUSHI_TEST_CODE", "7")
            .args(["-c", "exit $UTSUSHI_TEST_CODE"]);
        let mut process = transport.spawn_remote(cmd).await.unwrap();
        assert_eq!(process.wait().await.unwrap(), 7);
    }
}
