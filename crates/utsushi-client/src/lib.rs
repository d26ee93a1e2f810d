//! Client side of utsushi.
//!
//! A [`Session`] starts a command on a remote host through a [`Transport`]
//! and serves it part of the local file tree over a reverse-forwarded
//! back-channel:
//!
//! 1. open a reverse listener on the remote loopback
//! 2. start `utsushi-remote` with a fresh [`Nonce`] in its environment
//! 3. accept one connection that presents the nonce ([`accept_authenticated`])
//! 4. serve 9P2000.L on it until the remote command exits

pub mod config;
pub mod constants;
mod handshake;
mod nonce;
mod session;
pub mod ssh;
pub mod transport;

pub use config::{ArchiveMount, ClientConfig, ConfigError};
pub use handshake::{HandshakeError, accept_authenticated};
pub use nonce::{NONCE_LEN, Nonce, NonceError};
pub use session::{Session, SessionError, SessionOptions, backend_from_config};
pub use ssh::{SshConfig, SshError, SshTransport};
pub use transport::{
    BoxedConnection, LocalTransport, RemoteCommand, RemoteProcess, ReverseListener, Transport,
    TransportError,
};
