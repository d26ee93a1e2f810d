//! One remote command, start to finish.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use utsushi_9p::ServerConfig;
use utsushi_vfs::{ArchiveBackend, Backend, PassthroughBackend, UnionBackend, UnionMount, VfsError};

use crate::config::{ArchiveMount, ClientConfig};
use crate::constants::{
    ENV_FSTAB, ENV_MSIZE, ENV_NAMESPACE, ENV_NONCE, ENV_PORT9P, ENV_PWD, LOOPBACK, NAMESPACE_NONE,
};
use crate::handshake::{HandshakeError, accept_authenticated};
use crate::nonce::Nonce;
use crate::transport::{RemoteCommand, Transport, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error("Failed to prepare served tree: {0}")]
    Backend(#[from] VfsError),
}

/// Everything about a session except the transport and the tree.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub namespace: String,
    pub fstab: Option<String>,
    /// Working directory for the remote command.
    pub pwd: Option<String>,
    pub msize: u32,
    pub handshake_timeout: Duration,
    pub remote_binary: String,
    pub trace_requests: bool,
}

impl SessionOptions {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            namespace: config.namespace.clone(),
            fstab: config.fstab.clone(),
            pwd: None,
            msize: config.msize,
            handshake_timeout: config.handshake_timeout(),
            remote_binary: config.remote_binary.clone(),
            trace_requests: config.verbose,
        }
    }

    /// True when the namespace sentinel turns file sharing off.
    pub fn sharing_disabled(&self) -> bool {
        self.namespace == NAMESPACE_NONE
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

pub struct Session {
    transport: Arc<dyn Transport>,
    backend: Arc<dyn Backend>,
    options: SessionOptions,
}

impl Session {
    pub fn new(
        transport: Arc<dyn Transport>,
        backend: Arc<dyn Backend>,
        options: SessionOptions,
    ) -> Self {
        Self {
            transport,
            backend,
            options,
        }
    }

    /// Runs `command` on the remote and serves the tree until it exits.
    ///
    /// Returns the remote command's exit code.
    pub async fn run(&self, command: &[String]) -> Result<i32, SessionError> {
        let mut remote = RemoteCommand::new(&self.options.remote_binary)
            .env(ENV_NAMESPACE, &self.options.namespace)
            .args(command.iter().cloned());
        if let Some(pwd) = &self.options.pwd {
            remote = remote.env(ENV_PWD, pwd);
        }

        if self.options.sharing_disabled() {
            info!("namespace sharing disabled, running without back-channel");
            let mut process = self.transport.spawn_remote(remote).await?;
            return Ok(process.wait().await?);
        }

        let listener = self.transport.open_reverse_listener(LOOPBACK).await?;
        let port = listener.port();
        let nonce = Nonce::generate();

        remote = remote
            .env(ENV_NONCE, nonce.as_str())
            .env(ENV_PORT9P, port.to_string())
            .env(ENV_MSIZE, self.options.msize.to_string());
        if let Some(fstab) = &self.options.fstab {
            remote = remote.env(ENV_FSTAB, fstab);
        }

        let mut process = self.transport.spawn_remote(remote).await?;
        let conn = accept_authenticated(listener, &nonce, self.options.handshake_timeout).await?;
        drop(nonce);

        let server_config = ServerConfig {
            max_msize: self.options.msize,
            trace_requests: self.options.trace_requests,
        };
        let backend = self.backend.clone();
        let serving = tokio::spawn(async move {
            match utsushi_9p::serve(conn, backend, server_config).await {
                Ok(()) => debug!(port, "back-channel closed"),
                Err(e) => warn!(port, "back-channel ended: {}", e),
            }
        });

        let code = process.wait().await;
        serving.abort();
        let code = code?;
        info!(code, "remote command finished");
        Ok(code)
    }
}

/// Builds the served tree for `config`: archives in order, then the local
/// root as the catch-all.
pub async fn backend_from_config(config: &ClientConfig) -> Result<Arc<dyn Backend>, SessionError> {
    let root: Arc<dyn Backend> = Arc::new(PassthroughBackend::new(&config.root));
    if config.archives.is_empty() {
        return Ok(root);
    }

    let mut mounts = Vec::with_capacity(config.archives.len() + 1);
    for ArchiveMount { prefix, path } in &config.archives {
        let archive = ArchiveBackend::open(path).await?;
        debug!(prefix, path = %path.display(), entries = archive.len(), "archive mounted");
        mounts.push(UnionMount::new(prefix, Arc::new(archive)));
    }
    mounts.push(UnionMount::new("", root));
    Ok(Arc::new(UnionBackend::new(mounts)))
}
