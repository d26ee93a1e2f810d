//! The environment contract with `utsushi` on the client side.

use std::collections::HashMap;
use std::path::PathBuf;

use utsushi_client::constants::{
    ENV_FSTAB, ENV_MSIZE, ENV_NAMESPACE, ENV_NONCE, ENV_PORT9P, ENV_PWD,
};
use utsushi_client::{Nonce, NonceError};

use crate::constants::ENV_FALLBACK_SHELL;
use crate::fstab::{self, FstabEntry, FstabError};
use crate::namespace::NamespaceSpec;

#[derive(Debug, thiserror::Error)]
pub enum EnvError {
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
    #[error("UTSUSHI_NONCE: {0}")]
    Nonce(#[from] NonceError),
    #[error("UTSUSHI_FSTAB: {0}")]
    Fstab(#[from] FstabError),
}

/// Where to dial and what to present.
#[derive(Debug)]
pub struct BackChannel {
    pub port: u16,
    pub nonce: Nonce,
}

#[derive(Debug)]
pub struct RemoteEnv {
    pub namespace: NamespaceSpec,
    /// Absent exactly when the namespace is disabled.
    pub channel: Option<BackChannel>,
    pub fstab: Vec<FstabEntry>,
    pub pwd: Option<PathBuf>,
    pub msize: u32,
    pub fallback_shell: Option<String>,
}

impl RemoteEnv {
    pub fn from_map(vars: &HashMap<String, String>) -> Result<Self, EnvError> {
        let get = |name: &str| vars.get(name).map(String::as_str).filter(|v| !v.is_empty());

        let namespace = get(ENV_NAMESPACE).ok_or(EnvError::Missing(ENV_NAMESPACE))?;
        let namespace = NamespaceSpec::parse(namespace);

        let channel = if namespace.is_disabled() {
            None
        } else {
            let port = get(ENV_PORT9P).ok_or(EnvError::Missing(ENV_PORT9P))?;
            let port = port.parse::<u16>().map_err(|e| EnvError::Invalid {
                name: ENV_PORT9P,
                reason: e.to_string(),
            })?;
            let nonce = Nonce::parse(get(ENV_NONCE).ok_or(EnvError::Missing(ENV_NONCE))?)?;
            Some(BackChannel { port, nonce })
        };

        let msize = match get(ENV_MSIZE) {
            Some(v) => v.parse::<u32>().map_err(|e| EnvError::Invalid {
                name: ENV_MSIZE,
                reason: e.to_string(),
            })?,
            None => utsushi_9p::constants::DEFAULT_MSIZE,
        };

        let fstab = match get(ENV_FSTAB) {
            Some(text) => fstab::parse(text)?,
            None => Vec::new(),
        };

        Ok(Self {
            namespace,
            channel,
            fstab,
            pwd: get(ENV_PWD).map(PathBuf::from),
            msize,
            fallback_shell: get(ENV_FALLBACK_SHELL).map(str::to_owned),
        })
    }

    /// True when the remote needs its own mount namespace.
    pub fn needs_namespace(&self) -> bool {
        self.channel.is_some() || !self.fstab.is_empty()
    }
}

/// Variables that must not leak into the command's environment.
pub const PRIVATE_VARS: &[&str] = &[ENV_NONCE, ENV_PORT9P];
