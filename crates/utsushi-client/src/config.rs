//! Client configuration file (`~/.config/utsushi/config.toml`).
//!
//! Every field has a default, so an empty or missing file is valid.
//! Command-line flags are applied on top by the binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::constants::{
    CONFIG_DIR, CONFIG_FILE, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_NAMESPACE, DEFAULT_REMOTE_BINARY,
    DEFAULT_SSH_PORT,
};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// A CPIO archive served at `prefix` inside the remote's view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveMount {
    pub prefix: String,
    pub path: PathBuf,
}

impl ArchiveMount {
    /// Parses `prefix=path`, as given on the command line.
    pub fn parse(s: &str) -> Option<Self> {
        let (prefix, path) = s.split_once('=')?;
        if path.is_empty() {
            return None;
        }
        Some(Self {
            prefix: prefix.to_string(),
            path: PathBuf::from(path),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: Option<String>,
    pub port: u16,
    pub user: Option<String>,
    /// Colon-separated paths to share, or `none`.
    pub namespace: String,
    /// Local directory served as the remote's view of `/`.
    pub root: PathBuf,
    /// Archives layered over `root`, first match wins.
    pub archives: Vec<ArchiveMount>,
    pub handshake_timeout_ms: u64,
    pub msize: u32,
    pub remote_binary: String,
    pub env_in_command: bool,
    /// Extra mounts for the remote, fstab syntax.
    pub fstab: Option<String>,
    pub verbose: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: DEFAULT_SSH_PORT,
            user: None,
            namespace: DEFAULT_NAMESPACE.into(),
            root: PathBuf::from("/"),
            archives: Vec::new(),
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT.as_millis() as u64,
            msize: utsushi_9p::constants::DEFAULT_MSIZE,
            remote_binary: DEFAULT_REMOTE_BINARY.into(),
            env_in_command: true,
            fstab: None,
            verbose: false,
        }
    }
}

impl ClientConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn from_toml(text: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Loads an explicitly named file; a missing file is an error.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text, path)
    }
}

/// Get the config file path (~/.config/utsushi/config.toml).
pub fn config_file_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join(CONFIG_DIR).join(CONFIG_FILE))
}

/// Load the user's config file.
///
/// If the file doesn't exist or has errors, returns the defaults and logs a warning.
pub fn load_config() -> ClientConfig {
    let Some(path) = config_file_path() else {
        return ClientConfig::default();
    };

    if !path.exists() {
        return ClientConfig::default();
    }

    match ClientConfig::load_from(&path) {
        Ok(config) => {
            info!("Loaded config from {:?}", path);
            config
        }
        Err(e) => {
            warn!("{}", e);
            warn!("Falling back to default config");
            ClientConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_is_defaults() {
        let config = ClientConfig::from_toml("", Path::new("x.toml")).unwrap();
        assert_eq!(config, ClientConfig::default());
        assert_eq!(config.handshake_timeout(), Duration::from_millis(100));
        assert_eq!(config.msize, 1024 * 1024);
        assert_eq!(config.remote_binary, "utsushi-remote");
    }

    #[test]
    fn test_partial_file() {
        let text = r#"
            host = "build01"
            namespace = "/home/me"
            handshake_timeout_ms = 2000

            [[archives]]
            prefix = "opt/tools"
            path = "/srv/tools.cpio"
        "#;
        let config = ClientConfig::from_toml(text, Path::new("x.toml")).unwrap();
        assert_eq!(config.host.as_deref(), Some("build01"));
        assert_eq!(config.namespace, "/home/me");
        assert_eq!(config.handshake_timeout(), Duration::from_secs(2));
        assert_eq!(
            config.archives,
            vec![ArchiveMount {
                prefix: "opt/tools".into(),
                path: "/srv/tools.cpio".into(),
            }]
        );
        assert_eq!(config.port, 22);
    }

    #[test]
    fn test_bad_file_reports_path() {
        let err = ClientConfig::from_toml("port = \"x\"", Path::new("/etc/u.toml")).unwrap_err();
        assert!(err.to_string().contains("/etc/u.toml"));
    }

    #[test]
    fn test_load_from_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = ClientConfig::load_from(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_archive_mount_parse() {
        assert_eq!(
            ArchiveMount::parse("home=/tmp/b.cpio"),
            Some(ArchiveMount {
                prefix: "home".into(),
                path: "/tmp/b.cpio".into(),
            })
        );
        assert_eq!(
            ArchiveMount::parse("=/a.cpio").map(|m| m.prefix),
            Some(String::new())
        );
        assert_eq!(ArchiveMount::parse("home"), None);
        assert_eq!(ArchiveMount::parse("home="), None);
    }
}
