//! Client configuration constants.
//!
//! Centralizes defaults and the environment contract with `utsushi-remote`.

use std::time::Duration;

/// How long the remote side has to dial back and present the nonce.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(100);

/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// SSH inactivity timeout.
pub const SSH_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(300);

/// SSH keep-alive interval.
pub const SSH_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// SSH keep-alive max retries.
pub const SSH_KEEPALIVE_MAX: usize = 3;

/// Timeout for connecting and authenticating to the SSH server.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Address the reverse listener binds on the remote host.
pub const LOOPBACK: &str = "127.0.0.1";

/// Program started on the remote host when no other is configured.
pub const DEFAULT_REMOTE_BINARY: &str = "utsushi-remote";

/// Namespace value that disables file sharing for the session.
pub const NAMESPACE_NONE: &str = "none";

/// Environment variables read by `utsushi-remote`.
pub const ENV_NONCE: &str = "UTSUSHI_NONCE";
pub const ENV_PORT9P: &str = "UTSUSHI_PORT9P";
pub const ENV_NAMESPACE: &str = "UTSUSHI_NAMESPACE";
pub const ENV_FSTAB: &str = "UTSUSHI_FSTAB";
pub const ENV_PWD: &str = "UTSUSHI_PWD";
pub const ENV_MSIZE: &str = "UTSUSHI_MSIZE";

/// Config directory name under the platform config dir.
pub const CONFIG_DIR: &str = "utsushi";

/// Config file name inside [`CONFIG_DIR`].
pub const CONFIG_FILE: &str = "config.toml";

/// Paths shared with the remote command when none are configured.
pub const DEFAULT_NAMESPACE: &str = "/lib:/lib64:/usr:/bin:/etc:/home";
