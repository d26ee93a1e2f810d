//! Remote-side constants. Environment names shared with the client live in
//! [`utsushi_client::constants`].

/// Where the back-channel is mounted before binds are applied.
pub const STAGING_PATH: &str = "/tmp/utsushi";

/// Shell to start for diagnosis when assembly degraded or failed.
pub const ENV_FALLBACK_SHELL: &str = "UTSUSHI_FALLBACK_SHELL";

/// Filesystem type of the transport mount.
pub const TRANSPORT_FSTYPE: &str = "9p";

/// Source name shown in the mount table for the transport mount.
pub const TRANSPORT_SOURCE: &str = "utsushi";

/// Shell used when no command is given and `$SHELL` is unset.
pub const DEFAULT_SHELL: &str = "/bin/sh";
