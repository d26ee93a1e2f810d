//! Protocol limits.

/// Default ceiling for the negotiated message size (1 MiB).
pub const DEFAULT_MSIZE: u32 = 1024 * 1024;

/// Largest xattr value accepted through Txattrcreate, as on Linux.
pub const XATTR_SIZE_MAX: u64 = 64 * 1024;
