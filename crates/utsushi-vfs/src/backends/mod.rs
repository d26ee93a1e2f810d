//! File-tree backends.
//!
//! Each backend implements [`Backend`](crate::Backend) and hands out
//! [`Node`](crate::Node) handles. The union holds other backends behind the
//! same trait, so unions nest.

mod archive;
#[cfg(unix)]
mod passthrough;
mod union;

pub use archive::{ArchiveBackend, ArchiveNode};
#[cfg(unix)]
pub use passthrough::{PassthroughBackend, PassthroughNode};
pub use union::{UnionBackend, UnionDir, UnionMount};
