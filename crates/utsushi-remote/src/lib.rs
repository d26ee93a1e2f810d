//! Remote side of utsushi.
//!
//! Started by the client over SSH with its instructions in the
//! environment ([`RemoteEnv`]). It dials the back-channel, mounts it, binds
//! the shared paths over the local tree and runs the target command in the
//! resulting private namespace ([`Assembler`]).

pub mod assembler;
pub mod constants;
pub mod dial;
pub mod env;
pub mod fstab;
pub mod mount;
pub mod namespace;
pub mod privilege;

pub use assembler::{AssemblyError, Assembler, State, Warning};
pub use env::{BackChannel, EnvError, RemoteEnv};
pub use fstab::{FstabEntry, FstabError, MountOptions};
#[cfg(target_os = "linux")]
pub use mount::LinuxMounter;
pub use mount::{Mounter, TransportOptions};
pub use namespace::{Bind, NamespaceSpec};
#[cfg(target_os = "linux")]
pub use privilege::LibcPrivileges;
pub use privilege::Privileges;
