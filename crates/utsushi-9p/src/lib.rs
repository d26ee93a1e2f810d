//! 9P2000.L over any byte stream.
//!
//! - [`fcall`] - message bodies and their wire encoding
//! - [`NinePCodec`] - length-prefixed framing for `tokio_util::codec`
//! - [`serve`] - the dispatcher that answers requests from a
//!   [`utsushi_vfs::Backend`]
//!
//! The server owns no sockets: hand it whatever stream the back-channel
//! produced.

pub mod codec;
pub mod constants;
mod error;
pub mod fcall;
mod server;

pub use codec::NinePCodec;
pub use error::{ProtocolError, ServeError};
pub use fcall::{Fcall, Msg};
pub use server::{ServerConfig, serve};
