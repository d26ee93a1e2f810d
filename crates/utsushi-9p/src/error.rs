//! Protocol error types.

use std::io;
use thiserror::Error;

/// Framing or decoding failure on the wire.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("frame of {size} bytes exceeds negotiated msize {max}")]
    FrameTooLarge { size: u32, max: u32 },

    #[error("frame of {0} bytes is shorter than a header")]
    FrameTooShort(u32),

    #[error("truncated {0} message")]
    Truncated(u8),

    #[error("trailing bytes after {0} message")]
    TrailingBytes(u8),

    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    #[error("invalid field: {0}")]
    InvalidField(&'static str),
}

/// Why a serve loop ended early.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl From<io::Error> for ServeError {
    fn from(e: io::Error) -> Self {
        Self::Protocol(ProtocolError::Io(e))
    }
}
