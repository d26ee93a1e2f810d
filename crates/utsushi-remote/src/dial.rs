//! Remote end of the handshake.

use std::io::{self, Write};
use std::net::TcpStream;

use utsushi_client::Nonce;
use utsushi_client::constants::LOOPBACK;

/// Connects to the forwarded port and presents `nonce`.
///
/// The returned stream carries 9P from the next byte on.
pub fn dial(port: u16, nonce: &Nonce) -> io::Result<TcpStream> {
    let mut stream = TcpStream::connect((LOOPBACK, port))?;
    stream.set_nodelay(true)?;
    stream.write_all(nonce.as_bytes())?;
    stream.flush()?;
    tracing::debug!(port, "presented nonce");
    Ok(stream)
}
