//! Turns a reverse listener into one authenticated back-channel.

use std::io;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::nonce::{NONCE_LEN, Nonce};
use crate::transport::{BoxedConnection, ReverseListener, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("Back-connection presented the wrong nonce")]
    Authentication,
    #[error("No authenticated back-connection within {0:?}")]
    Timeout(Duration),
    #[error("I/O error during handshake: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Accepts exactly one connection from `listener` and checks that it opens
/// with `nonce`.
///
/// The listener is consumed whatever the outcome. On timeout the accepting
/// task is aborted, which drops the listener and any half-read connection.
pub async fn accept_authenticated(
    listener: Box<dyn ReverseListener>,
    nonce: &Nonce,
    timeout: Duration,
) -> Result<BoxedConnection, HandshakeError> {
    let port = listener.port();
    let mut accepting = tokio::spawn(async move {
        let mut listener = listener;
        let accepted = listener.accept().await;
        drop(listener);

        let mut conn = accepted?;
        let mut presented = [0u8; NONCE_LEN];
        conn.read_exact(&mut presented).await?;
        Ok::<_, HandshakeError>((conn, presented))
    });

    tokio::select! {
        joined = &mut accepting => {
            let (conn, mut presented) = joined.map_err(io::Error::other)??;
            let ok = nonce.matches(&presented);
            presented.fill(0);
            if ok {
                debug!(port, "back-connection authenticated");
                Ok(conn)
            } else {
                warn!(port, "back-connection rejected: nonce mismatch");
                Err(HandshakeError::Authentication)
            }
        }
        _ = tokio::time::sleep(timeout) => {
            accepting.abort();
            warn!(port, ?timeout, "handshake timed out");
            Err(HandshakeError::Timeout(timeout))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{LocalTransport, Transport};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    const GENEROUS: Duration = Duration::from_secs(5);

    // Needed so `Result<Box<dyn Connection>, _>::unwrap_err` compiles in tests.
    impl std::fmt::Debug for dyn crate::transport::Connection {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("Connection")
        }
    }

    async fn listener() -> (Box<dyn ReverseListener>, u16) {
        let listener = LocalTransport::new()
            .open_reverse_listener("127.0.0.1")
            .await
            .unwrap();
        let port = listener.port();
        (listener, port)
    }

    fn dial(port: u16, token: Vec<u8>) -> tokio::task::JoinHandle<TcpStream> {
        tokio::spawn(async move {
            let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            stream.write_all(&token).await.unwrap();
            stream
        })
    }

    #[tokio::test]
    async fn test_matching_nonce_accepted() {
        let (listener, port) = listener().await;
        let nonce = Nonce::generate();
        let remote = dial(port, nonce.as_bytes().to_vec());

        let mut conn = accept_authenticated(listener, &nonce, GENEROUS).await.unwrap();
        let mut remote = remote.await.unwrap();
        remote.write_all(b"after").await.unwrap();
        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"after");
    }

    #[tokio::test]
    async fn test_other_nonce_rejected() {
        let (listener, port) = listener().await;
        let nonce = Nonce::generate();
        let other = Nonce::generate();
        let _remote = dial(port, other.as_bytes().to_vec());

        let err = accept_authenticated(listener, &nonce, GENEROUS).await.unwrap_err();
        assert!(matches!(err, HandshakeError::Authentication));
    }

    #[tokio::test]
    async fn test_short_token_is_io_error() {
        let (listener, port) = listener().await;
        let nonce = Nonce::generate();
        let remote = dial(port, b"short".to_vec());
        tokio::spawn(async move { drop(remote.await) });

        let err = accept_authenticated(listener, &nonce, GENEROUS).await.unwrap_err();
        assert!(matches!(err, HandshakeError::Io(_)));
    }

    #[tokio::test]
    async fn test_times_out_without_dial() {
        let (listener, port) = listener().await;
        let nonce = Nonce::generate();

        let err = accept_authenticated(listener, &nonce, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::Timeout(_)));

        // Aborting the task closes the listener.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    }

    #[tokio::test]
    async fn test_accepts_only_once() {
        let (listener, port) = listener().await;
        let nonce = Nonce::generate();
        let remote = dial(port, nonce.as_bytes().to_vec());

        let _conn = accept_authenticated(listener, &nonce, GENEROUS).await.unwrap();
        let _remote = remote.await.unwrap();
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    }
}
