//! One-shot authenticator for the back-channel.

use std::fmt;
use std::sync::atomic::{Ordering, compiler_fence};

use rand::RngCore;
use rand::rngs::OsRng;

/// Length of the token on the wire, in bytes.
pub const NONCE_LEN: usize = 32;

/// 32 lowercase hex characters drawn from the OS random source.
///
/// Handed to the remote through its environment and written back verbatim
/// as the first bytes of the dialed connection. The buffer is wiped on drop.
pub struct Nonce([u8; NONCE_LEN]);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NonceError {
    #[error("nonce must be {NONCE_LEN} characters, got {0}")]
    Length(usize),
    #[error("nonce must be lowercase hex")]
    NotHex,
}

impl Nonce {
    pub fn generate() -> Self {
        let mut raw = [0u8; NONCE_LEN / 2];
        OsRng.fill_bytes(&mut raw);
        let encoded = hex::encode(raw);
        raw.fill(0);

        let mut token = [0u8; NONCE_LEN];
        token.copy_from_slice(encoded.as_bytes());
        Self(token)
    }

    /// Accepts a token received from the environment.
    pub fn parse(s: &str) -> Result<Self, NonceError> {
        let bytes = s.as_bytes();
        if bytes.len() != NONCE_LEN {
            return Err(NonceError::Length(bytes.len()));
        }
        if !bytes.iter().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(NonceError::NotHex);
        }
        let mut token = [0u8; NONCE_LEN];
        token.copy_from_slice(bytes);
        Ok(Self(token))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        // Only ever holds ASCII hex.
        std::str::from_utf8(&self.0).unwrap_or_default()
    }

    /// Constant-time comparison against bytes read off the wire.
    pub fn matches(&self, candidate: &[u8]) -> bool {
        if candidate.len() != NONCE_LEN {
            return false;
        }
        let diff = self
            .0
            .iter()
            .zip(candidate)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b));
        diff == 0
    }
}

impl Drop for Nonce {
    fn drop(&mut self) {
        self.0.fill(0);
        compiler_fence(Ordering::SeqCst);
    }
}

impl fmt::Debug for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Nonce(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_is_hex_of_expected_length() {
        let nonce = Nonce::generate();
        assert_eq!(nonce.as_bytes().len(), NONCE_LEN);
        assert!(Nonce::parse(nonce.as_str()).is_ok());
    }

    #[test]
    fn test_generate_differs() {
        assert!(!Nonce::generate().matches(Nonce::generate().as_bytes()));
    }

    #[test]
    fn test_matches_exact_only() {
        let nonce = Nonce::parse("0123456789abcdef0123456789abcdef").unwrap();
        assert!(nonce.matches(b"0123456789abcdef0123456789abcdef"));
        assert!(!nonce.matches(b"0123456789abcdef0123456789abcdee"));
        assert!(!nonce.matches(b"0123456789abcdef"));
        assert!(!nonce.matches(b""));
    }

    #[test]
    fn test_parse_rejects_bad_tokens() {
        assert_eq!(Nonce::parse("abc").unwrap_err(), NonceError::Length(3));
        assert_eq!(
            Nonce::parse("0123456789ABCDEF0123456789abcdef").unwrap_err(),
            NonceError::NotHex
        );
    }

    #[test]
    fn test_debug_hides_token() {
        let nonce = Nonce::generate();
        assert_eq!(format!("{nonce:?}"), "Nonce(..)");
    }
}
