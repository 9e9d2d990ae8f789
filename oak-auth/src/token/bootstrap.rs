//! Bootstrap tokens (protocol version 0).
//!
//! A bootstrap token is nothing but the base64 public key export the client
//! announces once, before any challenge exists. It is a separate type from
//! [`Token`](super::Token) and the two are never interchangeable.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use super::codec::{CHALLENGE_SEPARATOR, MAX_TOKEN_LEN, TAG_SEPARATOR};
use super::TokenError;

/// Wire protocol version of a token string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenVersion {
    /// Bare public key export.
    Bootstrap = 0,
    /// `challenge-fields|tag`.
    Rolling = 1,
}

impl TokenVersion {
    /// Classify a wire string by its separators.
    ///
    /// This only decides which decoder to use; it doesn't validate.
    #[must_use]
    pub fn detect(raw: &str) -> Self {
        if raw.contains(CHALLENGE_SEPARATOR) && raw.contains(TAG_SEPARATOR) {
            Self::Rolling
        } else {
            Self::Bootstrap
        }
    }
}

/// The identity announcement produced by `init_token`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapToken {
    encoded: String,
    public_key: Vec<u8>,
}

impl BootstrapToken {
    /// Wrap a provider's public key export.
    #[must_use]
    pub fn from_public_key(public_key: Vec<u8>) -> Self {
        Self {
            encoded: STANDARD.encode(&public_key),
            public_key,
        }
    }

    /// Parse a bootstrap token received from a client.
    ///
    /// # Errors
    ///
    /// Returns `TokenError::Malformed` if the input is empty, too long, a
    /// rolling token, or not valid base64.
    pub fn from_wire(raw: &str) -> Result<Self, TokenError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(TokenError::Malformed("empty bootstrap token"));
        }
        if raw.len() > MAX_TOKEN_LEN {
            return Err(TokenError::Malformed("token too long"));
        }
        if TokenVersion::detect(raw) != TokenVersion::Bootstrap {
            return Err(TokenError::Malformed("expected a bootstrap token"));
        }
        let public_key = STANDARD
            .decode(raw)
            .map_err(|_| TokenError::Malformed("bootstrap token is not valid base64"))?;
        Ok(Self {
            encoded: raw.to_string(),
            public_key,
        })
    }

    /// The wire string.
    #[must_use]
    pub fn to_wire(&self) -> &str {
        &self.encoded
    }

    /// The public key export bytes.
    #[must_use]
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }
}

impl std::fmt::Display for BootstrapToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_roundtrip() {
        let token = BootstrapToken::from_public_key(b"public key export".to_vec());
        let parsed = BootstrapToken::from_wire(token.to_wire()).unwrap();

        assert_eq!(parsed, token);
        assert_eq!(parsed.public_key(), b"public key export");
    }

    #[test]
    fn test_rejects_rolling_token() {
        assert_eq!(
            BootstrapToken::from_wire("YQ==-e30=|YQ=="),
            Err(TokenError::Malformed("expected a bootstrap token"))
        );
    }

    #[test]
    fn test_rejects_empty_and_invalid() {
        assert!(BootstrapToken::from_wire("  ").is_err());
        assert!(BootstrapToken::from_wire("not base64!").is_err());
    }

    #[test]
    fn test_version_detection() {
        assert_eq!(TokenVersion::detect("YWJj"), TokenVersion::Bootstrap);
        assert_eq!(TokenVersion::detect("YQ==-e30=|YQ=="), TokenVersion::Rolling);
        // One separator alone isn't a rolling token.
        assert_eq!(TokenVersion::detect("YQ==-e30="), TokenVersion::Bootstrap);
    }
}
