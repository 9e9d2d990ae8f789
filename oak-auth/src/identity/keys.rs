//! Key material for OAK identities.
//!
//! Each key pair combines an Ed25519 signing key (proof of authenticity) with an
//! X25519 agreement key (proof of possession via sealed challenges):
//! - Private halves are zeroized on drop
//! - No Debug/Display implementations that leak secrets
//! - Key ids use constant-time comparison
//! - Software key id format: `SHA256:{url_safe_base64_no_padding}`

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::Signer;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Magic prefix of a public key export.
const EXPORT_MAGIC: &[u8; 4] = b"OAK1";

/// Length of a public key export: magic || ed25519 || x25519.
pub const PUBLIC_EXPORT_LEN: usize = 4 + 32 + 32;

/// Maximum accepted key id length.
const MAX_KEY_ID_LEN: usize = 256;

/// Errors that can occur during key operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum KeyError {
    /// The provided bytes have an invalid length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// The provided bytes do not represent a valid key.
    #[error("invalid key format")]
    InvalidFormat,

    /// The key id string is empty, too long, or contains control characters.
    #[error("invalid key id")]
    InvalidKeyId,
}

/// A zeroize-on-drop wrapper for secret bytes.
///
/// Holds decrypted challenges so that plaintext doesn't linger in memory.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SecretBytes(Vec<u8>);

impl SecretBytes {
    /// Wrap bytes that must be zeroized when dropped.
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Get a reference to the secret bytes.
    ///
    /// The returned reference should not be stored.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Copy out into a regular Vec that will NOT be zeroized.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.clone()
    }
}

impl From<Vec<u8>> for SecretBytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for SecretBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl std::ops::Deref for SecretBytes {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretBytes([{} bytes])", self.0.len())
    }
}

/// A private key pair: Ed25519 signing half plus X25519 agreement half.
///
/// # Security
///
/// - Both halves are zeroized on drop
/// - No `Debug` implementation to prevent accidental logging
/// - Never serialized
pub struct KeyPair {
    signing: ed25519_dalek::SigningKey,
    agreement: x25519_dalek::StaticSecret,
}

impl KeyPair {
    /// Generate a new random key pair.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            signing: ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng),
            agreement: x25519_dalek::StaticSecret::random_from_rng(rand::rngs::OsRng),
        }
    }

    /// Sign a message with the Ed25519 half.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing.sign(message))
    }

    /// Run X25519 agreement against a peer's (ephemeral) public key.
    pub(crate) fn agree(&self, peer: &x25519_dalek::PublicKey) -> x25519_dalek::SharedSecret {
        self.agreement.diffie_hellman(peer)
    }

    /// Derive the public half.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            verifying: self.signing.verifying_key(),
            agreement: x25519_dalek::PublicKey::from(&self.agreement),
        }
    }
}

// Explicitly NO Debug implementation for KeyPair

/// Public half of a key pair.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey {
    verifying: ed25519_dalek::VerifyingKey,
    agreement: x25519_dalek::PublicKey,
}

impl PublicKey {
    /// Load a public key from its export format.
    ///
    /// # Errors
    ///
    /// Returns `KeyError::InvalidLength` if the slice is not exactly
    /// [`PUBLIC_EXPORT_LEN`] bytes, `KeyError::InvalidFormat` if the magic is
    /// wrong or the Ed25519 point is invalid.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        if bytes.len() != PUBLIC_EXPORT_LEN {
            return Err(KeyError::InvalidLength {
                expected: PUBLIC_EXPORT_LEN,
                actual: bytes.len(),
            });
        }
        if &bytes[..4] != EXPORT_MAGIC {
            return Err(KeyError::InvalidFormat);
        }

        let verifying: [u8; 32] = bytes[4..36].try_into().map_err(|_| KeyError::InvalidFormat)?;
        let agreement: [u8; 32] = bytes[36..68].try_into().map_err(|_| KeyError::InvalidFormat)?;

        let verifying = ed25519_dalek::VerifyingKey::from_bytes(&verifying)
            .map_err(|_| KeyError::InvalidFormat)?;

        Ok(Self {
            verifying,
            agreement: x25519_dalek::PublicKey::from(agreement),
        })
    }

    /// Export as `magic || ed25519 || x25519`.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; PUBLIC_EXPORT_LEN] {
        let mut out = [0u8; PUBLIC_EXPORT_LEN];
        out[..4].copy_from_slice(EXPORT_MAGIC);
        out[4..36].copy_from_slice(self.verifying.as_bytes());
        out[36..68].copy_from_slice(self.agreement.as_bytes());
        out
    }

    /// Verify a signature over a message.
    ///
    /// Uses `verify_strict` to reject weak/small-order keys.
    #[must_use]
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.verifying.verify_strict(message, &signature.0).is_ok()
    }

    pub(crate) fn agreement_key(&self) -> &x25519_dalek::PublicKey {
        &self.agreement
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", KeyId::from_public_key(self))
    }
}

/// An Ed25519 signature.
#[derive(Clone, PartialEq, Eq)]
pub struct Signature(ed25519_dalek::Signature);

impl Signature {
    /// Encoded signature length.
    pub const LEN: usize = 64;

    /// Load a signature from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns `KeyError::InvalidLength` if the slice is not exactly 64 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let bytes: [u8; 64] = bytes.try_into().map_err(|_| KeyError::InvalidLength {
            expected: Self::LEN,
            actual: bytes.len(),
        })?;
        Ok(Self(ed25519_dalek::Signature::from_bytes(&bytes)))
    }

    /// Export the raw signature bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 64] {
        self.0.to_bytes()
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bytes = self.0.to_bytes();
        write!(
            f,
            "Signature({:02x}{:02x}{:02x}{:02x}...)",
            bytes[0], bytes[1], bytes[2], bytes[3]
        )
    }
}

/// Stable identifier of a key pair.
///
/// Providers choose the format: GPG fingerprints are 40 hex characters, the
/// software keyring uses `SHA256:{base64_no_padding}` of the public export.
///
/// # Security
///
/// Comparisons use constant-time equality. `Hash` is derived because the id
/// itself is public; only equality needs timing-attack protection.
#[derive(Clone, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
#[allow(clippy::derived_hash_with_manual_eq)]
pub struct KeyId(String);

impl KeyId {
    /// The prefix used for software key ids.
    pub const PREFIX: &'static str = "SHA256:";

    /// Validate and wrap a provider-issued key id.
    ///
    /// # Errors
    ///
    /// Returns `KeyError::InvalidKeyId` if the string is empty, longer than
    /// 256 bytes, or contains whitespace or control characters.
    pub fn new(id: impl Into<String>) -> Result<Self, KeyError> {
        let id = id.into();
        if id.is_empty()
            || id.len() > MAX_KEY_ID_LEN
            || id.chars().any(|c| c.is_control() || c.is_whitespace())
        {
            return Err(KeyError::InvalidKeyId);
        }
        Ok(Self(id))
    }

    /// Derive the key id of a software public key.
    #[must_use]
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        let hash = Sha256::digest(public_key.to_bytes());
        Self(format!("{}{}", Self::PREFIX, URL_SAFE_NO_PAD.encode(hash)))
    }

    /// Get the key id as a string reference.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for KeyId {
    type Error = KeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<KeyId> for String {
    fn from(id: KeyId) -> Self {
        id.0
    }
}

impl std::str::FromStr for KeyId {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl PartialEq for KeyId {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_bytes().ct_eq(other.0.as_bytes()).into()
    }
}

impl std::fmt::Display for KeyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Debug for KeyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyId({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_generation_and_signing() {
        let pair = KeyPair::generate();
        let public_key = pair.public_key();

        let message = b"test message";
        let signature = pair.sign(message);

        assert!(public_key.verify(message, &signature));
    }

    #[test]
    fn test_public_key_export_roundtrip() {
        let pair = KeyPair::generate();
        let exported = pair.public_key().to_bytes();

        assert_eq!(&exported[..4], b"OAK1");
        let restored = PublicKey::from_bytes(&exported).unwrap();
        assert_eq!(restored, pair.public_key());
    }

    #[test]
    fn test_public_key_bad_magic_rejected() {
        let mut exported = KeyPair::generate().public_key().to_bytes();
        exported[0] = b'X';
        assert_eq!(PublicKey::from_bytes(&exported), Err(KeyError::InvalidFormat));
    }

    #[test]
    fn test_key_id_format() {
        let pair = KeyPair::generate();
        let key_id = KeyId::from_public_key(&pair.public_key());

        assert!(key_id.as_str().starts_with("SHA256:"));
        // 7 (prefix) + 43 (32 bytes base64, no padding)
        assert_eq!(key_id.as_str().len(), 50);
    }

    #[test]
    fn test_key_id_deterministic() {
        let public_key = KeyPair::generate().public_key();
        assert_eq!(
            KeyId::from_public_key(&public_key),
            KeyId::from_public_key(&public_key)
        );
    }

    #[test]
    fn test_key_id_validation() {
        assert!(KeyId::new("3AA5C34371567BD2F1B5D0D3C2A1E4C8B5F0A1D2").is_ok());
        assert_eq!(KeyId::new(""), Err(KeyError::InvalidKeyId));
        assert_eq!(KeyId::new("has space"), Err(KeyError::InvalidKeyId));
        assert_eq!(KeyId::new("line\nbreak"), Err(KeyError::InvalidKeyId));
        assert_eq!(KeyId::new("x".repeat(257)), Err(KeyError::InvalidKeyId));
    }

    #[test]
    fn test_key_id_serde_rejects_invalid() {
        let parsed: Result<KeyId, _> = serde_json::from_str("\"\"");
        assert!(parsed.is_err());

        let parsed: KeyId = serde_json::from_str("\"ABCDEF\"").unwrap();
        assert_eq!(parsed.as_str(), "ABCDEF");
    }

    #[test]
    fn test_signature_wrong_key_rejected() {
        let pair1 = KeyPair::generate();
        let pair2 = KeyPair::generate();

        let signature = pair1.sign(b"test message");
        assert!(!pair2.public_key().verify(b"test message", &signature));
    }

    #[test]
    fn test_invalid_lengths() {
        assert!(PublicKey::from_bytes(&[0u8; 16]).is_err());
        assert!(Signature::from_bytes(&[0u8; 32]).is_err());
        assert!(PublicKey::from_bytes(&[0u8; 128]).is_err());
        assert!(Signature::from_bytes(&[0u8; 128]).is_err());
    }

    #[test]
    fn test_secret_bytes_debug_hides_content() {
        let secret = SecretBytes::new(b"nonce-1".to_vec());
        assert_eq!(format!("{secret:?}"), "SecretBytes([7 bytes])");
        assert_eq!(secret.as_bytes(), b"nonce-1");
    }
}
