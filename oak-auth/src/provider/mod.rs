//! Cryptographic Provider capability.
//!
//! The protocol engine never touches primitives directly. Everything it needs
//! (key generation, export/import, sign, encrypt, decrypt, verify) goes through
//! [`CryptoProvider`], keyed by [`KeyId`].
//!
//! Operations are blocking and may be slow (a provider can shell out to an
//! external process or talk to hardware). The engine runs them on the blocking
//! pool under a timeout; implementations don't need to be async.

mod error;
mod software;

pub use error::ProviderError;
pub use software::SoftwareProvider;

use crate::identity::{KeyId, SecretBytes};

/// Names a provider operation, for error context and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderOp {
    GenerateKeypair,
    ExportPublicKey,
    ImportPublicKey,
    Sign,
    VerifyOrDecrypt,
    Encrypt,
    Decrypt,
}

impl ProviderOp {
    /// Stable snake_case name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GenerateKeypair => "generate_keypair",
            Self::ExportPublicKey => "export_public_key",
            Self::ImportPublicKey => "import_public_key",
            Self::Sign => "sign",
            Self::VerifyOrDecrypt => "verify_or_decrypt",
            Self::Encrypt => "encrypt",
            Self::Decrypt => "decrypt",
        }
    }
}

impl std::fmt::Display for ProviderOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of [`CryptoProvider::verify_or_decrypt`].
#[derive(Debug)]
pub struct Opened {
    /// The authenticated (or decrypted) content.
    pub plaintext: SecretBytes,
    /// The key the content was authenticated for.
    pub key_id: KeyId,
    /// `true` if the blob carried a valid signature, `false` if it was only
    /// decrypted. Decryption alone proves nothing about the sender.
    pub signed: bool,
}

/// Trait for the external cryptographic capability.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; the engine shares one provider
/// across sessions and calls it from blocking-pool threads. Calls for
/// different key ids must not interfere with each other.
pub trait CryptoProvider: Send + Sync {
    /// Generate a key pair bound to `identity`, protected by `passphrase`.
    fn generate_keypair(&self, identity: &str, passphrase: &str) -> Result<KeyId, ProviderError>;

    /// Export the public half of `key_id` as opaque bytes.
    fn export_public_key(&self, key_id: &KeyId) -> Result<Vec<u8>, ProviderError>;

    /// Import a public key export; returns the key id it is known by.
    fn import_public_key(&self, bytes: &[u8]) -> Result<KeyId, ProviderError>;

    /// Produce a signed blob over `data` with the private half of `key_id`.
    ///
    /// The blob carries the signed content (attached signature), so
    /// [`verify_or_decrypt`](Self::verify_or_decrypt) can recover it.
    fn sign(&self, key_id: &KeyId, data: &[u8]) -> Result<Vec<u8>, ProviderError>;

    /// Authenticate a signed blob (or open an encrypted one) for `key_id`.
    ///
    /// Fails if the blob was not produced by `key_id`.
    fn verify_or_decrypt(&self, key_id: &KeyId, data: &[u8]) -> Result<Opened, ProviderError>;

    /// Encrypt `data` so only the holder of `key_id`'s private half can read it.
    fn encrypt(&self, key_id: &KeyId, data: &[u8]) -> Result<Vec<u8>, ProviderError>;

    /// Decrypt ciphertext addressed to `key_id`.
    fn decrypt(&self, key_id: &KeyId, data: &[u8]) -> Result<SecretBytes, ProviderError>;
}

impl<P: CryptoProvider + ?Sized> CryptoProvider for std::sync::Arc<P> {
    fn generate_keypair(&self, identity: &str, passphrase: &str) -> Result<KeyId, ProviderError> {
        (**self).generate_keypair(identity, passphrase)
    }

    fn export_public_key(&self, key_id: &KeyId) -> Result<Vec<u8>, ProviderError> {
        (**self).export_public_key(key_id)
    }

    fn import_public_key(&self, bytes: &[u8]) -> Result<KeyId, ProviderError> {
        (**self).import_public_key(bytes)
    }

    fn sign(&self, key_id: &KeyId, data: &[u8]) -> Result<Vec<u8>, ProviderError> {
        (**self).sign(key_id, data)
    }

    fn verify_or_decrypt(&self, key_id: &KeyId, data: &[u8]) -> Result<Opened, ProviderError> {
        (**self).verify_or_decrypt(key_id, data)
    }

    fn encrypt(&self, key_id: &KeyId, data: &[u8]) -> Result<Vec<u8>, ProviderError> {
        (**self).encrypt(key_id, data)
    }

    fn decrypt(&self, key_id: &KeyId, data: &[u8]) -> Result<SecretBytes, ProviderError> {
        (**self).decrypt(key_id, data)
    }
}
