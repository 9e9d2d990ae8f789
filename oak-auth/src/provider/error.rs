//! Provider error types.

use crate::identity::KeyId;

/// Errors reported by a [`CryptoProvider`](super::CryptoProvider).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ProviderError {
    /// No key with this id is known.
    #[error("unknown key {0}")]
    UnknownKey(KeyId),

    /// Only the public half of this key is known.
    #[error("no secret key for {0}")]
    MissingSecretKey(KeyId),

    /// The private half exists but is locked.
    #[error("key {0} is locked")]
    Locked(KeyId),

    /// A public key export could not be parsed.
    #[error("malformed public key: {0}")]
    MalformedKey(String),

    /// A signed or encrypted blob has an unrecognized layout.
    #[error("malformed payload")]
    MalformedPayload,

    /// The ciphertext was not encrypted for this key, or is corrupt.
    #[error("ciphertext not addressed to this key")]
    NotForThisKey,

    /// The signature does not verify.
    #[error("signature mismatch")]
    SignatureMismatch,

    /// The content is authentic but was produced by another key.
    #[error("identity mismatch: expected {expected}, got {actual}")]
    IdentityMismatch { expected: KeyId, actual: KeyId },

    /// The provider backend cannot be reached (missing binary, device gone).
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// Any other backend failure.
    #[error("provider failure: {0}")]
    Backend(String),
}
