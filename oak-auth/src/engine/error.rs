//! Protocol error taxonomy.

use std::time::Duration;

use crate::identity::KeyId;
use crate::provider::{ProviderError, ProviderOp};
use crate::token::TokenError;

/// Errors surfaced by the protocol engine, client sessions and the issuer.
///
/// Every provider failure keeps the operation and key id it happened on, so
/// callers can decide between retrying and re-bootstrapping.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum AuthError {
    /// Structural decode failure.
    #[error("malformed token: {0}")]
    MalformedToken(&'static str),

    /// The token's fields don't carry the key id.
    #[error("token fields lack the key id")]
    MissingKeyId,

    /// Application data tried to use the reserved key id member.
    #[error("field name {0:?} is reserved")]
    ReservedField(String),

    /// The challenge was not encrypted for this key, or is corrupt.
    #[error("challenge could not be decrypted with key {key_id}")]
    DecryptionFailed { key_id: KeyId },

    /// The provider failed for a reason other than key mismatch.
    #[error("{op} failed{}: {source}", key_suffix(.key_id))]
    ProviderUnavailable {
        op: ProviderOp,
        key_id: Option<KeyId>,
        source: ProviderError,
    },

    /// A provider call did not finish in time.
    #[error("{op} timed out after {after:?}{}", key_suffix(.key_id))]
    ProviderTimeout {
        op: ProviderOp,
        key_id: Option<KeyId>,
        after: Duration,
    },

    /// The key id is absent or not known to the provider.
    #[error("unknown identity{}", key_suffix(.key_id))]
    UnknownIdentity { key_id: Option<KeyId> },

    /// Server-side verification rejected the token.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(&'static str),

    /// The session holds no token to roll.
    #[error("session holds no token")]
    NoToken,
}

fn key_suffix(key_id: &Option<KeyId>) -> String {
    key_id
        .as_ref()
        .map(|key_id| format!(" for key {key_id}"))
        .unwrap_or_default()
}

impl AuthError {
    /// Map a provider failure, keeping the operation and key id as context.
    #[must_use]
    pub fn from_provider(op: ProviderOp, key_id: Option<KeyId>, error: ProviderError) -> Self {
        match error {
            ProviderError::NotForThisKey if op == ProviderOp::Decrypt => {
                match key_id {
                    Some(key_id) => Self::DecryptionFailed { key_id },
                    None => Self::ProviderUnavailable {
                        op,
                        key_id,
                        source: ProviderError::NotForThisKey,
                    },
                }
            }
            ProviderError::UnknownKey(unknown) | ProviderError::MissingSecretKey(unknown) => {
                Self::UnknownIdentity {
                    key_id: Some(unknown),
                }
            }
            source => Self::ProviderUnavailable { op, key_id, source },
        }
    }

    /// Provider-layer failure the transport may retry with backoff.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DecryptionFailed { .. }
                | Self::ProviderUnavailable { .. }
                | Self::ProviderTimeout { .. }
        )
    }

    /// Failure that can only be recovered by starting over from `init_token`.
    #[must_use]
    pub fn requires_bootstrap(&self) -> bool {
        matches!(
            self,
            Self::MalformedToken(_)
                | Self::MissingKeyId
                | Self::UnknownIdentity { .. }
                | Self::AuthenticationFailed(_)
                | Self::NoToken
        )
    }
}

impl From<TokenError> for AuthError {
    fn from(error: TokenError) -> Self {
        match error {
            TokenError::Malformed(reason) => Self::MalformedToken(reason),
            TokenError::MissingKeyId => Self::MissingKeyId,
            TokenError::ReservedField(name) => Self::ReservedField(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> KeyId {
        KeyId::new("ABCDEF0123").unwrap()
    }

    #[test]
    fn test_decrypt_mismatch_maps_to_decryption_failed() {
        let error =
            AuthError::from_provider(ProviderOp::Decrypt, Some(key()), ProviderError::NotForThisKey);
        assert_eq!(error, AuthError::DecryptionFailed { key_id: key() });
        assert!(error.is_retryable());
    }

    #[test]
    fn test_unknown_key_maps_to_unknown_identity() {
        let error = AuthError::from_provider(
            ProviderOp::Sign,
            Some(key()),
            ProviderError::UnknownKey(key()),
        );
        assert_eq!(error, AuthError::UnknownIdentity { key_id: Some(key()) });
        assert!(error.requires_bootstrap());
    }

    #[test]
    fn test_backend_failure_keeps_context() {
        let error = AuthError::from_provider(
            ProviderOp::Sign,
            Some(key()),
            ProviderError::Unavailable("gpg not found".into()),
        );
        assert_eq!(
            error.to_string(),
            "sign failed for key ABCDEF0123: provider unavailable: gpg not found"
        );
        assert!(error.is_retryable());
        assert!(!error.requires_bootstrap());
    }

    #[test]
    fn test_timeout_message() {
        let error = AuthError::ProviderTimeout {
            op: ProviderOp::Decrypt,
            key_id: None,
            after: Duration::from_secs(2),
        };
        assert_eq!(error.to_string(), "decrypt timed out after 2s");
    }

    #[test]
    fn test_token_errors_convert() {
        assert_eq!(
            AuthError::from(TokenError::Malformed("missing tag separator")),
            AuthError::MalformedToken("missing tag separator")
        );
        assert_eq!(AuthError::from(TokenError::MissingKeyId), AuthError::MissingKeyId);
    }
}
