//! Protocol engine: `init_token`, `roll_token`, `get_session_data`.
//!
//! The engine is stateless with respect to sessions. It orchestrates the token
//! codec and the [`CryptoProvider`]; per-session serialization lives in
//! [`Session`](crate::session::Session).
//!
//! Provider calls are blocking, so each one runs on tokio's blocking pool under
//! [`EngineConfig::provider_timeout`]. A call that doesn't finish in time
//! surfaces as [`AuthError::ProviderTimeout`].

mod error;

pub use error::AuthError;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::identity::KeyId;
use crate::provider::{CryptoProvider, ProviderError, ProviderOp};
use crate::token::{strip_reserved, BootstrapToken, Token, TokenSummary};

/// Default bound on a single provider call.
pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(10);

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on each individual provider call.
    pub provider_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            provider_timeout: DEFAULT_PROVIDER_TIMEOUT,
        }
    }
}

/// Secret material for `init_token`.
pub enum SecretMaterial {
    /// Use a key pair the provider already holds.
    Existing { key_id: KeyId },
    /// Generate a fresh key pair bound to `identity`.
    Generate {
        identity: String,
        passphrase: Zeroizing<String>,
    },
}

impl SecretMaterial {
    /// Select an existing key pair.
    #[must_use]
    pub fn existing(key_id: KeyId) -> Self {
        Self::Existing { key_id }
    }

    /// Generate a key pair for `identity` protected by `passphrase`.
    #[must_use]
    pub fn generate(identity: impl Into<String>, passphrase: impl Into<String>) -> Self {
        Self::Generate {
            identity: identity.into(),
            passphrase: Zeroizing::new(passphrase.into()),
        }
    }
}

impl std::fmt::Debug for SecretMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Existing { key_id } => f.debug_struct("Existing").field("key_id", key_id).finish(),
            Self::Generate { identity, .. } => f
                .debug_struct("Generate")
                .field("identity", identity)
                .field("passphrase", &"[redacted]")
                .finish(),
        }
    }
}

/// Result of `init_token`: the identity and its announcement.
#[derive(Debug, Clone)]
pub struct Bootstrap {
    /// Key id the session is bound to.
    pub key_id: KeyId,
    /// Token to present to the remote party for registration.
    pub token: BootstrapToken,
}

/// The protocol engine.
pub struct Engine<P> {
    provider: Arc<P>,
    config: EngineConfig,
}

impl<P: CryptoProvider + 'static> Engine<P> {
    /// Create an engine with default configuration.
    #[must_use]
    pub fn new(provider: P) -> Self {
        Self::with_config(Arc::new(provider), EngineConfig::default())
    }

    /// Create an engine sharing an existing provider.
    #[must_use]
    pub fn with_config(provider: Arc<P>, config: EngineConfig) -> Self {
        Self { provider, config }
    }

    /// The underlying provider.
    #[must_use]
    pub fn provider(&self) -> &Arc<P> {
        &self.provider
    }

    /// The engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Bootstrap an identity: `Unbootstrapped → Bootstrapped`.
    ///
    /// Selects or generates a key pair and exports its public half as the
    /// bootstrap token. No challenge or fields exist yet; the remote party
    /// mints the first full token in response.
    ///
    /// # Errors
    ///
    /// - `UnknownIdentity` if an existing key was selected that the provider
    ///   doesn't know
    /// - `ProviderUnavailable` if generation or export fails, or the export
    ///   is empty
    /// - `ProviderTimeout` if either call doesn't finish in time
    pub async fn init_token(&self, material: SecretMaterial) -> Result<Bootstrap, AuthError> {
        let key_id = match material {
            SecretMaterial::Existing { key_id } => key_id,
            SecretMaterial::Generate {
                identity,
                passphrase,
            } => {
                self.call(ProviderOp::GenerateKeypair, None, move |provider| {
                    provider.generate_keypair(&identity, &passphrase)
                })
                .await?
            }
        };

        let export_key = key_id.clone();
        let export = self
            .call(ProviderOp::ExportPublicKey, Some(&key_id), move |provider| {
                provider.export_public_key(&export_key)
            })
            .await?;
        if export.is_empty() {
            return Err(AuthError::ProviderUnavailable {
                op: ProviderOp::ExportPublicKey,
                key_id: Some(key_id),
                source: ProviderError::Backend("empty public key export".into()),
            });
        }

        debug!(key_id = %key_id, "identity bootstrapped");
        Ok(Bootstrap {
            key_id,
            token: BootstrapToken::from_public_key(export),
        })
    }

    /// Answer the current token's challenge: `Rolling(n) → Rolling(n+1)`.
    ///
    /// Decrypts the challenge slot (proof of possession), signs the plaintext
    /// (proof of authenticity), and returns a token whose challenge slot holds
    /// the signature. The `fields|tag` part passes through unchanged: the
    /// issuer refreshes those when it mints the next challenge.
    ///
    /// Nothing is retried here; retry policy belongs to the transport.
    ///
    /// # Errors
    ///
    /// - `MalformedToken` if `current` doesn't decode
    /// - `UnknownIdentity` if the fields carry no key id, or the provider
    ///   doesn't hold its private half
    /// - `DecryptionFailed` if the challenge wasn't encrypted for this key
    /// - `ProviderUnavailable` / `ProviderTimeout` on provider failures
    pub async fn roll_token(&self, current: &str) -> Result<String, AuthError> {
        let token = Token::decode(current)?;
        Ok(self.roll(&token).await?.to_wire())
    }

    /// [`roll_token`](Self::roll_token) on an already decoded token.
    ///
    /// # Errors
    ///
    /// Same as [`roll_token`](Self::roll_token), minus decoding.
    pub async fn roll(&self, token: &Token) -> Result<Token, AuthError> {
        let key_id = token
            .key_id()
            .map_err(|_| AuthError::UnknownIdentity { key_id: None })?
            .clone();

        let decrypt_key = key_id.clone();
        let challenge = token.challenge().to_vec();
        let plaintext = self
            .call(ProviderOp::Decrypt, Some(&key_id), move |provider| {
                provider.decrypt(&decrypt_key, &challenge)
            })
            .await?;

        // The plaintext is zeroized when the closure drops it.
        let sign_key = key_id.clone();
        let signature = self
            .call(ProviderOp::Sign, Some(&key_id), move |provider| {
                provider.sign(&sign_key, plaintext.as_bytes())
            })
            .await?;

        debug!(key_id = %key_id, "challenge answered");
        Ok(token.with_challenge(signature))
    }

    /// Session-visible fields of `token`. Read-only.
    ///
    /// # Errors
    ///
    /// `MalformedToken` or `MissingKeyId`.
    pub fn get_session_data(&self, token: &str) -> Result<Map<String, Value>, AuthError> {
        get_session_data(token)
    }

    /// Run one blocking provider call under the configured timeout.
    async fn call<T, F>(
        &self,
        op: ProviderOp,
        key_id: Option<&KeyId>,
        f: F,
    ) -> Result<T, AuthError>
    where
        T: Send + 'static,
        F: FnOnce(&P) -> Result<T, ProviderError> + Send + 'static,
    {
        bounded_call(&self.provider, self.config.provider_timeout, op, key_id, f)
            .await?
            .map_err(|e| AuthError::from_provider(op, key_id.cloned(), e))
    }
}

/// Run `f` on tokio's blocking pool, giving up after `timeout`.
///
/// The outer error covers the timeout and a panicked task; the provider's own
/// error is returned untouched so callers can map it for their operation. A
/// call that times out keeps running on the pool and its result is dropped.
pub(crate) async fn bounded_call<P, T, F>(
    provider: &Arc<P>,
    timeout: Duration,
    op: ProviderOp,
    key_id: Option<&KeyId>,
    f: F,
) -> Result<Result<T, ProviderError>, AuthError>
where
    P: CryptoProvider + 'static,
    T: Send + 'static,
    F: FnOnce(&P) -> Result<T, ProviderError> + Send + 'static,
{
    let provider = Arc::clone(provider);
    let task = tokio::task::spawn_blocking(move || f(&provider));

    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(join_error)) => Err(AuthError::ProviderUnavailable {
            op,
            key_id: key_id.cloned(),
            source: ProviderError::Backend(format!("provider task failed: {join_error}")),
        }),
        Err(_) => {
            warn!(%op, ?timeout, "provider call timed out");
            Err(AuthError::ProviderTimeout {
                op,
                key_id: key_id.cloned(),
                after: timeout,
            })
        }
    }
}

/// Session-visible fields of `token`, with the key id stripped.
///
/// # Errors
///
/// `MalformedToken` if the token doesn't decode, `MissingKeyId` if its fields
/// carry no key id.
pub fn get_session_data(token: &str) -> Result<Map<String, Value>, AuthError> {
    let (_, fields, _) = Token::decode(token)?.into_parts();
    Ok(strip_reserved(fields)?)
}

/// Non-secret overview of `token`. Never touches the provider.
///
/// # Errors
///
/// `MalformedToken` if the token doesn't decode.
pub fn inspect(token: &str) -> Result<TokenSummary, AuthError> {
    Ok(Token::decode(token)?.summary())
}
