//! Server-side token issuer.
//!
//! The issuer is the remote party of the protocol. It registers bootstrap
//! tokens, mints tokens carrying a fresh encrypted challenge, and verifies the
//! rolled tokens clients send back.
//!
//! # Verification
//!
//! A rolled token is accepted iff:
//!
//! 1. it decodes and its fields carry a key id
//! 2. the integrity tag over the fields verifies (HMAC-SHA512, constant time)
//! 3. the challenge slot is a signature by that key id
//! 4. the signed content is the challenge outstanding for that key id, not
//!    expired and not yet redeemed
//!
//! Step 4 consumes the challenge, so a rolled token authenticates one request.
//! The caller mints the next token with [`Issuer::mint`] and returns it.
//!
//! All methods take `now_utc_seconds` explicitly; the issuer never reads the
//! clock itself. Provider calls run on tokio's blocking pool under
//! [`IssuerConfig::provider_timeout`], like the client engine's.

mod ledger;

pub use ledger::{ChallengeLedger, MemoryLedger, RedeemOutcome};

use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use serde_json::{Map, Value};
use sha2::Sha512;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::engine::{bounded_call, AuthError, DEFAULT_PROVIDER_TIMEOUT};
use crate::identity::{KeyError, KeyId};
use crate::provider::{CryptoProvider, ProviderError, ProviderOp};
use crate::token::{strip_reserved, BootstrapToken, SessionFields, Token};

type HmacSha512 = Hmac<Sha512>;

/// Domain separation for integrity tags.
const TAG_DOMAIN: &[u8] = b"OAK-TAG-v1:";

/// Length of the issuer's integrity secret.
pub const ISSUER_SECRET_LEN: usize = 32;

/// Default challenge lifetime.
pub const DEFAULT_CHALLENGE_TTL_SECONDS: i64 = 300;

/// Default challenge size in bytes.
pub const DEFAULT_CHALLENGE_LEN: usize = 64;

/// Issuer tuning.
#[derive(Debug, Clone)]
pub struct IssuerConfig {
    /// How long a minted challenge stays redeemable.
    pub challenge_ttl_seconds: i64,
    /// Random challenge size in bytes.
    pub challenge_len: usize,
    /// Upper bound on each individual provider call.
    pub provider_timeout: Duration,
}

impl Default for IssuerConfig {
    fn default() -> Self {
        Self {
            challenge_ttl_seconds: DEFAULT_CHALLENGE_TTL_SECONDS,
            challenge_len: DEFAULT_CHALLENGE_LEN,
            provider_timeout: DEFAULT_PROVIDER_TIMEOUT,
        }
    }
}

/// Secret keying the integrity tag. Zeroized on drop; never printed.
pub struct IssuerSecret(Zeroizing<[u8; ISSUER_SECRET_LEN]>);

impl IssuerSecret {
    /// Wrap existing secret bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; ISSUER_SECRET_LEN]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Parse a secret that must be exactly [`ISSUER_SECRET_LEN`] bytes.
    ///
    /// # Errors
    ///
    /// Returns `KeyError::InvalidLength` for any other length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
        let bytes: [u8; ISSUER_SECRET_LEN] =
            bytes.try_into().map_err(|_| KeyError::InvalidLength {
                expected: ISSUER_SECRET_LEN,
                actual: bytes.len(),
            })?;
        Ok(Self::from_bytes(bytes))
    }

    /// Generate a random secret.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = Zeroizing::new([0u8; ISSUER_SECRET_LEN]);
        OsRng.fill_bytes(bytes.as_mut_slice());
        Self(bytes)
    }

    fn mac(&self) -> HmacSha512 {
        let mut mac = <HmacSha512 as Mac>::new_from_slice(self.0.as_slice())
            .expect("HMAC accepts keys of any length");
        mac.update(TAG_DOMAIN);
        mac
    }
}

impl std::fmt::Debug for IssuerSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("IssuerSecret([redacted])")
    }
}

/// A freshly registered identity and its first token.
#[derive(Debug, Clone)]
pub struct Issued {
    /// Key id the issuer knows the client by.
    pub key_id: KeyId,
    /// First rolling token for the client.
    pub token: String,
}

/// Result of successful verification.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedSession {
    key_id: KeyId,
    fields: Map<String, Value>,
}

impl VerifiedSession {
    /// Create a verified session.
    ///
    /// # Visibility
    ///
    /// Crate-private so that a `VerifiedSession` can only come out of
    /// [`Issuer::verify`], which performs the cryptographic checks.
    #[must_use]
    pub(crate) fn new(key_id: KeyId, fields: Map<String, Value>) -> Self {
        Self { key_id, fields }
    }

    /// The authenticated key id.
    #[must_use]
    pub fn key_id(&self) -> &KeyId {
        &self.key_id
    }

    /// Session-visible fields, integrity-checked.
    #[must_use]
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Consume into `(key_id, fields)`.
    #[must_use]
    pub fn into_parts(self) -> (KeyId, Map<String, Value>) {
        (self.key_id, self.fields)
    }
}

/// Mints and verifies rolling tokens.
pub struct Issuer<P, L = MemoryLedger> {
    provider: Arc<P>,
    ledger: L,
    secret: IssuerSecret,
    config: IssuerConfig,
}

impl<P: CryptoProvider + 'static> Issuer<P, MemoryLedger> {
    /// Issuer with an in-memory ledger sized for `max_sessions`.
    #[must_use]
    pub fn in_memory(
        provider: P,
        secret: IssuerSecret,
        config: IssuerConfig,
        max_sessions: usize,
    ) -> Self {
        let ledger = MemoryLedger::new(config.challenge_ttl_seconds, max_sessions);
        Self::new(provider, ledger, secret, config)
    }
}

impl<P: CryptoProvider + 'static, L: ChallengeLedger> Issuer<P, L> {
    /// Create an issuer.
    #[must_use]
    pub fn new(provider: P, ledger: L, secret: IssuerSecret, config: IssuerConfig) -> Self {
        Self {
            provider: Arc::new(provider),
            ledger,
            secret,
            config,
        }
    }

    /// The issuer's provider (holds imported client public keys).
    #[must_use]
    pub fn provider(&self) -> &Arc<P> {
        &self.provider
    }

    /// The challenge ledger.
    #[must_use]
    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    /// Register a bootstrap token and mint the client's first token.
    ///
    /// # Errors
    ///
    /// - `ProviderUnavailable` if the public key can't be imported
    /// - `ProviderTimeout` if the import doesn't finish in time
    /// - `ReservedField` if `extra` uses the reserved member name
    /// - see [`mint`](Self::mint)
    pub async fn register(
        &self,
        bootstrap: &BootstrapToken,
        extra: Map<String, Value>,
        now_utc_seconds: i64,
    ) -> Result<Issued, AuthError> {
        let public_key = bootstrap.public_key().to_vec();
        let key_id = self
            .call(ProviderOp::ImportPublicKey, None, move |provider| {
                provider.import_public_key(&public_key)
            })
            .await?
            .map_err(|e| AuthError::from_provider(ProviderOp::ImportPublicKey, None, e))?;

        let token = self.mint(&key_id, extra, now_utc_seconds).await?;
        debug!(key_id = %key_id, "identity registered");
        Ok(Issued { key_id, token })
    }

    /// Mint a token for `key_id` carrying a fresh challenge.
    ///
    /// Any challenge still outstanding for `key_id` is superseded.
    ///
    /// # Errors
    ///
    /// - `ReservedField` if `extra` uses the reserved member name
    /// - `UnknownIdentity` if the provider doesn't know `key_id`
    /// - `ProviderUnavailable` if encryption fails
    /// - `ProviderTimeout` if encryption doesn't finish in time
    pub async fn mint(
        &self,
        key_id: &KeyId,
        extra: Map<String, Value>,
        now_utc_seconds: i64,
    ) -> Result<String, AuthError> {
        let fields = SessionFields::new(key_id.clone(), extra)?;

        let mut challenge = Zeroizing::new(vec![0u8; self.config.challenge_len]);
        OsRng.fill_bytes(challenge.as_mut_slice());

        let encrypt_key = key_id.clone();
        let plaintext = challenge.clone();
        let sealed = self
            .call(ProviderOp::Encrypt, Some(key_id), move |provider| {
                provider.encrypt(&encrypt_key, &plaintext)
            })
            .await?
            .map_err(|e| AuthError::from_provider(ProviderOp::Encrypt, Some(key_id.clone()), e))?;

        // Tag the exact bytes that go on the wire.
        let untagged = Token::new(sealed, fields, Vec::new());
        let tag = self.tag(untagged.fields_json());
        let (sealed, fields, _) = untagged.into_parts();
        let token = Token::new(sealed, fields, tag);

        self.ledger.issue(key_id, &challenge, now_utc_seconds);
        debug!(key_id = %key_id, "challenge issued");
        Ok(token.to_wire())
    }

    /// Authenticate a rolled token and consume its challenge.
    ///
    /// # Errors
    ///
    /// - `MalformedToken` / `MissingKeyId` on decode failures
    /// - `UnknownIdentity` if the key id was never registered
    /// - `AuthenticationFailed` for a bad tag, a bad or foreign signature, or
    ///   a challenge that is unknown, superseded, expired or already redeemed
    /// - `ProviderUnavailable` if the provider itself failed
    /// - `ProviderTimeout` if the provider doesn't answer in time
    pub async fn verify(
        &self,
        rolled: &str,
        now_utc_seconds: i64,
    ) -> Result<VerifiedSession, AuthError> {
        let token = Token::decode(rolled)?;
        let key_id = token.key_id()?.clone();

        self.authenticate(&token, &key_id, now_utc_seconds)
            .await
            .map_err(|e| {
                warn!(key_id = %key_id, error = %e, "token rejected");
                e
            })
    }

    /// Integrity-checked session fields of a token, without redeeming its
    /// challenge.
    ///
    /// # Errors
    ///
    /// `MalformedToken`, `MissingKeyId`, or `AuthenticationFailed` if the tag
    /// doesn't verify.
    pub fn extract_session_data(&self, token: &str) -> Result<Map<String, Value>, AuthError> {
        let token = Token::decode(token)?;
        token.key_id()?;
        self.check_tag(&token)?;
        let (_, fields, _) = token.into_parts();
        Ok(strip_reserved(fields)?)
    }

    async fn authenticate(
        &self,
        token: &Token,
        key_id: &KeyId,
        now_utc_seconds: i64,
    ) -> Result<VerifiedSession, AuthError> {
        self.check_tag(token)?;

        let signer = key_id.clone();
        let response = token.challenge().to_vec();
        let opened = self
            .call(ProviderOp::VerifyOrDecrypt, Some(key_id), move |provider| {
                provider.verify_or_decrypt(&signer, &response)
            })
            .await?
            .map_err(|e| verification_error(key_id, e))?;
        if !opened.signed {
            return Err(AuthError::AuthenticationFailed(
                "challenge response is not signed",
            ));
        }
        if &opened.key_id != key_id {
            return Err(AuthError::AuthenticationFailed(
                "challenge signed by another key",
            ));
        }

        match self
            .ledger
            .redeem(key_id, opened.plaintext.as_bytes(), now_utc_seconds)
        {
            RedeemOutcome::Accepted => {
                debug!(key_id = %key_id, "challenge redeemed");
                let fields = strip_reserved(token.fields().clone())?;
                Ok(VerifiedSession::new(key_id.clone(), fields))
            }
            RedeemOutcome::NoOutstanding => {
                Err(AuthError::AuthenticationFailed("no outstanding challenge"))
            }
            RedeemOutcome::Mismatch => {
                Err(AuthError::AuthenticationFailed("challenge does not match"))
            }
            RedeemOutcome::Expired => Err(AuthError::AuthenticationFailed("challenge expired")),
        }
    }

    async fn call<T, F>(
        &self,
        op: ProviderOp,
        key_id: Option<&KeyId>,
        f: F,
    ) -> Result<Result<T, ProviderError>, AuthError>
    where
        T: Send + 'static,
        F: FnOnce(&P) -> Result<T, ProviderError> + Send + 'static,
    {
        bounded_call(&self.provider, self.config.provider_timeout, op, key_id, f).await
    }

    fn tag(&self, fields_json: &[u8]) -> Vec<u8> {
        let mut mac = self.secret.mac();
        mac.update(fields_json);
        mac.finalize().into_bytes().to_vec()
    }

    fn check_tag(&self, token: &Token) -> Result<(), AuthError> {
        let mut mac = self.secret.mac();
        mac.update(token.fields_json());
        mac.verify_slice(token.tag())
            .map_err(|_| AuthError::AuthenticationFailed("integrity tag mismatch"))
    }
}

fn verification_error(key_id: &KeyId, error: ProviderError) -> AuthError {
    match error {
        ProviderError::UnknownKey(_) => AuthError::UnknownIdentity {
            key_id: Some(key_id.clone()),
        },
        ProviderError::Unavailable(_) | ProviderError::Backend(_) | ProviderError::Locked(_) => {
            AuthError::ProviderUnavailable {
                op: ProviderOp::VerifyOrDecrypt,
                key_id: Some(key_id.clone()),
                source: error,
            }
        }
        ProviderError::IdentityMismatch { .. } => {
            AuthError::AuthenticationFailed("challenge signed by another key")
        }
        _ => AuthError::AuthenticationFailed("challenge response does not verify"),
    }
}
