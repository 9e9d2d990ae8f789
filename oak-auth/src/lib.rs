//! Rolling proof-of-possession session tokens.
//!
//! Every request carries a token whose challenge slot must be answered with
//! the client's private key before the token is sent. The server mints a new
//! encrypted challenge for every response, so a captured token is worth at
//! most one request.
//!
//! ```text
//! base64(challenge) "-" base64(json(fields)) "|" base64(tag)
//! ```
//!
//! Cryptography is injected via the [`provider::CryptoProvider`] trait:
//! - [`provider::SoftwareProvider`] - in-process Ed25519/X25519 keyring
//! - `oak_client::GpgProvider` - the system `gpg` binary
//!
//! Server-side state is injected via [`issuer::ChallengeLedger`].
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use oak_auth::{
//!     Engine, Issuer, IssuerConfig, IssuerSecret, SecretMaterial, Session, SoftwareProvider,
//! };
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let now = 1_700_000_000;
//! let issuer = Issuer::in_memory(
//!     SoftwareProvider::new(),
//!     IssuerSecret::generate(),
//!     IssuerConfig::default(),
//!     10_000,
//! );
//!
//! // Client bootstraps, server registers the key and mints the first token.
//! let session = Session::new(Arc::new(Engine::new(SoftwareProvider::new())));
//! let bootstrap = session
//!     .bootstrap(SecretMaterial::generate("alice@example.com", "passphrase"))
//!     .await?;
//! let issued = issuer.register(&bootstrap, Default::default(), now).await?;
//! session.install(&issued.token).await?;
//!
//! // Each request: roll, send, verify, mint the next token.
//! let pending = session.begin_roll().await?;
//! let verified = issuer.verify(pending.token(), now).await?;
//! let next = issuer
//!     .mint(verified.key_id(), verified.fields().clone(), now)
//!     .await?;
//! pending.complete(&next)?;
//! # Ok(())
//! # }
//! ```

pub mod engine;
pub mod identity;
pub mod issuer;
pub mod provider;
pub mod session;
pub mod token;

pub use engine::{
    get_session_data, inspect, AuthError, Bootstrap, Engine, EngineConfig, SecretMaterial,
};
pub use identity::{KeyError, KeyId, KeyPair, PublicKey, SecretBytes, Signature};
pub use issuer::{
    ChallengeLedger, Issued, Issuer, IssuerConfig, IssuerSecret, MemoryLedger, VerifiedSession,
};
pub use provider::{CryptoProvider, Opened, ProviderError, ProviderOp, SoftwareProvider};
pub use session::{PendingRoll, ProtocolState, Session};
pub use token::{BootstrapToken, SessionFields, Token, TokenError, TokenSummary, TokenVersion};
