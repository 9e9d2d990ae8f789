//! Client session state.
//!
//! A [`Session`] owns the latest token of one identity. Rolls are serialized
//! per session: [`Session::begin_roll`] takes the session lock and hands it to
//! the returned [`PendingRoll`], which keeps it until the server's next token
//! is installed or the roll is abandoned. Other sessions are unaffected.
//!
//! A failed or abandoned roll leaves the previous token in place.

use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::engine::{AuthError, Engine, SecretMaterial};
use crate::identity::KeyId;
use crate::provider::CryptoProvider;
use crate::token::{strip_reserved, BootstrapToken, Token};

/// Where a session is in the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    /// No identity yet.
    Unbootstrapped,
    /// Identity announced (and possibly the first token installed).
    Bootstrapped,
    /// `n` rolls completed.
    Rolling(u64),
}

#[derive(Default)]
struct SessionState {
    key_id: Option<KeyId>,
    token: Option<Token>,
    bootstrapped: bool,
    generation: u64,
}

impl SessionState {
    fn protocol_state(&self) -> ProtocolState {
        match (self.bootstrapped || self.token.is_some(), self.generation) {
            (false, _) => ProtocolState::Unbootstrapped,
            (true, 0) => ProtocolState::Bootstrapped,
            (true, n) => ProtocolState::Rolling(n),
        }
    }

    /// Validate a server-issued token against this session's identity.
    fn accept(&self, raw: &str) -> Result<Token, AuthError> {
        let token = Token::decode(raw)?;
        let key_id = token.key_id()?;
        if let Some(expected) = &self.key_id {
            if expected != key_id {
                return Err(AuthError::AuthenticationFailed(
                    "token is bound to another identity",
                ));
            }
        }
        Ok(token)
    }
}

/// Per-identity client session.
///
/// Cloning is cheap; clones share the same state and lock.
pub struct Session<P> {
    engine: Arc<Engine<P>>,
    state: Arc<Mutex<SessionState>>,
}

impl<P> Clone for Session<P> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            state: Arc::clone(&self.state),
        }
    }
}

impl<P: CryptoProvider + 'static> Session<P> {
    /// A fresh, unbootstrapped session.
    #[must_use]
    pub fn new(engine: Arc<Engine<P>>) -> Self {
        Self {
            engine,
            state: Arc::new(Mutex::new(SessionState::default())),
        }
    }

    /// A bootstrapped session for `key_id` still waiting for its first token.
    #[must_use]
    pub fn for_key(engine: Arc<Engine<P>>, key_id: KeyId) -> Self {
        let state = SessionState {
            key_id: Some(key_id),
            bootstrapped: true,
            ..SessionState::default()
        };
        Self {
            engine,
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Resume from a persisted token.
    ///
    /// # Errors
    ///
    /// `MalformedToken` or `MissingKeyId` if the token is unusable.
    pub fn resume(engine: Arc<Engine<P>>, token: &str) -> Result<Self, AuthError> {
        let token = SessionState::default().accept(token)?;
        let state = SessionState {
            key_id: Some(token.key_id()?.clone()),
            token: Some(token),
            bootstrapped: true,
            generation: 0,
        };
        Ok(Self {
            engine,
            state: Arc::new(Mutex::new(state)),
        })
    }

    /// Bootstrap the identity: `Unbootstrapped → Bootstrapped`.
    ///
    /// Any previously held token is discarded.
    ///
    /// # Errors
    ///
    /// See [`Engine::init_token`].
    pub async fn bootstrap(&self, material: SecretMaterial) -> Result<BootstrapToken, AuthError> {
        let mut state = self.state.lock().await;
        let bootstrap = self.engine.init_token(material).await?;

        *state = SessionState {
            key_id: Some(bootstrap.key_id),
            token: None,
            bootstrapped: true,
            generation: 0,
        };
        Ok(bootstrap.token)
    }

    /// Install a token minted by the server (typically the first one).
    ///
    /// # Errors
    ///
    /// `MalformedToken`, `MissingKeyId`, or `AuthenticationFailed` if the
    /// token is bound to a different identity than this session.
    pub async fn install(&self, token: &str) -> Result<(), AuthError> {
        let mut state = self.state.lock().await;
        let token = state.accept(token)?;

        state.key_id = Some(token.key_id()?.clone());
        state.token = Some(token);
        state.bootstrapped = true;
        Ok(())
    }

    /// Roll the current token, holding the session lock until the roll is
    /// completed or abandoned.
    ///
    /// # Errors
    ///
    /// `NoToken` if nothing is installed, otherwise see [`Engine::roll`]. On
    /// error the session keeps its previous token.
    pub async fn begin_roll(&self) -> Result<PendingRoll, AuthError> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let current = guard.token.as_ref().ok_or(AuthError::NoToken)?;
        let rolled = self.engine.roll(current).await?;

        Ok(PendingRoll {
            guard,
            rolled: rolled.to_wire(),
        })
    }

    /// Current protocol state.
    pub async fn state(&self) -> ProtocolState {
        self.state.lock().await.protocol_state()
    }

    /// Key id this session is bound to.
    pub async fn key_id(&self) -> Option<KeyId> {
        self.state.lock().await.key_id.clone()
    }

    /// Current token in wire form, for persistence.
    pub async fn current_token(&self) -> Option<String> {
        self.state.lock().await.token.as_ref().map(Token::to_wire)
    }

    /// Session-visible fields of the current token.
    ///
    /// # Errors
    ///
    /// `NoToken` if nothing is installed, `MissingKeyId` otherwise per codec.
    pub async fn session_data(&self) -> Result<Map<String, Value>, AuthError> {
        let state = self.state.lock().await;
        let token = state.token.as_ref().ok_or(AuthError::NoToken)?;
        Ok(strip_reserved(token.fields().clone())?)
    }
}

/// A rolled token awaiting the server's response.
///
/// Holds the session lock. Dropping it without calling
/// [`complete`](Self::complete) keeps the previous token.
#[must_use = "dropping a pending roll abandons it"]
pub struct PendingRoll {
    guard: OwnedMutexGuard<SessionState>,
    rolled: String,
}

impl PendingRoll {
    /// The token to send with the request.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.rolled
    }

    /// Install the server's next token: `Rolling(n) → Rolling(n+1)`.
    ///
    /// # Errors
    ///
    /// `MalformedToken`, `MissingKeyId`, or `AuthenticationFailed` if the
    /// next token is bound to another identity. The previous token is kept.
    pub fn complete(mut self, next_token: &str) -> Result<ProtocolState, AuthError> {
        let next = self.guard.accept(next_token)?;

        let state = &mut *self.guard;
        state.token = Some(next);
        state.generation += 1;

        debug!(generation = state.generation, "session advanced");
        Ok(state.protocol_state())
    }

    /// Give up on this roll; the session keeps its previous token.
    pub fn abandon(self) {
        debug!("roll abandoned");
    }
}

impl std::fmt::Debug for PendingRoll {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRoll")
            .field("generation", &self.guard.generation)
            .finish_non_exhaustive()
    }
}
