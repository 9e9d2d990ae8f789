//! Test harnesses for protocol E2E tests.
//!
//! The "server" is an [`Issuer`] over its own keyring, so it only ever sees
//! client public keys. Clients run the real [`Engine`] on the tokio blocking
//! pool.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use oak_auth::{
    BootstrapToken, CryptoProvider, Engine, EngineConfig, Issued, Issuer, IssuerConfig,
    IssuerSecret, KeyId, Opened, ProviderError, SecretBytes, SecretMaterial, Session,
    SessionFields, SoftwareProvider, Token,
};
use serde_json::{Map, Value};

/// Fixed clock for issuer calls.
pub const NOW: i64 = 1_700_000_000;

/// Issuer-side test fixture.
pub struct TestServer {
    pub issuer: Issuer<SoftwareProvider>,
}

#[allow(dead_code)]
impl TestServer {
    pub fn new() -> Self {
        Self {
            issuer: Issuer::in_memory(
                SoftwareProvider::new(),
                IssuerSecret::from_bytes([0x5A; 32]),
                IssuerConfig::default(),
                1000,
            ),
        }
    }

    pub async fn register(&self, bootstrap: &BootstrapToken, extra: Value) -> Issued {
        self.issuer
            .register(bootstrap, object(extra), NOW)
            .await
            .expect("Failed to register bootstrap token")
    }

    pub fn keyring(&self) -> &SoftwareProvider {
        self.issuer.provider()
    }
}

/// Bootstrap a fresh session for `identity` and register it with `server`.
#[allow(dead_code)]
pub async fn enrolled_session(
    server: &TestServer,
    identity: &str,
) -> (Session<SoftwareProvider>, KeyId) {
    let session = Session::new(Arc::new(Engine::new(SoftwareProvider::new())));
    let bootstrap = session
        .bootstrap(SecretMaterial::generate(identity, "correct horse"))
        .await
        .expect("Failed to bootstrap");
    let issued = server
        .register(&bootstrap, Value::Object(Map::new()))
        .await;
    session
        .install(&issued.token)
        .await
        .expect("Failed to install first token");
    (session, issued.key_id)
}

/// Build a token around a caller-chosen challenge, encrypted for `key_id`.
///
/// The tag is a placeholder; the client engine never inspects it.
#[allow(dead_code)]
pub fn mint_with_challenge(
    server_keyring: &SoftwareProvider,
    key_id: &KeyId,
    challenge: &[u8],
    extra: Value,
) -> String {
    let sealed = server_keyring
        .encrypt(key_id, challenge)
        .expect("Failed to encrypt challenge");
    let fields = SessionFields::new(key_id.clone(), object(extra)).expect("Invalid fields");
    Token::new(sealed, fields, b"integrity-tag".to_vec()).to_wire()
}

#[allow(dead_code)]
pub fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected JSON object, got {other}"),
    }
}

/// Engine with a short per-call timeout.
#[allow(dead_code)]
pub fn engine_with_timeout<P: CryptoProvider + 'static>(
    provider: P,
    timeout: Duration,
) -> Arc<Engine<P>> {
    Arc::new(Engine::with_config(
        Arc::new(provider),
        EngineConfig {
            provider_timeout: timeout,
        },
    ))
}

/// Provider that stalls, like a gpg-agent waiting on pinentry.
pub struct SlowProvider {
    pub inner: SoftwareProvider,
    pub decrypt_delay: Duration,
    pub verify_delay: Duration,
}

impl CryptoProvider for SlowProvider {
    fn generate_keypair(&self, identity: &str, passphrase: &str) -> Result<KeyId, ProviderError> {
        self.inner.generate_keypair(identity, passphrase)
    }

    fn export_public_key(&self, key_id: &KeyId) -> Result<Vec<u8>, ProviderError> {
        self.inner.export_public_key(key_id)
    }

    fn import_public_key(&self, bytes: &[u8]) -> Result<KeyId, ProviderError> {
        self.inner.import_public_key(bytes)
    }

    fn sign(&self, key_id: &KeyId, data: &[u8]) -> Result<Vec<u8>, ProviderError> {
        self.inner.sign(key_id, data)
    }

    fn verify_or_decrypt(&self, key_id: &KeyId, data: &[u8]) -> Result<Opened, ProviderError> {
        thread::sleep(self.verify_delay);
        self.inner.verify_or_decrypt(key_id, data)
    }

    fn encrypt(&self, key_id: &KeyId, data: &[u8]) -> Result<Vec<u8>, ProviderError> {
        self.inner.encrypt(key_id, data)
    }

    fn decrypt(&self, key_id: &KeyId, data: &[u8]) -> Result<SecretBytes, ProviderError> {
        thread::sleep(self.decrypt_delay);
        self.inner.decrypt(key_id, data)
    }
}

/// What [`BrokenExportProvider`] returns from `export_public_key`.
#[derive(Clone, Copy)]
pub enum ExportFailure {
    /// The backend can't be reached.
    Unavailable,
    /// The backend reports success with no bytes.
    Empty,
}

/// Provider that generates keys but can't export them.
pub struct BrokenExportProvider {
    pub inner: SoftwareProvider,
    pub failure: ExportFailure,
}

impl CryptoProvider for BrokenExportProvider {
    fn generate_keypair(&self, identity: &str, passphrase: &str) -> Result<KeyId, ProviderError> {
        self.inner.generate_keypair(identity, passphrase)
    }

    fn export_public_key(&self, _key_id: &KeyId) -> Result<Vec<u8>, ProviderError> {
        match self.failure {
            ExportFailure::Unavailable => Err(ProviderError::Unavailable("keyring offline".into())),
            ExportFailure::Empty => Ok(Vec::new()),
        }
    }

    fn import_public_key(&self, bytes: &[u8]) -> Result<KeyId, ProviderError> {
        self.inner.import_public_key(bytes)
    }

    fn sign(&self, key_id: &KeyId, data: &[u8]) -> Result<Vec<u8>, ProviderError> {
        self.inner.sign(key_id, data)
    }

    fn verify_or_decrypt(&self, key_id: &KeyId, data: &[u8]) -> Result<Opened, ProviderError> {
        self.inner.verify_or_decrypt(key_id, data)
    }

    fn encrypt(&self, key_id: &KeyId, data: &[u8]) -> Result<Vec<u8>, ProviderError> {
        self.inner.encrypt(key_id, data)
    }

    fn decrypt(&self, key_id: &KeyId, data: &[u8]) -> Result<SecretBytes, ProviderError> {
        self.inner.decrypt(key_id, data)
    }
}
