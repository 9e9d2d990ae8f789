//! In-memory software keyring.
//!
//! Sealed box (encrypt/decrypt):
//!
//! | Field   | Size | Description                                   |
//! |---------|------|-----------------------------------------------|
//! | tag     | 1    | `0x01`                                        |
//! | eph_pub | 32   | Ephemeral X25519 public key                   |
//! | nonce   | 12   | ChaCha20-Poly1305 nonce                       |
//! | ct      | var  | Ciphertext + 16-byte tag, AAD = recipient id  |
//!
//! The AEAD key is HKDF-SHA256(ikm = X25519(eph, recipient),
//! salt = eph_pub || recipient_pub, info = [`SEAL_INFO`]).
//!
//! Signed blob (sign/verify_or_decrypt):
//!
//! | Field | Size | Description                                  |
//! |-------|------|----------------------------------------------|
//! | tag   | 1    | `0x02`                                       |
//! | len   | 4    | Content length (u32 BE)                      |
//! | data  | var  | Signed content                               |
//! | sig   | 64   | Ed25519 over [`SIGN_DOMAIN`] `\|\|` data     |

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use dashmap::DashMap;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::identity::{KeyId, KeyPair, PublicKey, SecretBytes, Signature};

use super::{CryptoProvider, Opened, ProviderError};

const SEALED_TAG: u8 = 0x01;
const SIGNED_TAG: u8 = 0x02;

/// HKDF info for sealed boxes.
const SEAL_INFO: &[u8] = b"OAK-SEAL-v1";

/// Domain separation prefix for signatures.
///
/// Keeps challenge signatures from being valid in any other context.
const SIGN_DOMAIN: &[u8] = b"OAK-SIGN-v1:";

const SEAL_HEADER_LEN: usize = 1 + 32 + 12;
const AEAD_TAG_LEN: usize = 16;
const SIGNED_HEADER_LEN: usize = 1 + 4;

enum KeyEntry {
    Private { pair: KeyPair, identity: String },
    Public(PublicKey),
}

impl KeyEntry {
    fn public_key(&self) -> PublicKey {
        match self {
            Self::Private { pair, .. } => pair.public_key(),
            Self::Public(public_key) => public_key.clone(),
        }
    }
}

/// Software [`CryptoProvider`] keeping every key in process memory.
///
/// Private halves are zeroized when the provider is dropped. Passphrases are
/// accepted for interface parity but keys are never locked: nothing here is
/// ever written to disk.
#[derive(Default)]
pub struct SoftwareProvider {
    keys: DashMap<KeyId, KeyEntry>,
}

impl SoftwareProvider {
    /// Create an empty keyring.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Identity string a private key was generated for.
    #[must_use]
    pub fn identity_of(&self, key_id: &KeyId) -> Option<String> {
        self.keys.get(key_id).and_then(|entry| match entry.value() {
            KeyEntry::Private { identity, .. } => Some(identity.clone()),
            KeyEntry::Public(_) => None,
        })
    }

    /// Look up the private key generated for `identity`.
    #[must_use]
    pub fn find_by_identity(&self, identity: &str) -> Option<KeyId> {
        self.keys.iter().find_map(|entry| match entry.value() {
            KeyEntry::Private { identity: id, .. } if id == identity => Some(entry.key().clone()),
            _ => None,
        })
    }

    /// Number of keys (public and private) in the keyring.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Check if the keyring is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn public_key(&self, key_id: &KeyId) -> Result<PublicKey, ProviderError> {
        self.keys
            .get(key_id)
            .map(|entry| entry.public_key())
            .ok_or_else(|| ProviderError::UnknownKey(key_id.clone()))
    }

    fn with_private<T>(
        &self,
        key_id: &KeyId,
        f: impl FnOnce(&KeyPair) -> Result<T, ProviderError>,
    ) -> Result<T, ProviderError> {
        let entry = self
            .keys
            .get(key_id)
            .ok_or_else(|| ProviderError::UnknownKey(key_id.clone()))?;
        match entry.value() {
            KeyEntry::Private { pair, .. } => f(pair),
            KeyEntry::Public(_) => Err(ProviderError::MissingSecretKey(key_id.clone())),
        }
    }

    fn verify_signed(&self, key_id: &KeyId, blob: &[u8]) -> Result<Opened, ProviderError> {
        if blob.len() < SIGNED_HEADER_LEN + Signature::LEN {
            return Err(ProviderError::MalformedPayload);
        }
        let len_bytes: [u8; 4] = blob[1..5]
            .try_into()
            .map_err(|_| ProviderError::MalformedPayload)?;
        let data_len = u32::from_be_bytes(len_bytes) as usize;
        if blob.len() != SIGNED_HEADER_LEN + data_len + Signature::LEN {
            return Err(ProviderError::MalformedPayload);
        }

        let data = &blob[SIGNED_HEADER_LEN..SIGNED_HEADER_LEN + data_len];
        let signature = Signature::from_bytes(&blob[SIGNED_HEADER_LEN + data_len..])
            .map_err(|_| ProviderError::MalformedPayload)?;
        let message = signing_message(data);

        let expected = self.public_key(key_id)?;
        if expected.verify(&message, &signature) {
            return Ok(Opened {
                plaintext: SecretBytes::new(data.to_vec()),
                key_id: key_id.clone(),
                signed: true,
            });
        }

        // Authentic but from someone else is reported distinctly from forged.
        let signer = self.keys.iter().find_map(|entry| {
            entry
                .value()
                .public_key()
                .verify(&message, &signature)
                .then(|| entry.key().clone())
        });
        match signer {
            Some(actual) => Err(ProviderError::IdentityMismatch {
                expected: key_id.clone(),
                actual,
            }),
            None => Err(ProviderError::SignatureMismatch),
        }
    }
}

impl CryptoProvider for SoftwareProvider {
    fn generate_keypair(&self, identity: &str, _passphrase: &str) -> Result<KeyId, ProviderError> {
        if identity.trim().is_empty() {
            return Err(ProviderError::Backend("identity must not be empty".into()));
        }

        let pair = KeyPair::generate();
        let key_id = KeyId::from_public_key(&pair.public_key());
        self.keys.insert(
            key_id.clone(),
            KeyEntry::Private {
                pair,
                identity: identity.to_string(),
            },
        );
        Ok(key_id)
    }

    fn export_public_key(&self, key_id: &KeyId) -> Result<Vec<u8>, ProviderError> {
        Ok(self.public_key(key_id)?.to_bytes().to_vec())
    }

    fn import_public_key(&self, bytes: &[u8]) -> Result<KeyId, ProviderError> {
        let public_key =
            PublicKey::from_bytes(bytes).map_err(|e| ProviderError::MalformedKey(e.to_string()))?;
        let key_id = KeyId::from_public_key(&public_key);

        // Re-importing our own key must not drop the private half.
        self.keys
            .entry(key_id.clone())
            .or_insert(KeyEntry::Public(public_key));
        Ok(key_id)
    }

    fn sign(&self, key_id: &KeyId, data: &[u8]) -> Result<Vec<u8>, ProviderError> {
        let data_len = u32::try_from(data.len())
            .map_err(|_| ProviderError::Backend("content too large to sign".into()))?;
        let signature = self.with_private(key_id, |pair| Ok(pair.sign(&signing_message(data))))?;

        let mut blob = Vec::with_capacity(SIGNED_HEADER_LEN + data.len() + Signature::LEN);
        blob.push(SIGNED_TAG);
        blob.extend_from_slice(&data_len.to_be_bytes());
        blob.extend_from_slice(data);
        blob.extend_from_slice(&signature.to_bytes());
        Ok(blob)
    }

    fn verify_or_decrypt(&self, key_id: &KeyId, data: &[u8]) -> Result<Opened, ProviderError> {
        match data.first() {
            Some(&SIGNED_TAG) => self.verify_signed(key_id, data),
            Some(&SEALED_TAG) => Ok(Opened {
                plaintext: self.decrypt(key_id, data)?,
                key_id: key_id.clone(),
                signed: false,
            }),
            _ => Err(ProviderError::MalformedPayload),
        }
    }

    fn encrypt(&self, key_id: &KeyId, data: &[u8]) -> Result<Vec<u8>, ProviderError> {
        let recipient = self.public_key(key_id)?;

        let ephemeral = x25519_dalek::EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_public = x25519_dalek::PublicKey::from(&ephemeral);
        let shared = ephemeral.diffie_hellman(recipient.agreement_key());

        let key = seal_key(
            shared.as_bytes(),
            ephemeral_public.as_bytes(),
            recipient.agreement_key().as_bytes(),
        )?;

        let mut nonce = [0u8; 12];
        OsRng.fill_bytes(&mut nonce);

        let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_slice()));
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: data,
                    aad: key_id.as_str().as_bytes(),
                },
            )
            .map_err(|_| ProviderError::Backend("encryption failed".into()))?;

        let mut sealed = Vec::with_capacity(SEAL_HEADER_LEN + ciphertext.len());
        sealed.push(SEALED_TAG);
        sealed.extend_from_slice(ephemeral_public.as_bytes());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn decrypt(&self, key_id: &KeyId, data: &[u8]) -> Result<SecretBytes, ProviderError> {
        self.with_private(key_id, |pair| {
            if data.len() < SEAL_HEADER_LEN + AEAD_TAG_LEN || data[0] != SEALED_TAG {
                return Err(ProviderError::NotForThisKey);
            }

            let ephemeral: [u8; 32] = data[1..33]
                .try_into()
                .map_err(|_| ProviderError::NotForThisKey)?;
            let ephemeral = x25519_dalek::PublicKey::from(ephemeral);
            let nonce = &data[33..SEAL_HEADER_LEN];
            let ciphertext = &data[SEAL_HEADER_LEN..];

            let shared = pair.agree(&ephemeral);
            let key = seal_key(
                shared.as_bytes(),
                ephemeral.as_bytes(),
                pair.public_key().agreement_key().as_bytes(),
            )?;

            let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_slice()));
            cipher
                .decrypt(
                    Nonce::from_slice(nonce),
                    Payload {
                        msg: ciphertext,
                        aad: key_id.as_str().as_bytes(),
                    },
                )
                .map(SecretBytes::new)
                .map_err(|_| ProviderError::NotForThisKey)
        })
    }
}

fn signing_message(data: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(SIGN_DOMAIN.len() + data.len());
    message.extend_from_slice(SIGN_DOMAIN);
    message.extend_from_slice(data);
    message
}

fn seal_key(
    shared: &[u8; 32],
    ephemeral: &[u8; 32],
    recipient: &[u8; 32],
) -> Result<Zeroizing<[u8; 32]>, ProviderError> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(ephemeral);
    salt[32..].copy_from_slice(recipient);

    let mut okm = Zeroizing::new([0u8; 32]);
    Hkdf::<Sha256>::new(Some(&salt), shared)
        .expand(SEAL_INFO, okm.as_mut_slice())
        .map_err(|_| ProviderError::Backend("key derivation failed".into()))?;
    Ok(okm)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyring_with_key(identity: &str) -> (SoftwareProvider, KeyId) {
        let provider = SoftwareProvider::new();
        let key_id = provider.generate_keypair(identity, "passphrase").unwrap();
        (provider, key_id)
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let (provider, key_id) = keyring_with_key("alice@example.com");

        let sealed = provider.encrypt(&key_id, b"nonce-1").unwrap();
        assert_eq!(sealed[0], SEALED_TAG);

        let opened = provider.decrypt(&key_id, &sealed).unwrap();
        assert_eq!(opened.as_bytes(), b"nonce-1");
    }

    #[test]
    fn test_decrypt_for_other_key_fails() {
        let provider = SoftwareProvider::new();
        let alice = provider.generate_keypair("alice@example.com", "pw").unwrap();
        let bob = provider.generate_keypair("bob@example.com", "pw").unwrap();

        let sealed = provider.encrypt(&bob, b"for bob").unwrap();
        assert_eq!(
            provider.decrypt(&alice, &sealed).unwrap_err(),
            ProviderError::NotForThisKey
        );
    }

    #[test]
    fn test_decrypt_corrupt_ciphertext_fails() {
        let (provider, key_id) = keyring_with_key("alice@example.com");

        let mut sealed = provider.encrypt(&key_id, b"nonce-1").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert_eq!(
            provider.decrypt(&key_id, &sealed).unwrap_err(),
            ProviderError::NotForThisKey
        );

        assert_eq!(
            provider.decrypt(&key_id, &[SEALED_TAG; 10]).unwrap_err(),
            ProviderError::NotForThisKey
        );
    }

    #[test]
    fn test_sign_then_verify() {
        let (provider, key_id) = keyring_with_key("alice@example.com");

        let blob = provider.sign(&key_id, b"nonce-1").unwrap();
        let opened = provider.verify_or_decrypt(&key_id, &blob).unwrap();

        assert_eq!(opened.plaintext.as_bytes(), b"nonce-1");
        assert_eq!(opened.key_id, key_id);
        assert!(opened.signed);
    }

    #[test]
    fn test_verify_detects_other_signer() {
        let provider = SoftwareProvider::new();
        let alice = provider.generate_keypair("alice@example.com", "pw").unwrap();
        let mallory = provider.generate_keypair("mallory@example.com", "pw").unwrap();

        let blob = provider.sign(&mallory, b"nonce-1").unwrap();
        assert_eq!(
            provider.verify_or_decrypt(&alice, &blob).unwrap_err(),
            ProviderError::IdentityMismatch {
                expected: alice,
                actual: mallory,
            }
        );
    }

    #[test]
    fn test_verify_detects_tampered_content() {
        let (provider, key_id) = keyring_with_key("alice@example.com");

        let mut blob = provider.sign(&key_id, b"nonce-1").unwrap();
        blob[SIGNED_HEADER_LEN] ^= 0x01;
        assert_eq!(
            provider.verify_or_decrypt(&key_id, &blob).unwrap_err(),
            ProviderError::SignatureMismatch
        );
    }

    #[test]
    fn test_verify_rejects_truncated_blob() {
        let (provider, key_id) = keyring_with_key("alice@example.com");

        let blob = provider.sign(&key_id, b"nonce-1").unwrap();
        assert_eq!(
            provider
                .verify_or_decrypt(&key_id, &blob[..blob.len() - 1])
                .unwrap_err(),
            ProviderError::MalformedPayload
        );
        assert_eq!(
            provider.verify_or_decrypt(&key_id, &[]).unwrap_err(),
            ProviderError::MalformedPayload
        );
    }

    #[test]
    fn test_verify_or_decrypt_opens_sealed_box() {
        let (provider, key_id) = keyring_with_key("alice@example.com");

        let sealed = provider.encrypt(&key_id, b"secret").unwrap();
        let opened = provider.verify_or_decrypt(&key_id, &sealed).unwrap();
        assert_eq!(opened.plaintext.as_bytes(), b"secret");
        assert!(!opened.signed);
    }

    #[test]
    fn test_import_public_only_key() {
        let (client, key_id) = keyring_with_key("alice@example.com");
        let server = SoftwareProvider::new();

        let export = client.export_public_key(&key_id).unwrap();
        let imported = server.import_public_key(&export).unwrap();
        assert_eq!(imported, key_id);

        // Server can encrypt for the client and verify its signatures...
        let sealed = server.encrypt(&key_id, b"challenge").unwrap();
        assert_eq!(client.decrypt(&key_id, &sealed).unwrap().as_bytes(), b"challenge");
        let blob = client.sign(&key_id, b"challenge").unwrap();
        assert!(server.verify_or_decrypt(&key_id, &blob).is_ok());

        // ...but cannot act as the client.
        assert_eq!(
            server.sign(&key_id, b"challenge").unwrap_err(),
            ProviderError::MissingSecretKey(key_id.clone())
        );
        assert_eq!(
            server.decrypt(&key_id, &sealed).unwrap_err(),
            ProviderError::MissingSecretKey(key_id)
        );
    }

    #[test]
    fn test_reimport_keeps_private_half() {
        let (provider, key_id) = keyring_with_key("alice@example.com");

        let export = provider.export_public_key(&key_id).unwrap();
        provider.import_public_key(&export).unwrap();

        assert!(provider.sign(&key_id, b"still mine").is_ok());
    }

    #[test]
    fn test_import_malformed_key() {
        let provider = SoftwareProvider::new();
        assert!(matches!(
            provider.import_public_key(b"not a key"),
            Err(ProviderError::MalformedKey(_))
        ));
    }

    #[test]
    fn test_unknown_key() {
        let provider = SoftwareProvider::new();
        let key_id = KeyId::new("DEADBEEF").unwrap();

        assert_eq!(
            provider.export_public_key(&key_id).unwrap_err(),
            ProviderError::UnknownKey(key_id.clone())
        );
        assert_eq!(
            provider.encrypt(&key_id, b"x").unwrap_err(),
            ProviderError::UnknownKey(key_id)
        );
    }

    #[test]
    fn test_identity_lookup() {
        let (provider, key_id) = keyring_with_key("alice@example.com");

        assert_eq!(provider.find_by_identity("alice@example.com"), Some(key_id.clone()));
        assert_eq!(provider.find_by_identity("bob@example.com"), None);
        assert_eq!(provider.identity_of(&key_id).as_deref(), Some("alice@example.com"));
    }

    #[test]
    fn test_empty_identity_rejected() {
        let provider = SoftwareProvider::new();
        assert!(provider.generate_keypair("  ", "pw").is_err());
        assert!(provider.is_empty());
    }
}
