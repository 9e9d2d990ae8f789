//! Cryptographic identity types for OAK.
//!
//! - [`KeyPair`] - Ed25519 signing + X25519 agreement keys, zeroized on drop
//! - [`PublicKey`] - Exportable public half (`OAK1 || ed25519 || x25519`)
//! - [`Signature`] - Ed25519 signature over a message
//! - [`KeyId`] - Provider-issued key identifier bound into every token
//!
//! # Example
//!
//! ```
//! use oak_auth::identity::{KeyId, KeyPair};
//!
//! let pair = KeyPair::generate();
//! let public_key = pair.public_key();
//! let key_id = KeyId::from_public_key(&public_key);
//! assert!(key_id.as_str().starts_with("SHA256:"));
//!
//! let signature = pair.sign(b"nonce-1");
//! assert!(public_key.verify(b"nonce-1", &signature));
//! ```

mod keys;

pub use keys::{KeyError, KeyId, KeyPair, PublicKey, SecretBytes, Signature, PUBLIC_EXPORT_LEN};
