//! OAK client library: gpg-backed provider, configuration and token storage.
//!
//! The `oak` binary is a thin layer over these modules and
//! [`oak_auth::Session`].

pub mod config;
pub mod gpg;
pub mod store;
pub mod utils;

pub use config::ClientConfig;
pub use gpg::GpgProvider;
pub use store::{StoredToken, TokenStore};
