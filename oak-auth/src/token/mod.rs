//! Token data model and codec.
//!
//! - [`Token`] - version 1 rolling token: `challenge-fields|tag`
//! - [`BootstrapToken`] - version 0 identity announcement (public key export)
//! - [`SessionFields`] - key id binding plus application session data

mod bootstrap;
mod codec;
mod error;
mod fields;

pub use bootstrap::{BootstrapToken, TokenVersion};
pub use codec::{
    decode, encode, Token, TokenSummary, CHALLENGE_SEPARATOR, MAX_TOKEN_LEN, TAG_SEPARATOR,
};
pub use error::TokenError;
pub use fields::{strip_reserved, SessionFields, RESERVED_KEY_ID_FIELD};
