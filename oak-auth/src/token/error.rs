//! Token error types.

/// Errors that can occur while decoding or assembling a token.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum TokenError {
    /// The token violates the wire layout.
    #[error("malformed token: {0}")]
    Malformed(&'static str),

    /// The session fields do not carry the key id.
    #[error("session fields lack the key id")]
    MissingKeyId,

    /// Application data tried to use the reserved key id member.
    #[error("field name {0:?} is reserved")]
    ReservedField(String),
}
