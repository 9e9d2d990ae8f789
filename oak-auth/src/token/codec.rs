//! Wire codec for rolling tokens.
//!
//! Wire format (version 1):
//!
//! ```text
//! base64(challenge) "-" base64(json(fields)) "|" base64(tag)
//! ```
//!
//! All components use the standard base64 alphabet with padding. That
//! alphabet (`A-Z a-z 0-9 + / =`) contains neither separator, so no escaping
//! is ever needed. The URL-safe alphabet uses `-` and must not be used here.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::Value;

use crate::identity::KeyId;

use super::{SessionFields, TokenError};

/// Separates the challenge slot from the data part.
pub const CHALLENGE_SEPARATOR: char = '-';

/// Separates the fields from the integrity tag inside the data part.
pub const TAG_SEPARATOR: char = '|';

/// Maximum accepted wire length (64 KiB).
pub const MAX_TOKEN_LEN: usize = 64 * 1024;

/// A decoded version 1 token.
///
/// Immutable: rolling builds a new value via [`with_challenge`](Self::with_challenge).
/// The data part is kept exactly as received so that pass-through is
/// byte-identical even if the issuer's JSON member order differs from ours.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    challenge: Vec<u8>,
    fields: SessionFields,
    tag: Vec<u8>,
    fields_json: Vec<u8>,
    data_segment: String,
}

impl Token {
    /// Assemble a token from its components.
    #[must_use]
    pub fn new(challenge: Vec<u8>, fields: SessionFields, tag: Vec<u8>) -> Self {
        let fields_json = Value::Object(fields.to_object()).to_string().into_bytes();
        let data_segment = format!(
            "{}{}{}",
            STANDARD.encode(&fields_json),
            TAG_SEPARATOR,
            STANDARD.encode(&tag)
        );
        Self {
            challenge,
            fields,
            tag,
            fields_json,
            data_segment,
        }
    }

    /// Decode a wire token.
    ///
    /// # Errors
    ///
    /// Returns `TokenError::Malformed` if the token is too long, not UTF-8,
    /// lacks a separator, has a component that isn't valid base64, or its
    /// fields are not a JSON object.
    pub fn decode(raw: impl AsRef<[u8]>) -> Result<Self, TokenError> {
        let raw = raw.as_ref();
        if raw.len() > MAX_TOKEN_LEN {
            return Err(TokenError::Malformed("token too long"));
        }
        let raw = std::str::from_utf8(raw)
            .map_err(|_| TokenError::Malformed("token is not ASCII"))?
            .trim();

        let (challenge_b64, data_segment) = raw
            .split_once(CHALLENGE_SEPARATOR)
            .ok_or(TokenError::Malformed("missing challenge separator"))?;
        let (fields_b64, tag_b64) = data_segment
            .split_once(TAG_SEPARATOR)
            .ok_or(TokenError::Malformed("missing tag separator"))?;

        let challenge = STANDARD
            .decode(challenge_b64)
            .map_err(|_| TokenError::Malformed("challenge is not valid base64"))?;
        let fields_json = STANDARD
            .decode(fields_b64)
            .map_err(|_| TokenError::Malformed("fields are not valid base64"))?;
        let tag = STANDARD
            .decode(tag_b64)
            .map_err(|_| TokenError::Malformed("tag is not valid base64"))?;

        let object = match serde_json::from_slice::<Value>(&fields_json) {
            Ok(Value::Object(object)) => object,
            Ok(_) => return Err(TokenError::Malformed("fields are not a JSON object")),
            Err(_) => return Err(TokenError::Malformed("fields are not valid JSON")),
        };

        Ok(Self {
            challenge,
            fields: SessionFields::from_object(object)?,
            tag,
            fields_json,
            data_segment: data_segment.to_string(),
        })
    }

    /// Encrypted (or, after a roll, signed) challenge bytes.
    #[must_use]
    pub fn challenge(&self) -> &[u8] {
        &self.challenge
    }

    /// Session fields.
    #[must_use]
    pub fn fields(&self) -> &SessionFields {
        &self.fields
    }

    /// Integrity tag binding the fields.
    #[must_use]
    pub fn tag(&self) -> &[u8] {
        &self.tag
    }

    /// Serialized fields exactly as carried on the wire. This is what the
    /// integrity tag covers.
    #[must_use]
    pub fn fields_json(&self) -> &[u8] {
        &self.fields_json
    }

    /// The `fields|tag` text exactly as it appears on the wire.
    #[must_use]
    pub fn data_segment(&self) -> &str {
        &self.data_segment
    }

    /// Key id bound to this token.
    ///
    /// # Errors
    ///
    /// Returns `TokenError::MissingKeyId` if the fields don't carry one.
    pub fn key_id(&self) -> Result<&KeyId, TokenError> {
        self.fields.key_id()
    }

    /// A new token with a replaced challenge slot and the same data part.
    #[must_use]
    pub fn with_challenge(&self, challenge: Vec<u8>) -> Self {
        Self {
            challenge,
            fields: self.fields.clone(),
            tag: self.tag.clone(),
            fields_json: self.fields_json.clone(),
            data_segment: self.data_segment.clone(),
        }
    }

    /// Encode for the wire.
    #[must_use]
    pub fn to_wire(&self) -> String {
        format!(
            "{}{}{}",
            STANDARD.encode(&self.challenge),
            CHALLENGE_SEPARATOR,
            self.data_segment
        )
    }

    /// Split into `(challenge, fields, tag)`.
    #[must_use]
    pub fn into_parts(self) -> (Vec<u8>, SessionFields, Vec<u8>) {
        (self.challenge, self.fields, self.tag)
    }

    /// Non-secret overview of this token, for diagnostics.
    #[must_use]
    pub fn summary(&self) -> TokenSummary {
        TokenSummary {
            key_id: self.fields.key_id().ok().cloned(),
            field_names: self.fields.extra().keys().cloned().collect(),
            challenge_len: self.challenge.len(),
            tag_len: self.tag.len(),
        }
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_wire())
    }
}

impl std::str::FromStr for Token {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

/// Non-secret overview of a token.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct TokenSummary {
    /// Bound key id, if present.
    pub key_id: Option<KeyId>,
    /// Names of the session-visible fields.
    pub field_names: Vec<String>,
    /// Challenge slot size in bytes.
    pub challenge_len: usize,
    /// Integrity tag size in bytes.
    pub tag_len: usize,
}

/// Decode a wire token into its components.
///
/// # Errors
///
/// See [`Token::decode`].
pub fn decode(raw: impl AsRef<[u8]>) -> Result<Token, TokenError> {
    Token::decode(raw)
}

/// Encode components into a wire token. Exact left inverse of [`decode`].
#[must_use]
pub fn encode(challenge: &[u8], fields: &SessionFields, tag: &[u8]) -> String {
    Token::new(challenge.to_vec(), fields.clone(), tag.to_vec()).to_wire()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::{json, Map};

    fn alice() -> KeyId {
        KeyId::new("3AA5C34371567BD2F1B5D0D3C2A1E4C8B5F0A1D2").unwrap()
    }

    fn fields(extra: Value) -> SessionFields {
        let Value::Object(extra) = extra else {
            panic!("expected object")
        };
        SessionFields::new(alice(), extra).unwrap()
    }

    #[test]
    fn test_wire_layout() {
        let wire = encode(b"chal", &fields(json!({})), b"tag");
        let (challenge, rest) = wire.split_once('-').unwrap();
        let (fields_b64, tag) = rest.split_once('|').unwrap();

        assert_eq!(challenge, STANDARD.encode(b"chal"));
        assert_eq!(tag, STANDARD.encode(b"tag"));

        let json: Value = serde_json::from_slice(&STANDARD.decode(fields_b64).unwrap()).unwrap();
        assert_eq!(json, json!({"pubkeyid": alice().as_str()}));
    }

    #[test]
    fn test_decode_components() {
        let wire = encode(b"\x00\xffchallenge", &fields(json!({"n": 1})), &[7u8; 64]);
        let token = decode(&wire).unwrap();

        assert_eq!(token.challenge(), b"\x00\xffchallenge");
        assert_eq!(token.key_id().unwrap(), &alice());
        assert_eq!(token.fields().get("n"), Some(&json!(1)));
        assert_eq!(token.tag(), &[7u8; 64]);
        assert_eq!(token.to_wire(), wire);
    }

    #[test]
    fn test_decode_accepts_bytes() {
        let wire = encode(b"c", &fields(json!({})), b"t");
        assert_eq!(decode(wire.as_bytes()).unwrap(), decode(&wire).unwrap());
    }

    #[test]
    fn test_missing_challenge_separator() {
        let wire = encode(b"c", &fields(json!({})), b"t").replacen('-', "", 1);
        assert_eq!(
            decode(&wire),
            Err(TokenError::Malformed("missing challenge separator"))
        );
    }

    #[test]
    fn test_missing_tag_separator() {
        let wire = encode(b"c", &fields(json!({})), b"t").replace('|', "");
        assert_eq!(decode(&wire), Err(TokenError::Malformed("missing tag separator")));
    }

    #[test]
    fn test_invalid_base64_rejected() {
        let good = encode(b"c", &fields(json!({})), b"t");
        let (_, data) = good.split_once('-').unwrap();
        let (f, t) = data.split_once('|').unwrap();

        assert!(matches!(decode(format!("!!!-{data}")), Err(TokenError::Malformed(_))));
        assert!(matches!(decode(format!("YQ==-{f}|%%")), Err(TokenError::Malformed(_))));
        assert!(matches!(decode(format!("YQ==-$${t}|{t}")), Err(TokenError::Malformed(_))));
        // A second tag separator makes the tag invalid base64.
        assert!(matches!(decode(format!("{good}|YQ==")), Err(TokenError::Malformed(_))));
    }

    #[test]
    fn test_fields_must_be_json_object() {
        let not_json = STANDARD.encode(b"{not json");
        assert_eq!(
            decode(format!("YQ==-{not_json}|YQ==")),
            Err(TokenError::Malformed("fields are not valid JSON"))
        );

        let array = STANDARD.encode(b"[1,2]");
        assert_eq!(
            decode(format!("YQ==-{array}|YQ==")),
            Err(TokenError::Malformed("fields are not a JSON object"))
        );
    }

    #[test]
    fn test_missing_key_id_decodes() {
        let fields_b64 = STANDARD.encode(br#"{"role":"guest"}"#);
        let token = decode(format!("YQ==-{fields_b64}|YQ==")).unwrap();
        assert_eq!(token.key_id(), Err(TokenError::MissingKeyId));
    }

    #[test]
    fn test_oversized_token_rejected() {
        let huge = "A".repeat(MAX_TOKEN_LEN + 1);
        assert_eq!(decode(huge), Err(TokenError::Malformed("token too long")));
    }

    #[test]
    fn test_non_utf8_rejected() {
        assert!(matches!(decode([0xff, b'-', b'|']), Err(TokenError::Malformed(_))));
    }

    #[test]
    fn test_with_challenge_keeps_data_segment_verbatim() {
        // Issuer serialized members in an order serde_json wouldn't produce.
        let fields_b64 = STANDARD.encode(br#"{"z":1,"pubkeyid":"ABCDEF","a":2}"#);
        let wire = format!("YQ==-{fields_b64}|dGFn");
        let token = decode(&wire).unwrap();

        let rolled = token.with_challenge(b"signed".to_vec());
        let rolled_wire = rolled.to_wire();

        assert_eq!(rolled_wire.split_once('-').unwrap().1, wire.split_once('-').unwrap().1);
        assert_eq!(decode(&rolled_wire).unwrap().challenge(), b"signed");
        assert_eq!(rolled.fields_json(), br#"{"z":1,"pubkeyid":"ABCDEF","a":2}"#);
    }

    #[test]
    fn test_summary_hides_values() {
        let token = decode(encode(b"abc", &fields(json!({"cart": [1]})), b"tag")).unwrap();
        let summary = token.summary();

        assert_eq!(summary.key_id, Some(alice()));
        assert_eq!(summary.field_names, vec!["cart".to_string()]);
        assert_eq!(summary.challenge_len, 3);
        assert_eq!(summary.tag_len, 3);
    }

    fn arb_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            ".{0,16}".prop_map(Value::from),
            Just(Value::Null),
        ]
    }

    proptest! {
        #[test]
        fn decode_is_left_inverse_of_encode(
            challenge in proptest::collection::vec(any::<u8>(), 0..128),
            tag in proptest::collection::vec(any::<u8>(), 0..64),
            extra in proptest::collection::btree_map("[a-z]{1,7}", arb_value(), 0..6),
        ) {
            let extra: Map<String, Value> = extra.into_iter().collect();
            let fields = SessionFields::new(alice(), extra).unwrap();

            let token = decode(encode(&challenge, &fields, &tag)).unwrap();

            prop_assert_eq!(token.challenge(), challenge.as_slice());
            prop_assert_eq!(token.fields(), &fields);
            prop_assert_eq!(token.tag(), tag.as_slice());
        }
    }
}
