//! Session fields carried inside a token.
//!
//! On the wire the fields are one flat JSON object; the key id travels in the
//! reserved member [`RESERVED_KEY_ID_FIELD`]. In memory the key id is lifted
//! out into its own slot so application data can never shadow or drop it.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::identity::KeyId;

use super::TokenError;

/// Wire name of the member holding the key id.
pub const RESERVED_KEY_ID_FIELD: &str = "pubkeyid";

/// Key id binding plus application-level session data.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionFields {
    key_id: Option<KeyId>,
    extra: Map<String, Value>,
}

impl SessionFields {
    /// Bind `extra` to `key_id`.
    ///
    /// # Errors
    ///
    /// Returns `TokenError::ReservedField` if `extra` already uses the
    /// reserved member name.
    pub fn new(key_id: KeyId, extra: Map<String, Value>) -> Result<Self, TokenError> {
        if extra.contains_key(RESERVED_KEY_ID_FIELD) {
            return Err(TokenError::ReservedField(RESERVED_KEY_ID_FIELD.to_string()));
        }
        Ok(Self {
            key_id: Some(key_id),
            extra,
        })
    }

    /// Split a flat wire object into key id and session data.
    ///
    /// An absent key id is allowed here; callers that need one ask
    /// [`key_id`](Self::key_id) and get an operation-specific error.
    ///
    /// # Errors
    ///
    /// Returns `TokenError::Malformed` if the reserved member is present but is
    /// not a valid key id string.
    pub fn from_object(mut object: Map<String, Value>) -> Result<Self, TokenError> {
        let key_id = match object.remove(RESERVED_KEY_ID_FIELD) {
            None => None,
            Some(Value::String(id)) => Some(
                KeyId::new(id).map_err(|_| TokenError::Malformed("key id is not valid"))?,
            ),
            Some(_) => return Err(TokenError::Malformed("key id is not a string")),
        };
        Ok(Self {
            key_id,
            extra: object,
        })
    }

    /// Rebuild the flat wire object.
    #[must_use]
    pub fn to_object(&self) -> Map<String, Value> {
        let mut object = self.extra.clone();
        if let Some(key_id) = &self.key_id {
            object.insert(
                RESERVED_KEY_ID_FIELD.to_string(),
                Value::String(key_id.as_str().to_string()),
            );
        }
        object
    }

    /// The identity bound to this session.
    ///
    /// # Errors
    ///
    /// Returns `TokenError::MissingKeyId` if the fields were decoded from a
    /// token that didn't carry one.
    pub fn key_id(&self) -> Result<&KeyId, TokenError> {
        self.key_id.as_ref().ok_or(TokenError::MissingKeyId)
    }

    /// Session-visible data (never contains the reserved member).
    #[must_use]
    pub fn extra(&self) -> &Map<String, Value> {
        &self.extra
    }

    /// Consume and return the session-visible data.
    #[must_use]
    pub fn into_extra(self) -> Map<String, Value> {
        self.extra
    }

    /// Look up one session-visible field.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.extra.get(name)
    }

    /// Set one session-visible field, returning the previous value.
    ///
    /// # Errors
    ///
    /// Returns `TokenError::ReservedField` for the reserved member name.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        value: Value,
    ) -> Result<Option<Value>, TokenError> {
        let name = name.into();
        if name == RESERVED_KEY_ID_FIELD {
            return Err(TokenError::ReservedField(name));
        }
        Ok(self.extra.insert(name, value))
    }
}

impl Serialize for SessionFields {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_object().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SessionFields {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let object = Map::<String, Value>::deserialize(deserializer)?;
        Self::from_object(object).map_err(serde::de::Error::custom)
    }
}

/// Session-visible fields with the key id removed.
///
/// # Errors
///
/// Returns `TokenError::MissingKeyId` if the fields carry no key id.
pub fn strip_reserved(fields: SessionFields) -> Result<Map<String, Value>, TokenError> {
    fields.key_id()?;
    Ok(fields.into_extra())
}
