//! The value types stored at a key: raw bytes for binary keys, structured
//! JSON for everything else (§3.1, §4.2 contracts).

use crate::error::{Error, Result};
use crate::key::NormalizedKey;
use serde_json::Value as Json;

/// A value read from or written to the engine.
///
/// Buffer values are only legal for binary keys; JSON values only for
/// JSON keys. [`Value::check_key`] enforces this at the Store boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Raw bytes, stored verbatim. Only legal for binary keys.
    Buffer(Vec<u8>),
    /// A structured JSON document. Only legal for JSON keys.
    Json(Json),
}

impl Value {
    /// Reject a buffer-on-JSON-key or JSON-on-binary-key mismatch.
    pub fn check_key(&self, key: &NormalizedKey) -> Result<()> {
        match (self, key.is_binary()) {
            (Value::Buffer(_), false) => Err(Error::InvalidInput(format!(
                "key '{key}' is a JSON key and cannot hold a buffer value"
            ))),
            (Value::Json(_), true) => Err(Error::InvalidInput(format!(
                "key '{key}' is a binary key and cannot hold a structured value"
            ))),
            _ => Ok(()),
        }
    }

    /// Unwrap a JSON value, or error if this is a buffer.
    pub fn into_json(self) -> Result<Json> {
        match self {
            Value::Json(j) => Ok(j),
            Value::Buffer(_) => Err(Error::InvalidInput(
                "expected a JSON value, found a buffer".into(),
            )),
        }
    }

    /// Unwrap a buffer value, or error if this is JSON.
    pub fn into_buffer(self) -> Result<Vec<u8>> {
        match self {
            Value::Buffer(b) => Ok(b),
            Value::Json(_) => Err(Error::InvalidInput(
                "expected a buffer value, found JSON".into(),
            )),
        }
    }

    /// Borrow as JSON, or error if this is a buffer.
    pub fn as_json(&self) -> Result<&Json> {
        match self {
            Value::Json(j) => Ok(j),
            Value::Buffer(_) => Err(Error::InvalidInput(
                "expected a JSON value, found a buffer".into(),
            )),
        }
    }
}

impl From<Json> for Value {
    fn from(j: Json) -> Self {
        Value::Json(j)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Buffer(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::normalize;

    #[test]
    fn buffer_rejected_on_json_key() {
        let key = normalize("users/bob");
        let v = Value::Buffer(vec![1, 2, 3]);
        assert!(v.check_key(&key).is_err());
    }

    #[test]
    fn json_rejected_on_binary_key() {
        let key = normalize("avatars/bob.gif");
        let v = Value::Json(serde_json::json!({"a": 1}));
        assert!(v.check_key(&key).is_err());
    }

    #[test]
    fn matching_combinations_accepted() {
        let json_key = normalize("users/bob");
        let bin_key = normalize("avatars/bob.gif");
        assert!(Value::Json(serde_json::json!(1)).check_key(&json_key).is_ok());
        assert!(Value::Buffer(vec![]).check_key(&bin_key).is_ok());
    }
}
