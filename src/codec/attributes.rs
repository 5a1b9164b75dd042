//! JSON attribute codec using `serde_json`.
//!
//! Headers carry the artifact's attributes as one flat JSON object:
//!
//! ```text
//! {"filename":"data.csv","mime.type":"text/csv"}
//! ```
//!
//! String values are kept as-is. Other scalars (and nested values sent by
//! less strict peers) are stored as their JSON text, so `{"n":3}` yields
//! `n = "3"`. Anything other than a top-level object is rejected.
//!
//! # Example
//!
//! ```
//! use flowwire::codec::{AttributeCodec, AttributeMap};
//!
//! let mut attrs = AttributeMap::new();
//! attrs.insert("filename".to_string(), "a.txt".to_string());
//!
//! let encoded = AttributeCodec::encode(&attrs).unwrap();
//! let decoded = AttributeCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, attrs);
//! ```

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::{FlowError, Result};

/// String-to-string attribute map attached to an artifact.
pub type AttributeMap = BTreeMap<String, String>;

/// Codec for attribute headers.
pub struct AttributeCodec;

impl AttributeCodec {
    /// Encode attributes as a JSON object.
    ///
    /// An empty map encodes to zero bytes so the message carries no header.
    pub fn encode(attributes: &AttributeMap) -> Result<Vec<u8>> {
        if attributes.is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::to_vec(attributes)?)
    }

    /// Decode header bytes into attributes.
    ///
    /// # Errors
    ///
    /// Returns `AttributeDecode` if the bytes are not valid JSON or not an object.
    pub fn decode(bytes: &[u8]) -> Result<AttributeMap> {
        if bytes.is_empty() {
            return Ok(AttributeMap::new());
        }

        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| FlowError::AttributeDecode(e.to_string()))?;

        let Value::Object(object) = value else {
            return Err(FlowError::AttributeDecode(format!(
                "expected a JSON object, found {}",
                kind(&value)
            )));
        };

        Ok(object
            .into_iter()
            .map(|(key, value)| {
                let value = match value {
                    Value::String(s) => s,
                    Value::Null => String::new(),
                    other => other.to_string(),
                };
                (key, value)
            })
            .collect())
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_flat_object() {
        let attrs = AttributeCodec::decode(br#"{"filename":"a.txt","path":"./"}"#).unwrap();
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs["filename"], "a.txt");
        assert_eq!(attrs["path"], "./");
    }

    #[test]
    fn test_decode_coerces_scalars() {
        let attrs = AttributeCodec::decode(br#"{"n":3,"ok":true,"none":null,"list":[1,2]}"#).unwrap();
        assert_eq!(attrs["n"], "3");
        assert_eq!(attrs["ok"], "true");
        assert_eq!(attrs["none"], "");
        assert_eq!(attrs["list"], "[1,2]");
    }

    #[test]
    fn test_decode_empty_bytes() {
        assert!(AttributeCodec::decode(b"").unwrap().is_empty());
    }

    #[test]
    fn test_decode_invalid_json() {
        let result = AttributeCodec::decode(b"{not json");
        assert!(matches!(result, Err(FlowError::AttributeDecode(_))));
    }

    #[test]
    fn test_decode_non_object() {
        let err = AttributeCodec::decode(b"[1,2,3]").unwrap_err();
        assert!(matches!(err, FlowError::AttributeDecode(_)));
        assert!(err.to_string().contains("an array"));
    }

    #[test]
    fn test_decode_invalid_utf8() {
        let result = AttributeCodec::decode(&[b'{', 0xFF, 0xFE, b'}']);
        assert!(matches!(result, Err(FlowError::AttributeDecode(_))));
    }

    #[test]
    fn test_encode_empty_is_no_header() {
        assert!(AttributeCodec::encode(&AttributeMap::new()).unwrap().is_empty());
    }

    #[test]
    fn test_encode_is_sorted_object() {
        let mut attrs = AttributeMap::new();
        attrs.insert("b".to_string(), "2".to_string());
        attrs.insert("a".to_string(), "1".to_string());

        let encoded = AttributeCodec::encode(&attrs).unwrap();
        assert_eq!(encoded, br#"{"a":"1","b":"2"}"#);
    }

    #[test]
    fn test_unicode_values() {
        let mut attrs = AttributeMap::new();
        attrs.insert("name".to_string(), "żółw 🐢".to_string());

        let decoded = AttributeCodec::decode(&AttributeCodec::encode(&attrs).unwrap()).unwrap();
        assert_eq!(decoded, attrs);
    }
}
