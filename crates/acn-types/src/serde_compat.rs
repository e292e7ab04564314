//! Serde helpers for binary fields carried inside JSON documents.
//!
//! Envelope payloads and nested serialized messages are opaque bytes. JSON
//! has no byte type, so they are written as standard base64 strings.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::de::{self, Deserializer, Visitor};
use serde::Serializer;
use std::fmt;

/// `#[serde(with = "base64_bytes")]` for `Vec<u8>` fields.
pub mod base64_bytes {
    use super::*;

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_str(Base64Visitor)
    }
}

struct Base64Visitor;

impl<'de> Visitor<'de> for Base64Visitor {
    type Value = Vec<u8>;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a base64-encoded string")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        STANDARD.decode(v).map_err(E::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Blob {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    }

    #[test]
    fn test_bytes_written_as_base64() {
        let blob = Blob {
            data: b"hello".to_vec(),
        };
        let json = serde_json::to_string(&blob).unwrap();
        assert_eq!(json, r#"{"data":"aGVsbG8="}"#);
        let back: Blob = serde_json::from_str(&json).unwrap();
        assert_eq!(back, blob);
    }

    #[test]
    fn test_invalid_base64_rejected() {
        let result: Result<Blob, _> = serde_json::from_str(r#"{"data":"not base64!"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_non_string_rejected() {
        let result: Result<Blob, _> = serde_json::from_str(r#"{"data":[1,2,3]}"#);
        assert!(result.is_err());
    }
}
