//! Serde helpers for types that travel as base64 in JSON.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde::{de, Deserialize, Deserializer, Serializer};


/// Binary content as a base64 string.
pub mod base64_bytes {
    use super::*;

    pub fn serialize<S>(bytes: &Bytes, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(d: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(d)?;
        STANDARD
            .decode(string.trim())
            .map(Bytes::from)
            .map_err(de::Error::custom)
    }
}

/// Optional binary content as a base64 string or null.
pub mod opt_base64_bytes {
    use super::*;

    pub fn serialize<S>(bytes: &Option<Bytes>, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match bytes {
            Some(bytes) => s.serialize_some(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(d: D) -> Result<Option<Bytes>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(d)? {
            Some(string) => STANDARD
                .decode(string.trim())
                .map(|bytes| Some(Bytes::from(bytes)))
                .map_err(de::Error::custom),
            None => Ok(None),
        }
    }
}

/// Encodes bytes as standard base64.
pub fn encode_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decodes standard base64, ignoring surrounding whitespace.
pub fn decode_base64(s: &str) -> Result<Bytes, base64::DecodeError> {
    STANDARD.decode(s.trim()).map(Bytes::from)
}
