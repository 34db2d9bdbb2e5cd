//! Base64 helpers for wire fields.
//!
//! All binary values cross the wire as standard (padded) base64.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::{Error, Result};

/// Encode bytes as standard base64.
#[must_use]
pub fn encode(bytes: impl AsRef<[u8]>) -> String {
    STANDARD.encode(bytes)
}

/// Decode a base64 field of any length.
pub fn decode(field: &'static str, value: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(value)
        .map_err(|_| Error::InvalidBase64 { field })
}

/// Decode a base64 field that must be exactly `N` bytes long.
pub fn decode_fixed<const N: usize>(field: &'static str, value: &str) -> Result<[u8; N]> {
    let bytes = decode(field, value)?;
    let actual = bytes.len();
    bytes.try_into().map_err(|_| Error::InvalidLength {
        field,
        expected: N,
        actual,
    })
}

/// Whether `value` is already a canonical standard-base64 string.
#[must_use]
pub fn is_canonical(value: &[u8]) -> bool {
    if value.is_empty() || value.len() % 4 != 0 {
        return false;
    }
    match std::str::from_utf8(value) {
        Ok(text) => STANDARD
            .decode(text)
            .map(|decoded| STANDARD.encode(decoded) == text)
            .unwrap_or(false),
        Err(_) => false,
    }
}

/// Serde adapter storing `Vec<u8>` as a base64 string.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
