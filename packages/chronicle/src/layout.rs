//! Canonical encoding of command and event payloads.
//!
//! The journal stores every payload in canonical form: encoded to a JSON
//! buffer and decoded back. Whatever in-process state does not survive the
//! round trip (skipped fields, caches) is dropped before the entity becomes
//! visible, so readers see exactly what a later reload would produce.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Failure to encode or decode a payload.
#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("failed to encode {entity_type}: {source}")]
    Encode {
        entity_type: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to decode {entity_type}: {source}")]
    Decode {
        entity_type: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Encode a payload into its fixed-format buffer.
pub fn encode<T: Serialize>(entity_type: &'static str, value: &T) -> Result<Vec<u8>, LayoutError> {
    serde_json::to_vec(value).map_err(|source| LayoutError::Encode {
        entity_type,
        source,
    })
}

/// Decode a payload from its buffer.
pub fn decode<T: DeserializeOwned>(entity_type: &'static str, bytes: &[u8]) -> Result<T, LayoutError> {
    serde_json::from_slice(bytes).map_err(|source| LayoutError::Decode {
        entity_type,
        source,
    })
}

/// Round-trip a payload through its encoding.
pub fn normalize<T>(entity_type: &'static str, value: &T) -> Result<T, LayoutError>
where
    T: Serialize + DeserializeOwned,
{
    let bytes = encode(entity_type, value)?;
    decode(entity_type, &bytes)
}
