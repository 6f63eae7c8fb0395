use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Errors produced while converting user values to/from payload bytes.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode value: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode value: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Capability for serializing handler inputs, outputs, and side-effect
/// results to opaque payload bytes.
///
/// The core never interprets payloads itself; a codec is threaded
/// explicitly through the driver into the contexts. There is no global
/// serializer registry.
pub trait PayloadCodec: Clone + Send + Sync + 'static {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Bytes, CodecError>;

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError>;

    /// Content type advertised for payloads produced by this codec.
    fn content_type(&self) -> &'static str;
}

/// JSON codec, the default for handler payloads.
///
/// Unit values encode to empty bytes and empty bytes decode any type with
/// a unit-like representation, so void handlers round-trip without a
/// special case at call sites.
#[derive(Clone, Copy, Debug, Default)]
pub struct Json;

impl PayloadCodec for Json {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Bytes, CodecError> {
        let bytes = serde_json::to_vec(value).map_err(CodecError::Encode)?;
        // `()` serializes to "null"; void payloads travel as empty bytes.
        if bytes == b"null" {
            return Ok(Bytes::new());
        }
        Ok(Bytes::from(bytes))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        if bytes.is_empty() {
            return serde_json::from_slice(b"null").map_err(CodecError::Decode);
        }
        serde_json::from_slice(bytes).map_err(CodecError::Decode)
    }

    fn content_type(&self) -> &'static str {
        "application/json"
    }
}
