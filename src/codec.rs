//! Extension envelope framing.
//!
//! The wire schema declares four fields (`id`, `data`, `options`, `error`)
//! with fixed numeric field ids, matching a protobuf `Envelope` message.
//! This implementation carries the same shape over `serde` + CBOR rather
//! than literal protobuf bytes — the teacher this core is grounded on
//! already encodes its own envelopes (`ControlEnvelope`, `FrameEnvelope`)
//! the same way, and the corpus has no protobuf codegen dependency.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Type url for the raw-buffer wrapper, matching spec.md's
/// `"dxos.protocol.Buffer"` literal.
pub const BUFFER_TYPE_URL: &str = "dxos.protocol.Buffer";

/// A payload schema registered on an [`crate::extension::Extension`].
///
/// Implementors model the "union of schemas" described in spec.md §9: each
/// encoded value advertises its own `type_url`, and `decode` dispatches on
/// that tag. `Vec<u8>` implements this trait directly for raw-buffer mode.
pub trait Schema: Sized + Send + Sync + 'static {
    /// The `type_url` this specific value should be tagged with on the wire.
    fn type_url(&self) -> &str;

    /// Serializes the value's inner bytes (not including the type_url tag).
    fn encode_value(&self) -> Result<Vec<u8>, CodecError>;

    /// Attempts to decode `bytes` tagged with `type_url`.
    ///
    /// Returns `Ok(None)` for an unrecognized `type_url` so the caller can
    /// distinguish "valid envelope, unknown payload" from a decode failure.
    fn decode_value(type_url: &str, bytes: &[u8]) -> Result<Option<Self>, CodecError>;
}

/// Raw-buffer mode: `data` is a byte sequence wrapped as a `Buffer` message.
impl Schema for Vec<u8> {
    fn type_url(&self) -> &str {
        BUFFER_TYPE_URL
    }

    fn encode_value(&self) -> Result<Vec<u8>, CodecError> {
        Ok(self.clone())
    }

    fn decode_value(type_url: &str, bytes: &[u8]) -> Result<Option<Self>, CodecError> {
        if type_url == BUFFER_TYPE_URL {
            Ok(Some(bytes.to_vec()))
        } else {
            Ok(None)
        }
    }
}

/// A JSON-backed structured schema for extensions that register a single
/// serde type instead of raw bytes; used when a concrete `Schema` enum would
/// be overkill. `type_url` is fixed at the Rust type name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Json<T>(pub T);

impl<T> Schema for Json<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static,
{
    fn type_url(&self) -> &str {
        std::any::type_name::<T>()
    }

    fn encode_value(&self) -> Result<Vec<u8>, CodecError> {
        serde_cbor::to_vec(&self.0).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode_value(type_url: &str, bytes: &[u8]) -> Result<Option<Self>, CodecError> {
        if type_url != std::any::type_name::<T>() {
            return Ok(None);
        }
        let value: T =
            serde_cbor::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))?;
        Ok(Some(Json(value)))
    }
}

/// Low-level encode/decode failure, distinct from [`crate::error::ProtocolError`]
/// since a codec failure is a schema/serialization concern, not a protocol one.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
}

/// One-way/response options carried on the envelope (field 3).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Options {
    pub oneway: bool,
}

/// Wire error payload (field 4).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WireError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireAny {
    type_url: String,
    value: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireEnvelope {
    id: [u8; 32],
    data: WireAny,
    options: Options,
    error: Option<WireError>,
}

/// The decoded form of an envelope used by [`crate::extension::Extension`].
#[derive(Debug, Clone)]
pub struct Envelope<S> {
    pub id: [u8; 32],
    pub data: Option<S>,
    pub options: Options,
    pub error: Option<WireError>,
}

impl<S> Envelope<S> {
    pub fn empty() -> Self {
        Envelope {
            id: [0u8; 32],
            data: None,
            options: Options::default(),
            error: None,
        }
    }
}

/// Encodes and decodes [`Envelope`] values for a single extension's schema.
pub struct Codec<S> {
    _marker: std::marker::PhantomData<S>,
}

impl<S: Schema> Codec<S> {
    pub fn new() -> Self {
        Codec {
            _marker: std::marker::PhantomData,
        }
    }

    pub fn encode(&self, envelope: &Envelope<S>) -> Result<Vec<u8>, CodecError> {
        let data = match &envelope.data {
            Some(value) => WireAny {
                type_url: value.type_url().to_string(),
                value: value.encode_value()?,
            },
            None => WireAny {
                type_url: String::new(),
                value: Vec::new(),
            },
        };
        let wire = WireEnvelope {
            id: envelope.id,
            data,
            options: envelope.options,
            error: envelope.error.clone(),
        };
        serde_cbor::to_vec(&wire).map_err(|e| CodecError::Encode(e.to_string()))
    }

    /// Decodes raw bytes into an envelope. Invalid bytes never error out —
    /// per spec.md §4.1 they decode to an empty envelope so the caller can
    /// treat the frame as an unsolicited unparseable drop instead of a crash.
    pub fn decode(&self, bytes: &[u8]) -> Envelope<S> {
        let Ok(wire) = serde_cbor::from_slice::<WireEnvelope>(bytes) else {
            return Envelope::empty();
        };
        let data = if wire.data.type_url.is_empty() {
            None
        } else {
            S::decode_value(&wire.data.type_url, &wire.data.value).unwrap_or(None)
        };
        Envelope {
            id: wire.id,
            data,
            options: wire.options,
            error: wire.error,
        }
    }
}

impl<S: Schema> Default for Codec<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_buffer_roundtrip() {
        let codec: Codec<Vec<u8>> = Codec::new();
        let envelope = Envelope {
            id: [7u8; 32],
            data: Some(b"ping".to_vec()),
            options: Options { oneway: false },
            error: None,
        };
        let bytes = codec.encode(&envelope).unwrap();
        let decoded = codec.decode(&bytes);
        assert_eq!(decoded.id, envelope.id);
        assert_eq!(decoded.data, Some(b"ping".to_vec()));
        assert_eq!(decoded.options.oneway, false);
    }

    #[test]
    fn invalid_bytes_decode_to_empty_envelope() {
        let codec: Codec<Vec<u8>> = Codec::new();
        let decoded = codec.decode(b"not cbor at all \xff\xfe");
        assert_eq!(decoded.id, [0u8; 32]);
        assert!(decoded.data.is_none());
    }

    #[test]
    fn error_field_roundtrips() {
        let codec: Codec<Vec<u8>> = Codec::new();
        let envelope = Envelope {
            id: [1u8; 32],
            data: None,
            options: Options::default(),
            error: Some(WireError {
                code: "ERR_SYSTEM".into(),
                message: "boom".into(),
            }),
        };
        let bytes = codec.encode(&envelope).unwrap();
        let decoded = codec.decode(&bytes);
        assert_eq!(decoded.error.unwrap().code, "ERR_SYSTEM");
    }
}
