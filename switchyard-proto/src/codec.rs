//! Serialization for frames and exchange items.
//!
//! Everything on the wire is postcard: whole [`Frame`]s at the transport
//! level, and [`MessageEnvelope`]s or status strings inside `Payload` data.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::envelope::MessageEnvelope;
use crate::frame::Frame;

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Encodes any serializable value using postcard.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the value cannot be serialized.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    postcard::to_allocvec(value).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a value from a postcard byte slice.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the bytes cannot be deserialized.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    postcard::from_bytes(bytes).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Encodes a [`Frame`] for a single WebSocket binary message.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the frame cannot be serialized.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, CodecError> {
    encode(frame)
}

/// Decodes a [`Frame`] from a WebSocket binary message.
///
/// # Errors
///
/// Returns `CodecError::Serialization` on malformed input.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, CodecError> {
    decode(bytes)
}

/// Encodes a [`MessageEnvelope`] as exchange payload data.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the envelope cannot be serialized.
pub fn encode_envelope(envelope: &MessageEnvelope) -> Result<Vec<u8>, CodecError> {
    encode(envelope)
}

/// Decodes a [`MessageEnvelope`] from exchange payload data.
///
/// # Errors
///
/// Returns `CodecError::Serialization` on malformed input.
pub fn decode_envelope(bytes: &[u8]) -> Result<MessageEnvelope, CodecError> {
    decode(bytes)
}
