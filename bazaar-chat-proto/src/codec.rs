//! Postcard encoding for chat payloads and direct messages.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::message::{ChatPayload, DirectMessage};

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    postcard::to_allocvec(value).map_err(|e| CodecError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    postcard::from_bytes(bytes).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Encodes a [`ChatPayload`] into the body of a chat direct message.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the payload cannot be serialized.
pub fn encode_payload(payload: &ChatPayload) -> Result<Vec<u8>, CodecError> {
    encode(payload)
}

/// Decodes a [`ChatPayload`] from the body of a chat direct message.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the bytes are not a valid payload.
pub fn decode_payload(bytes: &[u8]) -> Result<ChatPayload, CodecError> {
    decode(bytes)
}

/// Encodes a whole [`DirectMessage`] for a byte-oriented transport.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the message cannot be serialized.
pub fn encode_direct(message: &DirectMessage) -> Result<Vec<u8>, CodecError> {
    encode(message)
}

/// Decodes a [`DirectMessage`] received from a byte-oriented transport.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the bytes cannot be deserialized.
pub fn decode_direct(bytes: &[u8]) -> Result<DirectMessage, CodecError> {
    decode(bytes)
}
