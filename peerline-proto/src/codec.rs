//! Serialization and deserialization for the Peerline wire protocol.
//!
//! Provides encode/decode functions using postcard. The transport layer
//! carries these bytes opaquely; encryption of message bodies happens
//! before encoding, in the crypto session layer.

use crate::message::Envelope;

/// Error type for codec encode/decode operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Encodes an [`Envelope`] into a byte vector using postcard.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the envelope cannot be serialized.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
    postcard::to_allocvec(envelope).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes an [`Envelope`] from a byte slice using postcard.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the bytes cannot be deserialized.
pub fn decode(bytes: &[u8]) -> Result<Envelope, CodecError> {
    postcard::from_bytes(bytes).map_err(|e| CodecError::Serialization(e.to_string()))
}
