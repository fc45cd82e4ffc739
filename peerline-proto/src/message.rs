//! Wire format message types for the Peerline protocol.
//!
//! All types in this module represent the on-the-wire format for messages
//! exchanged between Peerline peers. Message bodies are encrypted before
//! transmission; delivery metadata (id, sender, recipient, timestamp) stays
//! in the clear so duplicate suppression and sentinel substitution work even
//! when decryption fails.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum allowed plaintext body size in bytes (64 KB).
pub const MAX_BODY_SIZE: usize = 64 * 1024;

/// Length of a public-key fingerprint prefix in bytes.
pub const FINGERPRINT_LEN: usize = 8;

/// A case-normalized username used to address a peer.
///
/// Usernames are trimmed and lowercased on construction, so two spellings
/// of the same name always map to the same channel, queue, and registry
/// entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerName(String);

impl PeerName {
    /// Creates a peer name, trimming whitespace and lowercasing.
    #[must_use]
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_lowercase())
    }

    /// Returns the normalized name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` if the normalized name is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for PeerName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerName {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

/// Unique identifier for a message, based on UUID v7 for time-ordering.
///
/// Generated on the sending side; practically unique across all senders,
/// which is what makes receiver-side duplicate suppression safe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Creates a new time-ordered message identifier (UUID v7).
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a `MessageId` from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner UUID value.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Millisecond-precision UTC timestamp.
///
/// Monotonically non-decreasing per sender; used for UI ordering only,
/// never for protocol correctness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Advisory delivery lifecycle of a message.
///
/// Set by the receiver/consumer for UI feedback. There is no remote ack
/// primitive, so these states are never verified end-to-end and never
/// consulted for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryState {
    /// Message handed off to a channel or queued for forwarding.
    Sent,
    /// Recipient's client reports the message arrived.
    Delivered,
    /// Recipient's client reports the message was read.
    Read,
}

/// An encrypted message body bound to the recipient key it targets.
///
/// The fingerprint prefix identifies which session key the ciphertext was
/// sealed for, so a decrypt attempt against the wrong session is detected
/// rather than silently garbled. The `nonce` is the sender's ratchet
/// position at seal time; the `tag` is a keyed integrity check over the
/// ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedPayload {
    /// Fingerprint of the recipient public key this payload targets.
    pub fingerprint: [u8; FINGERPRINT_LEN],
    /// Sender ratchet position used to derive the keystream.
    pub nonce: u64,
    /// The encrypted body bytes.
    pub ciphertext: Vec<u8>,
    /// Keyed integrity tag over the ciphertext.
    pub tag: [u8; 32],
}

/// A complete message as it travels on the wire.
///
/// Metadata is cleartext; only `payload` is encrypted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedMessage {
    /// Unique identifier, immutable once assigned.
    pub id: MessageId,
    /// Username of the sending peer.
    pub sender: PeerName,
    /// Username of the receiving peer.
    pub recipient: PeerName,
    /// When the sender created the message.
    pub timestamp: Timestamp,
    /// The encrypted body.
    pub payload: SealedPayload,
}

/// Error returned when an outbound message fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Message body is empty.
    #[error("message body is empty")]
    Empty,
    /// Message body exceeds the maximum allowed size.
    #[error("message too large ({size} bytes, max {max} bytes)")]
    TooLarge {
        /// Actual size of the body in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
}

/// Validates a plaintext body before sealing.
///
/// # Errors
///
/// Returns [`ValidationError::Empty`] for an empty body, or
/// [`ValidationError::TooLarge`] if it exceeds [`MAX_BODY_SIZE`].
pub const fn validate_body(body: &str) -> Result<(), ValidationError> {
    if body.is_empty() {
        return Err(ValidationError::Empty);
    }
    let size = body.len();
    if size > MAX_BODY_SIZE {
        return Err(ValidationError::TooLarge {
            size,
            max: MAX_BODY_SIZE,
        });
    }
    Ok(())
}

/// Top-level envelope wrapping all wire-level protocol messages.
///
/// Every unit on the wire is an `Envelope`, so the receiver can determine
/// the message type before further processing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Envelope {
    /// A sealed chat message from one peer to another.
    Message(SealedMessage),
    /// An ephemeral call-invitation signal.
    Call(crate::call::CallSignal),
}
