//! Call-invitation signals.
//!
//! Call signals are ephemeral control-plane messages: they are delivered
//! directly over an open channel, never queued for store-and-forward, never
//! retried, and never deduplicated. A missed real-time invitation is not
//! worth deferring.

use serde::{Deserialize, Serialize};

use crate::message::PeerName;

/// The media kind of a call invitation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallKind {
    /// Audio-only call.
    Audio,
    /// Audio + video call.
    Video,
}

impl std::fmt::Display for CallKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
        }
    }
}

/// A call invitation from a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSignal {
    /// Whether the caller wants audio or video.
    pub kind: CallKind,
    /// Username of the inviting peer.
    ///
    /// On receive this field is overwritten with the channel's
    /// authenticated peer identity before dispatch, so a spoofed value
    /// never reaches the consumer.
    pub from: PeerName,
}
