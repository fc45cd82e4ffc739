//! Session encryption layer for Peerline.
//!
//! The seal/open boundary in [`session`] is the only place plaintext
//! message bodies exist — everything handed to a channel has already been
//! sealed, and everything received is opened (or sentinel-substituted)
//! before the consumer sees it. Key material lives in [`keys`] and is
//! destroyed via [`session::SessionStore::wipe_all_local_key_material`].

pub mod keys;
pub mod session;

/// Errors that can occur during cryptographic operations.
///
/// These are always returned as typed results, never raised as faults: a
/// failed decrypt downgrades the affected message to a sentinel body
/// instead of aborting the delivery pipeline.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    /// The payload is corrupted: integrity tag mismatch or invalid UTF-8
    /// after decryption.
    #[error("malformed payload")]
    Malformed,

    /// The payload was sealed for a different recipient key.
    #[error("payload targets a different session key")]
    KeyMismatch,

    /// All local key material has been wiped; no session is usable.
    #[error("key material wiped")]
    SessionWiped,
}
