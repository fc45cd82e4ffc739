//! Transport layer abstraction for Peerline.
//!
//! Defines the [`Transport`] trait that all transport implementations must
//! satisfy. The channel manager is the only consumer; any backend with this
//! shape — direct P2P, relay, or the in-process [`loopback`] hub — is a
//! valid substitute, and backend choice is a configuration decision rather
//! than a fork of the delivery logic.

pub mod loopback;

use peerline_proto::message::PeerName;

/// Opaque identifier for one end of an established transport connection.
///
/// Handles are allocated by the transport on `open` (locally initiated) or
/// reported in [`TransportEvent::Opened`] (remotely initiated). A handle is
/// dead after [`TransportEvent::Closed`] or [`Transport::close`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportHandle(u64);

impl TransportHandle {
    /// Creates a handle from a raw id. Intended for transport implementors.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw id.
    #[must_use]
    pub const fn raw(&self) -> u64 {
        self.0
    }
}

/// Errors that can occur during transport operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The specified peer is not reachable via this transport.
    #[error("peer {0} is unreachable")]
    Unreachable(PeerName),

    /// The transport-level handshake with the peer failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The connection has been closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// An underlying I/O error occurred.
    #[error("transport I/O error: {0}")]
    Io(String),
}

/// Events surfaced by a transport to its consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A remote peer opened a connection to us. Incoming connections are
    /// accepted opportunistically; the peer is the requester's declared
    /// identity as authenticated by the transport.
    Opened {
        /// The connecting peer.
        peer: PeerName,
        /// Handle for the new connection.
        handle: TransportHandle,
    },
    /// Bytes arrived on an established connection.
    Data {
        /// The connection the bytes arrived on.
        handle: TransportHandle,
        /// The raw (encrypted) payload bytes.
        bytes: Vec<u8>,
    },
    /// An established connection was closed by the remote side.
    Closed {
        /// The connection that closed.
        handle: TransportHandle,
    },
}

/// Async transport trait for carrying opaque encrypted payloads.
///
/// Implementations never inspect or modify payload bytes — encryption and
/// serialization happen at higher layers.
///
/// # Ordering
///
/// Implementations must deliver bytes in send order per handle. The
/// delivery layer does not reorder; an unordered backend would need its own
/// sequencing shim.
pub trait Transport: Send + Sync {
    /// Open a connection to the named peer, completing the transport-level
    /// handshake.
    ///
    /// Callers bound this with a timeout; dropping the returned future must
    /// release any partially established state.
    fn open(
        &self,
        peer: &PeerName,
    ) -> impl std::future::Future<Output = Result<TransportHandle, TransportError>> + Send;

    /// Send an encrypted payload on an established connection.
    fn send(
        &self,
        handle: TransportHandle,
        bytes: &[u8],
    ) -> impl std::future::Future<Output = Result<(), TransportError>> + Send;

    /// Wait for the next transport event.
    ///
    /// Returns `None` when the transport has shut down for good.
    fn next_event(&self) -> impl std::future::Future<Output = Option<TransportEvent>> + Send;

    /// Close an established connection. Idempotent; closing an unknown or
    /// already-closed handle is a no-op.
    fn close(&self, handle: TransportHandle) -> impl std::future::Future<Output = ()> + Send;
}
