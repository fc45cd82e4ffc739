//! Per-peer channel lifecycle management.
//!
//! A channel is the logical connection to one peer: absent (idle), being
//! established (connecting), or open. Failed and closed channels are
//! removed from the table rather than kept around — a later attempt builds
//! a fresh channel instead of resurrecting the old one, and handles from a
//! discarded channel are rejected by generation.
//!
//! Concurrent [`ChannelManager::connect`] calls for the same peer collapse
//! into a single transport handshake: the first caller leads the attempt
//! and every other caller awaits the shared result over a
//! [`tokio::sync::watch`] cell.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use peerline_proto::message::PeerName;

use crate::transport::{Transport, TransportError, TransportEvent, TransportHandle};

/// Errors from establishing a channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    /// The transport handshake did not complete within the configured
    /// timeout.
    #[error("connect timed out")]
    Timeout,

    /// The transport reported a failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors from sending on an established channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelSendError {
    /// The channel is gone, or the handle belongs to a discarded
    /// generation.
    #[error("channel is not open")]
    ChannelNotOpen,

    /// The transport send failed; the channel has been demoted.
    #[error(transparent)]
    Transport(TransportError),
}

/// A reference to an open channel.
///
/// The generation ties the handle to one specific channel instance; once
/// that instance fails or closes, the handle is rejected even if a new
/// channel to the same peer opens later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelHandle {
    peer: PeerName,
    transport: TransportHandle,
    generation: u64,
}

impl ChannelHandle {
    /// The peer this channel connects to.
    #[must_use]
    pub const fn peer(&self) -> &PeerName {
        &self.peer
    }
}

type ConnectResult = Result<ChannelHandle, ConnectError>;

enum ChannelSlot {
    /// An attempt is in flight; followers await the watch cell.
    Connecting {
        attempt: u64,
        result_rx: watch::Receiver<Option<ConnectResult>>,
    },
    Open(ChannelHandle),
}

/// Events emitted by the channel manager to the delivery layer.
///
/// Inbound data is tagged with the peer that owns the carrying channel —
/// the channel identity, never anything claimed inside the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A channel to this peer is now open (locally or remotely initiated).
    PeerOpened(PeerName),
    /// Bytes arrived from an open channel.
    Inbound {
        /// The peer owning the channel the bytes arrived on.
        from: PeerName,
        /// The raw envelope bytes.
        bytes: Vec<u8>,
    },
    /// The channel to this peer closed.
    PeerClosed(PeerName),
}

/// Manages the channel table and the transport event pump for one client.
pub struct ChannelManager<T: Transport> {
    transport: T,
    channels: parking_lot::Mutex<HashMap<PeerName, ChannelSlot>>,
    /// Open transport handle → owning peer, for tagging inbound data.
    routes: parking_lot::Mutex<HashMap<TransportHandle, PeerName>>,
    connect_timeout: Duration,
    next_generation: AtomicU64,
}

impl<T: Transport> ChannelManager<T> {
    /// Creates a manager over the given transport.
    #[must_use]
    pub fn new(transport: T, connect_timeout: Duration) -> Self {
        Self {
            transport,
            channels: parking_lot::Mutex::new(HashMap::new()),
            routes: parking_lot::Mutex::new(HashMap::new()),
            connect_timeout,
            next_generation: AtomicU64::new(1),
        }
    }

    /// Returns the handle for an open channel to `peer`, establishing one
    /// if needed.
    ///
    /// Idempotent: an already-open channel is returned as-is, and
    /// concurrent calls while an attempt is in flight all await that single
    /// attempt and observe its result.
    ///
    /// # Errors
    ///
    /// [`ConnectError::Timeout`] when the handshake exceeds the configured
    /// timeout (any partial transport state is released), or
    /// [`ConnectError::Transport`] when the transport refuses the
    /// connection.
    pub async fn connect(&self, peer: &PeerName) -> ConnectResult {
        loop {
            enum Action {
                Follow {
                    attempt: u64,
                    rx: watch::Receiver<Option<ConnectResult>>,
                },
                Lead {
                    attempt: u64,
                    tx: watch::Sender<Option<ConnectResult>>,
                },
            }

            let action = {
                let mut channels = self.channels.lock();
                match channels.get(peer) {
                    Some(ChannelSlot::Open(handle)) => return Ok(handle.clone()),
                    Some(ChannelSlot::Connecting { attempt, result_rx }) => Action::Follow {
                        attempt: *attempt,
                        rx: result_rx.clone(),
                    },
                    None => {
                        let attempt = self.next_generation.fetch_add(1, Ordering::Relaxed);
                        let (tx, rx) = watch::channel(None);
                        channels.insert(
                            peer.clone(),
                            ChannelSlot::Connecting {
                                attempt,
                                result_rx: rx,
                            },
                        );
                        Action::Lead { attempt, tx }
                    }
                }
            };

            match action {
                Action::Follow { attempt, mut rx } => loop {
                    if let Some(result) = rx.borrow_and_update().clone() {
                        return result;
                    }
                    if rx.changed().await.is_err() {
                        // The leading future was dropped mid-attempt. Clear
                        // its stale slot so the next iteration can lead a
                        // fresh attempt.
                        let mut channels = self.channels.lock();
                        if matches!(
                            channels.get(peer),
                            Some(ChannelSlot::Connecting { attempt: a, .. }) if *a == attempt
                        ) {
                            channels.remove(peer);
                        }
                        break;
                    }
                },
                Action::Lead { attempt, tx } => {
                    let result = self.attempt_open(peer, attempt).await;
                    let _ = tx.send(Some(result.clone()));
                    return result;
                }
            }
        }
    }

    /// Runs one bounded handshake attempt and settles the channel slot.
    async fn attempt_open(&self, peer: &PeerName, attempt: u64) -> ConnectResult {
        let outcome =
            match tokio::time::timeout(self.connect_timeout, self.transport.open(peer)).await {
                Err(_) => {
                    tracing::warn!(peer = %peer, "connect timed out");
                    Err(ConnectError::Timeout)
                }
                Ok(Err(error)) => {
                    tracing::warn!(peer = %peer, %error, "connect failed");
                    Err(ConnectError::Transport(error))
                }
                Ok(Ok(handle)) => Ok(handle),
            };

        let (result, orphaned) = {
            let mut channels = self.channels.lock();
            let still_ours = matches!(
                channels.get(peer),
                Some(ChannelSlot::Connecting { attempt: a, .. }) if *a == attempt
            );
            match outcome {
                Ok(transport_handle) if still_ours => {
                    let handle = ChannelHandle {
                        peer: peer.clone(),
                        transport: transport_handle,
                        generation: attempt,
                    };
                    channels.insert(peer.clone(), ChannelSlot::Open(handle.clone()));
                    self.routes.lock().insert(transport_handle, peer.clone());
                    (Ok(handle), None)
                }
                Ok(transport_handle) => {
                    // The slot was discarded mid-handshake (close or wipe);
                    // release the freshly opened connection.
                    (
                        Err(ConnectError::Transport(TransportError::ConnectionClosed)),
                        Some(transport_handle),
                    )
                }
                Err(error) => {
                    if still_ours {
                        channels.remove(peer);
                    }
                    (Err(error), None)
                }
            }
        };

        if let Some(handle) = orphaned {
            self.transport.close(handle).await;
        }
        if result.is_ok() {
            tracing::debug!(peer = %peer, "channel open");
        }
        result
    }

    /// Sends bytes on an open channel.
    ///
    /// # Errors
    ///
    /// [`ChannelSendError::ChannelNotOpen`] when the handle's channel is
    /// gone or superseded. A transport failure demotes the channel (the
    /// entry is removed) and surfaces as [`ChannelSendError::Transport`].
    pub async fn send_on(
        &self,
        handle: &ChannelHandle,
        bytes: &[u8],
    ) -> Result<(), ChannelSendError> {
        let transport_handle = {
            let channels = self.channels.lock();
            match channels.get(&handle.peer) {
                Some(ChannelSlot::Open(open)) if open.generation == handle.generation => {
                    open.transport
                }
                _ => return Err(ChannelSendError::ChannelNotOpen),
            }
        };

        match self.transport.send(transport_handle, bytes).await {
            Ok(()) => Ok(()),
            Err(error) => {
                tracing::warn!(peer = %handle.peer, %error, "send failed, demoting channel");
                self.remove_if_generation(&handle.peer, handle.generation);
                self.transport.close(transport_handle).await;
                Err(ChannelSendError::Transport(error))
            }
        }
    }

    /// Closes the channel to `peer`, if any. Idempotent.
    pub async fn close(&self, peer: &PeerName) {
        let transport_handle = {
            let mut channels = self.channels.lock();
            match channels.remove(peer) {
                Some(ChannelSlot::Open(handle)) => {
                    self.routes.lock().remove(&handle.transport);
                    Some(handle.transport)
                }
                // A connecting slot is simply discarded; attempt_open sees
                // the attempt id mismatch and releases its handle itself.
                Some(ChannelSlot::Connecting { .. }) | None => None,
            }
        };
        if let Some(handle) = transport_handle {
            self.transport.close(handle).await;
        }
    }

    /// Closes every channel and clears the table. Idempotent; safe while
    /// handshakes are in flight.
    pub async fn discard_all(&self) {
        let handles: Vec<TransportHandle> = {
            let mut channels = self.channels.lock();
            let mut routes = self.routes.lock();
            routes.clear();
            channels
                .drain()
                .filter_map(|(_, slot)| match slot {
                    ChannelSlot::Open(handle) => Some(handle.transport),
                    ChannelSlot::Connecting { .. } => None,
                })
                .collect()
        };
        for handle in handles {
            self.transport.close(handle).await;
        }
        tracing::debug!("all channels discarded");
    }

    fn remove_if_generation(&self, peer: &PeerName, generation: u64) {
        let mut channels = self.channels.lock();
        if let Some(ChannelSlot::Open(open)) = channels.get(peer) {
            if open.generation == generation {
                self.routes.lock().remove(&open.transport);
                channels.remove(peer);
            }
        }
    }

    /// Pumps transport events into [`ChannelEvent`]s until the transport or
    /// the consumer shuts down.
    ///
    /// Remotely initiated connections are accepted opportunistically: an
    /// inbound open for a peer we have no channel to becomes that peer's
    /// open channel; a duplicate inbound open while a channel already
    /// exists is closed.
    pub async fn run(self: Arc<Self>, events: mpsc::Sender<ChannelEvent>) {
        while let Some(event) = self.transport.next_event().await {
            match event {
                TransportEvent::Opened { peer, handle } => {
                    let accepted = {
                        let mut channels = self.channels.lock();
                        if channels.contains_key(&peer) {
                            false
                        } else {
                            let generation =
                                self.next_generation.fetch_add(1, Ordering::Relaxed);
                            channels.insert(
                                peer.clone(),
                                ChannelSlot::Open(ChannelHandle {
                                    peer: peer.clone(),
                                    transport: handle,
                                    generation,
                                }),
                            );
                            self.routes.lock().insert(handle, peer.clone());
                            true
                        }
                    };
                    if accepted {
                        tracing::debug!(peer = %peer, "inbound channel accepted");
                        if events.send(ChannelEvent::PeerOpened(peer)).await.is_err() {
                            break;
                        }
                    } else {
                        tracing::debug!(peer = %peer, "duplicate inbound channel refused");
                        self.transport.close(handle).await;
                    }
                }
                TransportEvent::Data { handle, bytes } => {
                    let from = self.routes.lock().get(&handle).cloned();
                    match from {
                        Some(from) => {
                            if events
                                .send(ChannelEvent::Inbound { from, bytes })
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        None => {
                            tracing::warn!(handle = handle.raw(), "data on unknown handle dropped");
                        }
                    }
                }
                TransportEvent::Closed { handle } => {
                    let peer = self.routes.lock().remove(&handle);
                    if let Some(peer) = peer {
                        {
                            let mut channels = self.channels.lock();
                            if matches!(
                                channels.get(&peer),
                                Some(ChannelSlot::Open(open)) if open.transport == handle
                            ) {
                                channels.remove(&peer);
                            }
                        }
                        tracing::debug!(peer = %peer, "channel closed by remote");
                        if events.send(ChannelEvent::PeerClosed(peer)).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        tracing::debug!("transport event pump stopped");
    }
}
