//! In-process loopback transport for testing.
//!
//! [`LoopbackHub`] simulates a network of named peers over
//! [`tokio::sync::mpsc`] channels. Each call to [`LoopbackHub::endpoint`]
//! registers a peer and returns a [`LoopbackEndpoint`] implementing
//! [`Transport`]; opening a connection from one endpoint to another
//! delivers an [`TransportEvent::Opened`] on the remote side and links the
//! two handles so sends on one arrive as data on the other.
//!
//! Test switches: [`LoopbackHub::set_unresponsive`] makes `open` toward a
//! peer hang forever (exercising connect timeouts) and
//! [`LoopbackHub::disconnect`] tears a peer down, emitting `Closed` events
//! to everyone it was linked with.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};

use peerline_proto::message::PeerName;

use super::{Transport, TransportError, TransportEvent, TransportHandle};

/// One direction of an established link.
#[derive(Debug, Clone)]
struct LinkEnd {
    /// The peer owning the handle this entry is keyed by.
    owner: PeerName,
    /// The peer on the other side.
    remote_owner: PeerName,
    /// The other side's handle.
    remote_handle: TransportHandle,
}

#[derive(Default)]
struct HubState {
    endpoints: HashMap<PeerName, mpsc::UnboundedSender<TransportEvent>>,
    links: HashMap<TransportHandle, LinkEnd>,
    unresponsive: HashSet<PeerName>,
    opens: HashMap<PeerName, usize>,
    next_handle: u64,
}

impl HubState {
    fn allocate_handle(&mut self) -> TransportHandle {
        self.next_handle += 1;
        TransportHandle::new(self.next_handle)
    }
}

/// A simulated network connecting any number of named loopback endpoints.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    state: Arc<parking_lot::Mutex<HubState>>,
}

impl LoopbackHub {
    /// Creates an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a peer and returns its transport endpoint.
    ///
    /// Registering the same name twice replaces the previous endpoint's
    /// event feed; the old endpoint stops receiving events.
    #[must_use]
    pub fn endpoint(&self, name: PeerName) -> LoopbackEndpoint {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().endpoints.insert(name.clone(), tx);
        LoopbackEndpoint {
            name,
            state: Arc::clone(&self.state),
            rx: Mutex::new(rx),
        }
    }

    /// Makes `open` attempts toward `peer` hang forever (or restores them).
    ///
    /// The hanging future allocates nothing, so dropping it on timeout
    /// leaves no partial state behind.
    pub fn set_unresponsive(&self, peer: &PeerName, unresponsive: bool) {
        let mut state = self.state.lock();
        if unresponsive {
            state.unresponsive.insert(peer.clone());
        } else {
            state.unresponsive.remove(peer);
        }
    }

    /// Returns how many `open` calls have completed toward `peer`.
    ///
    /// Used by tests to assert that concurrent connects collapse into a
    /// single handshake.
    #[must_use]
    pub fn open_count(&self, peer: &PeerName) -> usize {
        self.state.lock().opens.get(peer).copied().unwrap_or(0)
    }

    /// Tears down a peer: unregisters it and closes every link it owns,
    /// notifying the other side of each with a `Closed` event.
    pub fn disconnect(&self, peer: &PeerName) {
        let notifications = {
            let mut state = self.state.lock();
            state.endpoints.remove(peer);
            let owned: Vec<TransportHandle> = state
                .links
                .iter()
                .filter(|(_, end)| end.owner == *peer)
                .map(|(handle, _)| *handle)
                .collect();
            let mut notifications = Vec::new();
            for handle in owned {
                if let Some(end) = state.links.remove(&handle) {
                    state.links.remove(&end.remote_handle);
                    if let Some(tx) = state.endpoints.get(&end.remote_owner) {
                        notifications.push((tx.clone(), end.remote_handle));
                    }
                }
            }
            notifications
        };
        for (tx, handle) in notifications {
            let _ = tx.send(TransportEvent::Closed { handle });
        }
    }
}

/// A single peer's endpoint on a [`LoopbackHub`].
pub struct LoopbackEndpoint {
    name: PeerName,
    state: Arc<parking_lot::Mutex<HubState>>,
    rx: Mutex<mpsc::UnboundedReceiver<TransportEvent>>,
}

impl LoopbackEndpoint {
    /// The local peer name this endpoint was registered under.
    #[must_use]
    pub const fn local_name(&self) -> &PeerName {
        &self.name
    }
}

impl Transport for LoopbackEndpoint {
    async fn open(&self, peer: &PeerName) -> Result<TransportHandle, TransportError> {
        let hang = self.state.lock().unresponsive.contains(peer);
        if hang {
            // Simulates a handshake that never completes; the caller's
            // timeout is the only way out.
            std::future::pending::<()>().await;
        }

        let (remote_tx, local_handle, remote_handle) = {
            let mut state = self.state.lock();
            let Some(remote_tx) = state.endpoints.get(peer).cloned() else {
                return Err(TransportError::Unreachable(peer.clone()));
            };
            let local_handle = state.allocate_handle();
            let remote_handle = state.allocate_handle();
            state.links.insert(
                local_handle,
                LinkEnd {
                    owner: self.name.clone(),
                    remote_owner: peer.clone(),
                    remote_handle,
                },
            );
            state.links.insert(
                remote_handle,
                LinkEnd {
                    owner: peer.clone(),
                    remote_owner: self.name.clone(),
                    remote_handle: local_handle,
                },
            );
            *state.opens.entry(peer.clone()).or_insert(0) += 1;
            (remote_tx, local_handle, remote_handle)
        };

        if remote_tx
            .send(TransportEvent::Opened {
                peer: self.name.clone(),
                handle: remote_handle,
            })
            .is_err()
        {
            let mut state = self.state.lock();
            state.links.remove(&local_handle);
            state.links.remove(&remote_handle);
            return Err(TransportError::HandshakeFailed(format!(
                "peer {peer} dropped its endpoint"
            )));
        }

        Ok(local_handle)
    }

    async fn send(&self, handle: TransportHandle, bytes: &[u8]) -> Result<(), TransportError> {
        let (remote_tx, remote_handle) = {
            let state = self.state.lock();
            let Some(end) = state.links.get(&handle) else {
                return Err(TransportError::ConnectionClosed);
            };
            let Some(tx) = state.endpoints.get(&end.remote_owner).cloned() else {
                return Err(TransportError::ConnectionClosed);
            };
            (tx, end.remote_handle)
        };

        remote_tx
            .send(TransportEvent::Data {
                handle: remote_handle,
                bytes: bytes.to_vec(),
            })
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        self.rx.lock().await.recv().await
    }

    async fn close(&self, handle: TransportHandle) {
        let notification = {
            let mut state = self.state.lock();
            state.links.remove(&handle).and_then(|end| {
                state.links.remove(&end.remote_handle);
                state
                    .endpoints
                    .get(&end.remote_owner)
                    .cloned()
                    .map(|tx| (tx, end.remote_handle))
            })
        };
        if let Some((tx, remote_handle)) = notification {
            let _ = tx.send(TransportEvent::Closed {
                handle: remote_handle,
            });
        }
    }
}
