//! Message delivery coordination.
//!
//! [`DeliveryCoordinator`] is the surface the application talks to: it
//! resolves recipients against the registry, seals bodies through the
//! session layer, routes over channels, and falls back to per-peer pending
//! queues when a peer is unreachable. Inbound traffic flows the opposite
//! way through one pipeline — decode, dedup, decrypt — whether it arrived
//! on a live channel or from a polled mailbox.
//!
//! Delivery guarantee: at least once on the wire, at most once to the
//! consumer per message id. Send failures degrade to queueing, decrypt
//! failures degrade to a sentinel body; neither path crashes or drops the
//! pipeline.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::mpsc;

use peerline_proto::call::{CallKind, CallSignal};
use peerline_proto::codec::{self, CodecError};
use peerline_proto::message::{
    DeliveryState, Envelope, MessageId, PeerName, SealedMessage, Timestamp, ValidationError,
    validate_body,
};

use crate::channel::{ChannelEvent, ChannelHandle, ChannelManager};
use crate::config::CoreConfig;
use crate::crypto::CryptoError;
use crate::crypto::keys::IdentityKeys;
use crate::crypto::session::SessionStore;
use crate::inbox::Inbox;
use crate::registry::{Identity, IdentityRegistry};
use crate::transport::Transport;

/// Body substituted for a message whose payload cannot be decrypted.
pub const SECURE_CONTENT: &str = "[Secure Content]";

/// How a send concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The message went out over an open channel.
    Delivered,
    /// The peer was unreachable; the message waits in the pending queue.
    Queued,
}

/// Errors from [`DeliveryCoordinator::send_message`].
///
/// Transport trouble is not among them — an unreachable peer degrades to
/// [`SendOutcome::Queued`] rather than an error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The recipient query matched nothing and was too short to treat as a
    /// literal username.
    #[error("no peer matches {0:?}")]
    UnknownPeer(String),

    /// The message body failed validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The envelope could not be serialized.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The session layer refused to seal (for example after a wipe).
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// A decrypted (or sentinel-substituted) message handed to the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// The sender's message id.
    pub id: MessageId,
    /// The peer the carrying channel belongs to. Channel identity, never
    /// the sender field claimed inside the payload.
    pub from: PeerName,
    /// Sender-side creation time.
    pub timestamp: Timestamp,
    /// The plaintext body, or [`SECURE_CONTENT`] when decryption failed.
    pub body: String,
    /// `false` when `body` is the sentinel.
    pub readable: bool,
}

/// Orchestrates resolution, sealing, channel routing, queueing, and the
/// inbound pipeline.
pub struct DeliveryCoordinator<T: Transport> {
    registry: Arc<IdentityRegistry>,
    channels: Arc<ChannelManager<T>>,
    sessions: parking_lot::Mutex<SessionStore>,
    local: PeerName,
    /// Per-peer FIFO queues of sealed messages awaiting a channel. The lock
    /// is held across drain-then-send so queued traffic always precedes a
    /// newer message to the same peer.
    pending: tokio::sync::Mutex<HashMap<PeerName, VecDeque<SealedMessage>>>,
    /// Message ids already handed to the consumer.
    seen: tokio::sync::Mutex<HashSet<MessageId>>,
    /// Advisory per-message delivery states. Bounded the same way as the
    /// seen-set: cleared at the cap rather than grown.
    statuses: tokio::sync::Mutex<HashMap<MessageId, DeliveryState>>,
    message_tx: mpsc::Sender<InboundMessage>,
    call_tx: mpsc::Sender<CallSignal>,
    config: CoreConfig,
}

impl<T: Transport + 'static> DeliveryCoordinator<T> {
    /// Builds a fully wired coordinator: registers the local identity,
    /// spawns the transport event pump and the inbound loop, and returns
    /// the consumer ends of the message and call queues.
    #[must_use]
    pub fn spawn(
        local: PeerName,
        keys: IdentityKeys,
        transport: T,
        config: CoreConfig,
    ) -> (
        Arc<Self>,
        mpsc::Receiver<InboundMessage>,
        mpsc::Receiver<CallSignal>,
    ) {
        Self::spawn_with_registry(Arc::new(IdentityRegistry::new()), local, keys, transport, config)
    }

    /// As [`spawn`](Self::spawn) but over an externally owned registry, so
    /// a deployment backed by a shared identity store (or a test fake) can
    /// inject it instead of letting the coordinator build its own.
    #[must_use]
    pub fn spawn_with_registry(
        registry: Arc<IdentityRegistry>,
        local: PeerName,
        keys: IdentityKeys,
        transport: T,
        config: CoreConfig,
    ) -> (
        Arc<Self>,
        mpsc::Receiver<InboundMessage>,
        mpsc::Receiver<CallSignal>,
    ) {
        if let Err(error) = registry.register(Identity::new(local.clone(), keys.public().clone()))
        {
            tracing::warn!(%error, "local identity registration failed");
        }

        let channels = Arc::new(ChannelManager::new(transport, config.connect_timeout));
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer);
        let (message_tx, message_rx) = mpsc::channel(config.message_buffer);
        let (call_tx, call_rx) = mpsc::channel(config.call_buffer);

        let coordinator = Arc::new(Self {
            registry,
            channels: Arc::clone(&channels),
            sessions: parking_lot::Mutex::new(SessionStore::new(keys)),
            local,
            pending: tokio::sync::Mutex::new(HashMap::new()),
            seen: tokio::sync::Mutex::new(HashSet::new()),
            statuses: tokio::sync::Mutex::new(HashMap::new()),
            message_tx,
            call_tx,
            config,
        });

        tokio::spawn(channels.run(event_tx));
        tokio::spawn(Arc::clone(&coordinator).run(event_rx));
        (coordinator, message_rx, call_rx)
    }

    /// Spawns a task polling the mailbox on the configured interval.
    #[must_use]
    pub fn spawn_inbox_poller<I>(self: &Arc<Self>, inbox: Arc<I>) -> tokio::task::JoinHandle<()>
    where
        I: Inbox + 'static,
    {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(coordinator.config.inbox_poll_interval);
            loop {
                ticker.tick().await;
                coordinator.poll_inbox(inbox.as_ref()).await;
            }
        })
    }
}

impl<T: Transport> DeliveryCoordinator<T> {
    /// The local username.
    #[must_use]
    pub const fn local_name(&self) -> &PeerName {
        &self.local
    }

    /// The shared identity registry, for profile management.
    #[must_use]
    pub fn registry(&self) -> &Arc<IdentityRegistry> {
        &self.registry
    }

    /// Sends a message to whichever peer the query resolves to.
    ///
    /// Resolution tries an exact username match, then the first search hit,
    /// then — for queries of three or more characters — treats the query as
    /// a literal username with a synthesized identity.
    ///
    /// The message is sealed before any routing decision, so plaintext
    /// never waits in a queue. If the channel opens, the peer's queued
    /// backlog is drained first and this message follows it; if the peer is
    /// unreachable, the sealed message is queued and the outcome is
    /// [`SendOutcome::Queued`].
    ///
    /// # Errors
    ///
    /// [`SendError::UnknownPeer`] when resolution fails, or a validation,
    /// codec, or crypto error from preparing the message.
    pub async fn send_message(
        &self,
        recipient_query: &str,
        body: &str,
    ) -> Result<(MessageId, SendOutcome), SendError> {
        validate_body(body)?;
        let recipient = self
            .resolve_peer(recipient_query)
            .ok_or_else(|| SendError::UnknownPeer(recipient_query.to_owned()))?;

        let payload =
            self.sessions
                .lock()
                .seal_for(&recipient.username, &recipient.public_key, body)?;
        let message = SealedMessage {
            id: MessageId::new(),
            sender: self.local.clone(),
            recipient: recipient.username.clone(),
            timestamp: Timestamp::now(),
            payload,
        };
        let id = message.id.clone();
        self.record_status(id.clone(), DeliveryState::Sent).await;

        let outcome = match self.channels.connect(&recipient.username).await {
            Ok(handle) => {
                let mut pending = self.pending.lock().await;
                if self
                    .drain_queue(&mut pending, &recipient.username, &handle)
                    .await
                {
                    let bytes = codec::encode(&Envelope::Message(message.clone()))?;
                    if self.channels.send_on(&handle, &bytes).await.is_ok() {
                        SendOutcome::Delivered
                    } else {
                        Self::enqueue(
                            &mut pending,
                            message,
                            self.config.max_pending_per_peer,
                        );
                        SendOutcome::Queued
                    }
                } else {
                    // The backlog did not fully drain; keep FIFO order by
                    // queueing behind it.
                    Self::enqueue(&mut pending, message, self.config.max_pending_per_peer);
                    SendOutcome::Queued
                }
            }
            Err(error) => {
                tracing::debug!(peer = %recipient.username, %error, "peer unreachable, queueing");
                let mut pending = self.pending.lock().await;
                Self::enqueue(&mut pending, message, self.config.max_pending_per_peer);
                SendOutcome::Queued
            }
        };

        tracing::debug!(peer = %recipient.username, id = %id, ?outcome, "message sent");
        Ok((id, outcome))
    }

    /// Sends a call invitation over an existing-or-new channel.
    ///
    /// Call signals are ephemeral: a signal that cannot be delivered right
    /// now is dropped with a log line, never queued.
    ///
    /// # Errors
    ///
    /// Only [`SendError::UnknownPeer`] when the query resolves to nothing;
    /// delivery failures are not errors.
    pub async fn signal_call(&self, peer_query: &str, kind: CallKind) -> Result<(), SendError> {
        let recipient = self
            .resolve_peer(peer_query)
            .ok_or_else(|| SendError::UnknownPeer(peer_query.to_owned()))?;

        let signal = CallSignal {
            kind,
            from: self.local.clone(),
        };
        let Ok(bytes) = codec::encode(&Envelope::Call(signal)) else {
            tracing::warn!(peer = %recipient.username, "call signal encode failed, dropped");
            return Ok(());
        };
        match self.channels.connect(&recipient.username).await {
            Ok(handle) => {
                // Connecting for the call may have just opened the channel;
                // queued messages go out ahead of the invitation.
                {
                    let mut pending = self.pending.lock().await;
                    let _ = self
                        .drain_queue(&mut pending, &recipient.username, &handle)
                        .await;
                }
                if let Err(error) = self.channels.send_on(&handle, &bytes).await {
                    tracing::warn!(peer = %recipient.username, %error, "call signal dropped");
                }
            }
            Err(error) => {
                tracing::warn!(peer = %recipient.username, %error, "call signal dropped");
            }
        }
        Ok(())
    }

    /// Consumes channel events until the manager shuts down.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<ChannelEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                ChannelEvent::PeerOpened(peer) => {
                    self.flush_pending(&peer).await;
                }
                ChannelEvent::Inbound { from, bytes } => {
                    self.receive(&bytes, &from).await;
                }
                ChannelEvent::PeerClosed(peer) => {
                    tracing::debug!(peer = %peer, "channel closed");
                }
            }
        }
        tracing::debug!("delivery loop stopped");
    }

    /// Feeds one raw envelope through the inbound pipeline.
    ///
    /// `from` is the authenticated channel (or mailbox) identity of the
    /// sender; any sender claimed inside the envelope is ignored.
    pub async fn receive(&self, bytes: &[u8], from: &PeerName) {
        let envelope = match codec::decode(bytes) {
            Ok(envelope) => envelope,
            Err(error) => {
                tracing::warn!(from = %from, %error, "undecodable envelope dropped");
                return;
            }
        };
        match envelope {
            Envelope::Call(mut signal) => {
                signal.from = from.clone();
                if self.call_tx.send(signal).await.is_err() {
                    tracing::debug!("call consumer gone, signal dropped");
                }
            }
            Envelope::Message(message) => {
                if !self.first_sighting(&message.id).await {
                    tracing::debug!(id = %message.id, "duplicate message suppressed");
                    return;
                }
                let sender = self.registry.find_or_synthesize(from);
                let opened =
                    self.sessions
                        .lock()
                        .open_from(from, &sender.public_key, &message.payload);
                let (body, readable) = match opened {
                    Ok(text) => (text, true),
                    Err(error) => {
                        tracing::warn!(from = %from, id = %message.id, %error,
                            "decrypt failed, substituting sentinel");
                        (SECURE_CONTENT.to_owned(), false)
                    }
                };
                self.record_status(message.id.clone(), DeliveryState::Delivered)
                    .await;
                let inbound = InboundMessage {
                    id: message.id,
                    from: from.clone(),
                    timestamp: message.timestamp,
                    body,
                    readable,
                };
                if self.message_tx.send(inbound).await.is_err() {
                    tracing::debug!("message consumer gone, message dropped");
                }
            }
        }
    }

    /// Fetches everything waiting in the mailbox and runs each envelope
    /// through the normal inbound pipeline.
    pub async fn poll_inbox<I: Inbox>(&self, inbox: &I) {
        let entries = inbox.fetch(&self.local).await;
        if !entries.is_empty() {
            tracing::debug!(count = entries.len(), "inbox entries fetched");
        }
        for entry in entries {
            self.receive(&entry.bytes, &entry.sender).await;
        }
    }

    /// Marks a sent message as delivered (advisory).
    pub async fn mark_delivered(&self, id: &MessageId) {
        self.record_status(id.clone(), DeliveryState::Delivered).await;
    }

    /// Marks a message as read (advisory).
    pub async fn mark_read(&self, id: &MessageId) {
        self.record_status(id.clone(), DeliveryState::Read).await;
    }

    /// The advisory delivery state of a message, if tracked.
    pub async fn delivery_state(&self, id: &MessageId) -> Option<DeliveryState> {
        self.statuses.lock().await.get(id).copied()
    }

    /// Number of messages queued for an unreachable peer.
    pub async fn pending_count(&self, peer: &PeerName) -> usize {
        self.pending
            .lock()
            .await
            .get(peer)
            .map_or(0, VecDeque::len)
    }

    /// Destroys the account's local state: key material, channels, queues,
    /// dedup tracking, and the registry.
    ///
    /// Best-effort and idempotent; safe while handshakes are in flight.
    /// After the wipe, previously valid payloads can never be decrypted.
    pub async fn wipe(&self) {
        self.sessions.lock().wipe_all_local_key_material();
        self.channels.discard_all().await;
        self.pending.lock().await.clear();
        self.seen.lock().await.clear();
        self.statuses.lock().await.clear();
        self.registry.wipe();
        tracing::info!("account wiped");
    }

    /// Resolution policy: exact match, first search hit, then a
    /// synthesized identity for queries long enough to be a plausible
    /// username.
    fn resolve_peer(&self, query: &str) -> Option<Identity> {
        let name = PeerName::new(query);
        if name.is_empty() {
            return None;
        }
        if let Some(identity) = self.registry.find(&name) {
            return Some(identity);
        }
        if let Some(first) = self.registry.search(name.as_str()).into_iter().next() {
            return Some(first);
        }
        if name.as_str().chars().count() >= 3 {
            return Some(self.registry.find_or_synthesize(&name));
        }
        None
    }

    /// Appends a sealed message to the peer's queue, evicting the oldest at
    /// the cap.
    fn enqueue(
        pending: &mut HashMap<PeerName, VecDeque<SealedMessage>>,
        message: SealedMessage,
        cap: usize,
    ) {
        let queue = pending.entry(message.recipient.clone()).or_default();
        if queue.len() >= cap {
            tracing::warn!(peer = %message.recipient, "pending queue full, oldest evicted");
            queue.pop_front();
        }
        queue.push_back(message);
    }

    /// Sends the peer's queued backlog oldest-first. Returns `true` when
    /// the queue fully drained; on a send failure the unsent remainder
    /// (including the failed message) stays queued.
    async fn drain_queue(
        &self,
        pending: &mut HashMap<PeerName, VecDeque<SealedMessage>>,
        peer: &PeerName,
        handle: &ChannelHandle,
    ) -> bool {
        let Some(queue) = pending.get_mut(peer) else {
            return true;
        };
        while let Some(message) = queue.front() {
            let bytes = match codec::encode(&Envelope::Message(message.clone())) {
                Ok(bytes) => bytes,
                Err(error) => {
                    tracing::warn!(peer = %peer, %error, "unencodable queued message discarded");
                    queue.pop_front();
                    continue;
                }
            };
            if self.channels.send_on(handle, &bytes).await.is_err() {
                tracing::debug!(peer = %peer, remaining = queue.len(), "drain interrupted");
                return false;
            }
            queue.pop_front();
        }
        pending.remove(peer);
        tracing::debug!(peer = %peer, "pending queue drained");
        true
    }

    /// Drains the peer's backlog over its (now open) channel.
    async fn flush_pending(&self, peer: &PeerName) {
        let mut pending = self.pending.lock().await;
        if pending.get(peer).is_none_or(VecDeque::is_empty) {
            return;
        }
        match self.channels.connect(peer).await {
            Ok(handle) => {
                let _ = self.drain_queue(&mut pending, peer, &handle).await;
            }
            Err(error) => {
                tracing::debug!(peer = %peer, %error, "flush deferred, peer unreachable");
            }
        }
    }

    /// Records an advisory delivery state. The map is bounded; when a new
    /// id would push it past the cap, the map is cleared first.
    async fn record_status(&self, id: MessageId, state: DeliveryState) {
        let mut statuses = self.statuses.lock().await;
        if !statuses.contains_key(&id) && statuses.len() >= self.config.max_duplicate_tracking {
            tracing::warn!(
                cap = self.config.max_duplicate_tracking,
                "status tracking at capacity, resetting"
            );
            statuses.clear();
        }
        statuses.insert(id, state);
    }

    /// Records a message id, reporting whether it was new. The tracking set
    /// is bounded; at the cap it is cleared rather than grown.
    async fn first_sighting(&self, id: &MessageId) -> bool {
        let mut seen = self.seen.lock().await;
        if seen.contains(id) {
            return false;
        }
        if seen.len() >= self.config.max_duplicate_tracking {
            tracing::warn!(
                cap = self.config.max_duplicate_tracking,
                "duplicate tracking at capacity, resetting"
            );
            seen.clear();
        }
        seen.insert(id.clone());
        true
    }
}
