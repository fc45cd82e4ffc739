//! Mailbox-style delivery fallback.
//!
//! When no direct channel can be established, a deployment may run a
//! mailbox service that holds sealed envelopes until the recipient fetches
//! them. The [`Inbox`] trait is that service's client-side shape; the
//! delivery coordinator polls it and feeds every fetched payload through
//! the same decode/dedup/decrypt pipeline as directly received bytes, so
//! mailbox delivery needs no special-casing anywhere downstream.

use std::collections::{HashMap, VecDeque};

use tokio::sync::RwLock;

use peerline_proto::message::PeerName;

/// One envelope waiting in a mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboxEntry {
    /// The peer that deposited the envelope.
    pub sender: PeerName,
    /// The sealed envelope bytes, exactly as they would arrive on a
    /// channel.
    pub bytes: Vec<u8>,
}

/// A store-and-forward mailbox holding envelopes for offline recipients.
pub trait Inbox: Send + Sync {
    /// Deposits an envelope for a recipient.
    fn deposit(
        &self,
        recipient: &PeerName,
        entry: InboxEntry,
    ) -> impl std::future::Future<Output = ()> + Send;

    /// Fetches and removes all envelopes waiting for a recipient.
    fn fetch(
        &self,
        recipient: &PeerName,
    ) -> impl std::future::Future<Output = Vec<InboxEntry>> + Send;
}

/// In-memory mailbox with a bounded per-recipient backlog.
///
/// When a recipient's backlog is full the oldest envelope is evicted —
/// old undelivered traffic gives way to new.
pub struct InMemoryInbox {
    entries: RwLock<HashMap<PeerName, VecDeque<InboxEntry>>>,
    max_per_recipient: usize,
}

impl InMemoryInbox {
    /// Creates an inbox holding at most `max_per_recipient` envelopes per
    /// recipient.
    #[must_use]
    pub fn new(max_per_recipient: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_per_recipient,
        }
    }

    /// Number of envelopes waiting for a recipient.
    pub async fn backlog(&self, recipient: &PeerName) -> usize {
        self.entries
            .read()
            .await
            .get(recipient)
            .map_or(0, VecDeque::len)
    }
}

impl Inbox for InMemoryInbox {
    async fn deposit(&self, recipient: &PeerName, entry: InboxEntry) {
        let mut entries = self.entries.write().await;
        let queue = entries.entry(recipient.clone()).or_default();
        if queue.len() >= self.max_per_recipient {
            queue.pop_front();
            tracing::warn!(recipient = %recipient, "inbox full, oldest envelope evicted");
        }
        queue.push_back(entry);
    }

    async fn fetch(&self, recipient: &PeerName) -> Vec<InboxEntry> {
        self.entries
            .write()
            .await
            .remove(recipient)
            .map(Vec::from)
            .unwrap_or_default()
    }
}
