//! Identity registry.
//!
//! Maps normalized usernames to peer identities and their public keys. The
//! registry is the single authority for name→key resolution; it is shared
//! as an `Arc` and synchronized internally, so callers never hold a lock
//! across an await point.
//!
//! A peer that is addressed before it ever registered gets a synthesized
//! identity: a deterministic placeholder key derived from the name. That
//! placeholder is a trust decision deferred, not made — nothing sealed for
//! it can be opened until a verified key replaces it out of band.

use std::collections::HashMap;

use peerline_proto::message::PeerName;

use crate::crypto::keys::IdentityKey;

/// Errors returned by registry operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// The requested username already belongs to a different identity.
    #[error("username {0} is already taken")]
    NameTaken(PeerName),

    /// No identity is registered under the given username.
    #[error("no identity registered as {0}")]
    NotFound(PeerName),
}

/// A peer's profile as known to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Normalized username, the registry key.
    pub username: PeerName,
    /// Long-term public identity key. Immutable once registered; a rename
    /// carries it over unchanged.
    pub public_key: IdentityKey,
    /// Human-readable display name.
    pub display_name: String,
    /// Optional profile bio.
    pub bio: Option<String>,
    /// Optional opaque reference to an avatar resource.
    pub avatar_ref: Option<String>,
}

impl Identity {
    /// Creates a minimal identity with the display name defaulting to the
    /// username.
    #[must_use]
    pub fn new(username: PeerName, public_key: IdentityKey) -> Self {
        let display_name = username.as_str().to_owned();
        Self {
            username,
            public_key,
            display_name,
            bio: None,
            avatar_ref: None,
        }
    }
}

#[derive(Default)]
struct RegistryState {
    identities: HashMap<PeerName, Entry>,
    next_seq: u64,
}

struct Entry {
    /// Registration order, used to keep search results stable.
    seq: u64,
    identity: Identity,
}

/// Thread-safe username→identity store.
#[derive(Default)]
pub struct IdentityRegistry {
    state: parking_lot::Mutex<RegistryState>,
}

impl IdentityRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new identity.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NameTaken`] when the normalized username is
    /// already registered.
    pub fn register(&self, identity: Identity) -> Result<(), RegistryError> {
        let mut state = self.state.lock();
        if state.identities.contains_key(&identity.username) {
            return Err(RegistryError::NameTaken(identity.username));
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        tracing::debug!(username = %identity.username, "identity registered");
        state
            .identities
            .insert(identity.username.clone(), Entry { seq, identity });
        Ok(())
    }

    /// Renames an identity, atomically replacing its profile fields.
    ///
    /// The public key of the existing entry is carried over unchanged —
    /// a rename never rotates key material.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] when `old` is not registered, or
    /// [`RegistryError::NameTaken`] when the new username belongs to a
    /// different identity. Renaming to the same name updates the profile in
    /// place.
    pub fn rename(&self, old: &PeerName, new: Identity) -> Result<(), RegistryError> {
        let mut state = self.state.lock();
        if !state.identities.contains_key(old) {
            return Err(RegistryError::NotFound(old.clone()));
        }
        if new.username != *old && state.identities.contains_key(&new.username) {
            return Err(RegistryError::NameTaken(new.username));
        }
        // Checked above, but avoid panicking on a racing wipe.
        let Some(entry) = state.identities.remove(old) else {
            return Err(RegistryError::NotFound(old.clone()));
        };
        let replacement = Identity {
            public_key: entry.identity.public_key,
            ..new
        };
        tracing::debug!(old = %old, new = %replacement.username, "identity renamed");
        state.identities.insert(
            replacement.username.clone(),
            Entry {
                seq: entry.seq,
                identity: replacement,
            },
        );
        Ok(())
    }

    /// Looks up an identity by exact normalized username.
    #[must_use]
    pub fn find(&self, username: &PeerName) -> Option<Identity> {
        self.state
            .lock()
            .identities
            .get(username)
            .map(|entry| entry.identity.clone())
    }

    /// Looks up an identity, synthesizing and registering a placeholder if
    /// the name is unknown.
    ///
    /// The synthesized key is deterministic in the name, and the placeholder
    /// is stored, so a second call returns the identical identity.
    #[must_use]
    pub fn find_or_synthesize(&self, username: &PeerName) -> Identity {
        let mut state = self.state.lock();
        if let Some(entry) = state.identities.get(username) {
            return entry.identity.clone();
        }
        let identity = Identity::new(username.clone(), IdentityKey::synthesize(username));
        let seq = state.next_seq;
        state.next_seq += 1;
        tracing::debug!(username = %username, "identity synthesized");
        state.identities.insert(
            username.clone(),
            Entry {
                seq,
                identity: identity.clone(),
            },
        );
        identity
    }

    /// Case-insensitive substring search over usernames, in registration
    /// order.
    #[must_use]
    pub fn search(&self, query: &str) -> Vec<Identity> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }
        let state = self.state.lock();
        let mut hits: Vec<&Entry> = state
            .identities
            .values()
            .filter(|entry| entry.identity.username.as_str().contains(&needle))
            .collect();
        hits.sort_by_key(|entry| entry.seq);
        hits.into_iter().map(|entry| entry.identity.clone()).collect()
    }

    /// Number of registered identities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().identities.len()
    }

    /// Whether the registry holds no identities.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().identities.is_empty()
    }

    /// Removes every identity. Part of the account wipe path; idempotent.
    pub fn wipe(&self) {
        let mut state = self.state.lock();
        let count = state.identities.len();
        state.identities.clear();
        tracing::info!(count, "registry wiped");
    }
}
