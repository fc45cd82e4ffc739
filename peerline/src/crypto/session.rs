//! Per-peer encryption sessions.
//!
//! A [`SessionState`] holds the derived key and explicit ratchet counters
//! for one peer; every seal/open operation takes the state mutably and
//! advances it, so a real ratcheting scheme can replace the keystream
//! derivation without touching any caller. The [`SessionStore`] owns all
//! per-peer states plus the local identity keypair and is the single
//! target of [`SessionStore::wipe_all_local_key_material`].
//!
//! The cipher here is a keyed keystream with an integrity tag — shaped
//! like an AEAD but deliberately not one; a real cipher is out of scope
//! and slots in behind the same seal/open contract.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use peerline_proto::message::{FINGERPRINT_LEN, PeerName, SealedPayload};
use zeroize::Zeroize;

use super::CryptoError;
use super::keys::{IdentityKey, IdentityKeys};

/// Encryption state for one peer pairing.
///
/// `send_nonce` advances on every seal and is embedded in the payload;
/// `recv_nonce` tracks the highest position opened. Neither is secret.
pub struct SessionState {
    key: [u8; 32],
    /// Fingerprint of the local public key; inbound payloads must carry it.
    local_fingerprint: [u8; FINGERPRINT_LEN],
    /// Fingerprint of the remote public key; stamped on outbound payloads.
    remote_fingerprint: [u8; FINGERPRINT_LEN],
    send_nonce: u64,
    recv_nonce: u64,
}

impl SessionState {
    /// Derives a session for the given remote peer key.
    #[must_use]
    pub fn derive(local: &IdentityKeys, remote: &IdentityKey) -> Self {
        Self {
            key: local.session_key(remote),
            local_fingerprint: local.public().fingerprint(),
            remote_fingerprint: remote.fingerprint(),
            send_nonce: 0,
            recv_nonce: 0,
        }
    }

    /// Encrypts a plaintext body for the session's remote peer.
    ///
    /// Always succeeds for well-formed UTF-8 input and advances the send
    /// counter.
    pub fn seal(&mut self, plaintext: &str) -> SealedPayload {
        let nonce = self.send_nonce;
        self.send_nonce = self.send_nonce.saturating_add(1);

        let mut ciphertext = plaintext.as_bytes().to_vec();
        apply_keystream(&self.key, nonce, &mut ciphertext);
        let tag = compute_tag(&self.key, &self.remote_fingerprint, nonce, &ciphertext);

        SealedPayload {
            fingerprint: self.remote_fingerprint,
            nonce,
            ciphertext,
            tag,
        }
    }

    /// Recovers the plaintext body from a payload sealed for us.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::KeyMismatch`] when the payload targets a different
    ///   recipient key than this session's local key.
    /// - [`CryptoError::Malformed`] when the integrity tag does not verify
    ///   or the decrypted bytes are not valid UTF-8.
    ///
    /// Never panics on malformed input.
    pub fn open(&mut self, payload: &SealedPayload) -> Result<String, CryptoError> {
        if payload.fingerprint != self.local_fingerprint {
            return Err(CryptoError::KeyMismatch);
        }

        let expected = compute_tag(
            &self.key,
            &payload.fingerprint,
            payload.nonce,
            &payload.ciphertext,
        );
        if expected != payload.tag {
            return Err(CryptoError::Malformed);
        }

        let mut plaintext = payload.ciphertext.clone();
        apply_keystream(&self.key, payload.nonce, &mut plaintext);
        // An authenticated payload may legitimately carry u64::MAX.
        self.recv_nonce = self.recv_nonce.max(payload.nonce.saturating_add(1));

        String::from_utf8(plaintext).map_err(|_| CryptoError::Malformed)
    }

    /// Zeroizes the session key.
    fn wipe(&mut self) {
        self.key.zeroize();
    }
}

/// XORs `data` with a keystream derived from the session key and nonce.
///
/// Block `i` of the keystream is `blake3::keyed_hash(key, nonce || i)`;
/// XOR is its own inverse, so the same call decrypts.
fn apply_keystream(key: &[u8; 32], nonce: u64, data: &mut [u8]) {
    for (block_index, block) in data.chunks_mut(32).enumerate() {
        let mut input = [0u8; 16];
        input[..8].copy_from_slice(&nonce.to_le_bytes());
        input[8..].copy_from_slice(&(block_index as u64).to_le_bytes());
        let keystream = blake3::keyed_hash(key, &input);
        for (byte, k) in block.iter_mut().zip(keystream.as_bytes()) {
            *byte ^= k;
        }
    }
}

/// Keyed integrity tag over fingerprint, nonce, and ciphertext.
fn compute_tag(
    key: &[u8; 32],
    fingerprint: &[u8; FINGERPRINT_LEN],
    nonce: u64,
    ciphertext: &[u8],
) -> [u8; 32] {
    let mut input = Vec::with_capacity(FINGERPRINT_LEN + 8 + ciphertext.len());
    input.extend_from_slice(fingerprint);
    input.extend_from_slice(&nonce.to_le_bytes());
    input.extend_from_slice(ciphertext);
    *blake3::keyed_hash(key, &input).as_bytes()
}

/// Owns the local identity keypair and every per-peer session.
///
/// Access is single-writer: the delivery coordinator holds the store
/// behind a mutex and all operations are synchronous.
pub struct SessionStore {
    local: Option<IdentityKeys>,
    sessions: HashMap<PeerName, SessionState>,
    wiped: bool,
}

impl SessionStore {
    /// Creates a store around the local identity keypair.
    #[must_use]
    pub fn new(local: IdentityKeys) -> Self {
        Self {
            local: Some(local),
            sessions: HashMap::new(),
            wiped: false,
        }
    }

    /// Returns the local public identity key, if not wiped.
    #[must_use]
    pub fn local_public(&self) -> Option<IdentityKey> {
        self.local.as_ref().map(|keys| keys.public().clone())
    }

    /// Seals a plaintext body for `peer`, creating the session on first use.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::SessionWiped`] after
    /// [`wipe_all_local_key_material`](Self::wipe_all_local_key_material).
    pub fn seal_for(
        &mut self,
        peer: &PeerName,
        remote: &IdentityKey,
        plaintext: &str,
    ) -> Result<SealedPayload, CryptoError> {
        let session = self.session_for(peer, remote)?;
        Ok(session.seal(plaintext))
    }

    /// Opens a payload received from `peer`, creating the session on first
    /// use.
    ///
    /// # Errors
    ///
    /// Propagates [`CryptoError::KeyMismatch`] / [`CryptoError::Malformed`]
    /// from [`SessionState::open`], or [`CryptoError::SessionWiped`] after
    /// a wipe.
    pub fn open_from(
        &mut self,
        peer: &PeerName,
        remote: &IdentityKey,
        payload: &SealedPayload,
    ) -> Result<String, CryptoError> {
        let session = self.session_for(peer, remote)?;
        session.open(payload)
    }

    fn session_for(
        &mut self,
        peer: &PeerName,
        remote: &IdentityKey,
    ) -> Result<&mut SessionState, CryptoError> {
        if self.wiped {
            return Err(CryptoError::SessionWiped);
        }
        let Some(local) = self.local.as_ref() else {
            return Err(CryptoError::SessionWiped);
        };
        match self.sessions.entry(peer.clone()) {
            Entry::Occupied(mut occupied) => {
                // The peer's key can be replaced (a placeholder upgraded
                // to a verified one); a session derived against the old
                // key must not outlive it.
                if occupied.get().remote_fingerprint != remote.fingerprint() {
                    occupied.get_mut().wipe();
                    occupied.insert(SessionState::derive(local, remote));
                }
                Ok(occupied.into_mut())
            }
            Entry::Vacant(vacant) => Ok(vacant.insert(SessionState::derive(local, remote))),
        }
    }

    /// Destroys all locally held key material, irreversibly.
    ///
    /// Best-effort over every store: each session key is zeroized, the
    /// local static secret is dropped (zeroized by its own drop impl), and
    /// the store enters a terminal wiped state in which no old key is
    /// usable. Idempotent and safe to call at any time.
    pub fn wipe_all_local_key_material(&mut self) {
        for session in self.sessions.values_mut() {
            session.wipe();
        }
        self.sessions.clear();
        self.local = None;
        self.wiped = true;
        tracing::info!("all local key material wiped");
    }

    /// Whether the store has been wiped.
    #[must_use]
    pub const fn is_wiped(&self) -> bool {
        self.wiped
    }
}
