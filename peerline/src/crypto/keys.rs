//! Identity key material.
//!
//! Long-term x25519 identity keypairs for the local user, and the public
//! [`IdentityKey`] type used to address remote peers. Synthetic keys for
//! peers known only by name are derived deterministically so that repeated
//! discovery of the same name yields the same identity material.

use peerline_proto::message::{FINGERPRINT_LEN, PeerName};
use zeroize::Zeroize;

/// Domain separation for synthetic identity keys.
const SYNTHETIC_KEY_CONTEXT: &str = "peerline synthetic identity v1";

/// Domain separation for session key derivation.
const SESSION_KEY_CONTEXT: &str = "peerline session key v1";

/// A peer's public identity key (32 bytes, x25519).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey([u8; 32]);

impl IdentityKey {
    /// Wraps raw public key bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Returns the raw public key bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Derives a deterministic placeholder key for a peer known only by
    /// name.
    ///
    /// There is no private half anywhere, so nothing sealed for a synthetic
    /// key can ever be opened. A production deployment must replace the
    /// synthetic key with a verified one out of band before trusting the
    /// peer; the registry does not do that verification.
    #[must_use]
    pub fn synthesize(name: &PeerName) -> Self {
        Self(blake3::derive_key(SYNTHETIC_KEY_CONTEXT, name.as_str().as_bytes()))
    }

    /// Returns a short fingerprint prefix identifying this key.
    ///
    /// Sealed payloads carry the recipient's fingerprint so a decrypt
    /// attempt against the wrong session is detected instead of producing
    /// garbage.
    #[must_use]
    pub fn fingerprint(&self) -> [u8; FINGERPRINT_LEN] {
        let digest = blake3::hash(&self.0);
        let mut prefix = [0u8; FINGERPRINT_LEN];
        prefix.copy_from_slice(&digest.as_bytes()[..FINGERPRINT_LEN]);
        prefix
    }

    /// Returns the fingerprint as a hex string for display.
    #[must_use]
    pub fn fingerprint_hex(&self) -> String {
        use std::fmt::Write;
        self.fingerprint()
            .iter()
            .fold(String::new(), |mut out, b| {
                let _ = write!(out, "{b:02x}");
                out
            })
    }
}

/// The local user's long-term identity keypair.
///
/// The private half never leaves this type; it is zeroized when the keypair
/// is wiped or dropped.
pub struct IdentityKeys {
    secret: x25519_dalek::StaticSecret,
    public: IdentityKey,
}

impl IdentityKeys {
    /// Generates a fresh keypair from the system CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        let secret = x25519_dalek::StaticSecret::random_from_rng(rand_core::OsRng);
        let public = IdentityKey(*x25519_dalek::PublicKey::from(&secret).as_bytes());
        Self { secret, public }
    }

    /// Returns the public half.
    #[must_use]
    pub const fn public(&self) -> &IdentityKey {
        &self.public
    }

    /// Derives the shared session key for a remote peer.
    ///
    /// Both sides compute the same key from their own secret and the other
    /// side's public key (x25519 Diffie-Hellman), hashed under a
    /// domain-separation context so the raw shared point never doubles as
    /// key material.
    #[must_use]
    pub fn session_key(&self, remote: &IdentityKey) -> [u8; 32] {
        let remote_public = x25519_dalek::PublicKey::from(*remote.as_bytes());
        let mut shared = self.secret.diffie_hellman(&remote_public).to_bytes();
        let key = blake3::derive_key(SESSION_KEY_CONTEXT, &shared);
        shared.zeroize();
        key
    }
}
