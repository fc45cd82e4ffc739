//! Peerline client core: peer sessions and message delivery for an
//! encrypted P2P messenger.
//!
//! The crate is organized around four collaborators:
//!
//! - [`registry::IdentityRegistry`] — username→identity resolution, with
//!   deterministic synthesized identities for not-yet-verified peers.
//! - [`crypto`] — x25519 identity keys and per-peer encryption sessions;
//!   the only place plaintext bodies exist.
//! - [`channel::ChannelManager`] — per-peer channel lifecycle over a
//!   pluggable [`transport::Transport`], with coalesced concurrent
//!   connects and bounded handshakes.
//! - [`delivery::DeliveryCoordinator`] — the application-facing surface:
//!   send with store-and-forward fallback, an inbound decode/dedup/decrypt
//!   pipeline, call signaling, mailbox polling, and account wipe.
//!
//! Wire types and the codec live in the `peerline-proto` crate.

pub mod channel;
pub mod config;
pub mod crypto;
pub mod delivery;
pub mod inbox;
pub mod registry;
pub mod transport;
