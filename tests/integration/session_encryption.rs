//! Integration tests for end-to-end session encryption.
//!
//! Validates that bodies round-trip between peers holding each other's
//! real keys, that the ratchet advances across a conversation, and that a
//! message sealed for the wrong key degrades to the sentinel instead of
//! crashing the pipeline or leaking garbage plaintext.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use peerline::config::CoreConfig;
use peerline::crypto::keys::{IdentityKey, IdentityKeys};
use peerline::delivery::{DeliveryCoordinator, InboundMessage, SECURE_CONTENT, SendOutcome};
use peerline::registry::Identity;
use peerline::transport::loopback::{LoopbackEndpoint, LoopbackHub};
use peerline_proto::call::CallSignal;
use peerline_proto::message::PeerName;

type Coordinator = Arc<DeliveryCoordinator<LoopbackEndpoint>>;
type Peer = (
    Coordinator,
    mpsc::Receiver<InboundMessage>,
    mpsc::Receiver<CallSignal>,
);

fn fast_config() -> CoreConfig {
    CoreConfig {
        connect_timeout: Duration::from_millis(100),
        ..CoreConfig::default()
    }
}

fn spawn_peer(hub: &LoopbackHub, name: &str, keys: IdentityKeys) -> Peer {
    let peer = PeerName::new(name);
    DeliveryCoordinator::spawn(peer.clone(), keys, hub.endpoint(peer), fast_config())
}

fn introduce(coordinator: &Coordinator, name: &str, key: IdentityKey) {
    coordinator
        .registry()
        .register(Identity::new(PeerName::new(name), key))
        .unwrap();
}

async fn recv_message(rx: &mut mpsc::Receiver<InboundMessage>) -> InboundMessage {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("recv timed out")
        .expect("message channel closed")
}

#[tokio::test]
async fn bodies_round_trip_between_keyed_peers() {
    let hub = LoopbackHub::new();
    let alice_keys = IdentityKeys::generate();
    let bob_keys = IdentityKeys::generate();
    let alice_public = alice_keys.public().clone();
    let bob_public = bob_keys.public().clone();

    let (alice, mut alice_messages, _alice_calls) = spawn_peer(&hub, "alice", alice_keys);
    introduce(&alice, "bob", bob_public);
    let (bob, mut bob_messages, _bob_calls) = spawn_peer(&hub, "bob", bob_keys);
    introduce(&bob, "alice", alice_public);

    alice.send_message("bob", "hello bob 🔒").await.unwrap();
    let inbound = recv_message(&mut bob_messages).await;
    assert_eq!(inbound.from, PeerName::new("alice"));
    assert_eq!(inbound.body, "hello bob 🔒");
    assert!(inbound.readable);

    bob.send_message("alice", "hello alice").await.unwrap();
    let inbound = recv_message(&mut alice_messages).await;
    assert_eq!(inbound.from, PeerName::new("bob"));
    assert_eq!(inbound.body, "hello alice");
    assert!(inbound.readable);
}

#[tokio::test]
async fn conversation_stays_readable_as_ratchet_advances() {
    let hub = LoopbackHub::new();
    let alice_keys = IdentityKeys::generate();
    let bob_keys = IdentityKeys::generate();
    let alice_public = alice_keys.public().clone();
    let bob_public = bob_keys.public().clone();

    let (alice, _alice_messages, _alice_calls) = spawn_peer(&hub, "alice", alice_keys);
    introduce(&alice, "bob", bob_public);
    let (bob, mut bob_messages, _bob_calls) = spawn_peer(&hub, "bob", bob_keys);
    introduce(&bob, "alice", alice_public);

    for i in 0..20 {
        alice
            .send_message("bob", &format!("message number {i}"))
            .await
            .unwrap();
    }
    for i in 0..20 {
        let inbound = recv_message(&mut bob_messages).await;
        assert_eq!(inbound.body, format!("message number {i}"));
        assert!(inbound.readable);
    }
}

#[tokio::test]
async fn wrong_key_degrades_to_sentinel() {
    let hub = LoopbackHub::new();
    let alice_keys = IdentityKeys::generate();
    let carol_keys = IdentityKeys::generate();

    let (alice, _alice_messages, _alice_calls) = spawn_peer(&hub, "alice", alice_keys);
    let (_carol, mut carol_messages, _carol_calls) = spawn_peer(&hub, "carol", carol_keys);

    // Alice never learned Carol's real key, so she seals for a
    // synthesized one. Carol must receive the message but not the body.
    let (_, outcome) = alice.send_message("carol", "you can't read this").await.unwrap();
    assert_eq!(outcome, SendOutcome::Delivered);

    let inbound = recv_message(&mut carol_messages).await;
    assert_eq!(inbound.from, PeerName::new("alice"));
    assert_eq!(inbound.body, SECURE_CONTENT);
    assert!(!inbound.readable);
}

#[tokio::test]
async fn sentinel_does_not_poison_later_traffic() {
    let hub = LoopbackHub::new();
    let alice_keys = IdentityKeys::generate();
    let bob_keys = IdentityKeys::generate();
    let carol_keys = IdentityKeys::generate();
    let carol_public = carol_keys.public().clone();

    let (alice, _alice_messages, _alice_calls) = spawn_peer(&hub, "alice", alice_keys);
    let alice_identity = alice.registry().find(&PeerName::new("alice")).unwrap();
    introduce(&alice, "carol", carol_public);
    let (_bob, mut bob_messages, _bob_calls) = spawn_peer(&hub, "bob", bob_keys);
    let (carol, mut carol_messages, _carol_calls) = spawn_peer(&hub, "carol", carol_keys);
    carol.registry().register(alice_identity).unwrap();

    // Alice never learned Bob's key: Bob gets the sentinel.
    alice.send_message("bob", "unreadable for bob").await.unwrap();
    let inbound = recv_message(&mut bob_messages).await;
    assert!(!inbound.readable);

    // The failed decrypt leaves the pipeline intact for keyed peers.
    alice.send_message("carol", "still working").await.unwrap();
    let inbound = recv_message(&mut carol_messages).await;
    assert_eq!(inbound.body, "still working");
    assert!(inbound.readable);
}
