//! Integration tests for store-and-forward delivery.
//!
//! Validates that messages to an unreachable peer are queued rather than
//! lost, that the queue drains FIFO once a channel opens — before anything
//! sent after the open — and that the bounded queue evicts its oldest
//! entry at the cap.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use peerline::config::CoreConfig;
use peerline::crypto::keys::{IdentityKey, IdentityKeys};
use peerline::delivery::{DeliveryCoordinator, InboundMessage, SendOutcome};
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

fn spawn_peer(hub: &LoopbackHub, name: &str, keys: IdentityKeys, config: CoreConfig) -> Peer {
    let peer = PeerName::new(name);
    DeliveryCoordinator::spawn(peer.clone(), keys, hub.endpoint(peer), config)
}

/// Registers `name` with its real public key so sealed traffic is readable.
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
async fn unreachable_peer_queues_instead_of_failing() {
    let hub = LoopbackHub::new();
    let alice_keys = IdentityKeys::generate();
    let bob_keys = IdentityKeys::generate();
    let bob_public = bob_keys.public().clone();

    let (alice, _alice_messages, _alice_calls) =
        spawn_peer(&hub, "alice", alice_keys, fast_config());
    introduce(&alice, "bob", bob_public);

    // Bob has no endpoint on the hub yet.
    let (id, outcome) = alice.send_message("bob", "are you there?").await.unwrap();
    assert_eq!(outcome, SendOutcome::Queued);
    assert_eq!(alice.pending_count(&PeerName::new("bob")).await, 1);
    assert_eq!(
        alice.delivery_state(&id).await,
        Some(peerline_proto::message::DeliveryState::Sent)
    );
}

#[tokio::test]
async fn queued_backlog_drains_fifo_before_newer_send() {
    let hub = LoopbackHub::new();
    let alice_keys = IdentityKeys::generate();
    let bob_keys = IdentityKeys::generate();
    let alice_public = alice_keys.public().clone();
    let bob_public = bob_keys.public().clone();

    let (alice, _alice_messages, _alice_calls) =
        spawn_peer(&hub, "alice", alice_keys, fast_config());
    introduce(&alice, "bob", bob_public);

    // Two messages queue while Bob is offline.
    let (_, first) = alice.send_message("bob", "one").await.unwrap();
    let (_, second) = alice.send_message("bob", "two").await.unwrap();
    assert_eq!(first, SendOutcome::Queued);
    assert_eq!(second, SendOutcome::Queued);

    // Bob comes online and learns Alice's key before traffic arrives.
    let (bob, mut bob_messages, _bob_calls) = spawn_peer(&hub, "bob", bob_keys, fast_config());
    introduce(&bob, "alice", alice_public);

    // A newer send opens the channel; the backlog must precede it.
    let (_, third) = alice.send_message("bob", "three").await.unwrap();
    assert_eq!(third, SendOutcome::Delivered);

    for expected in ["one", "two", "three"] {
        let inbound = recv_message(&mut bob_messages).await;
        assert_eq!(inbound.from, PeerName::new("alice"));
        assert_eq!(inbound.body, expected);
        assert!(inbound.readable);
    }
    assert_eq!(alice.pending_count(&PeerName::new("bob")).await, 0);
}

#[tokio::test]
async fn remote_open_triggers_backlog_flush() {
    let hub = LoopbackHub::new();
    let alice_keys = IdentityKeys::generate();
    let bob_keys = IdentityKeys::generate();
    let alice_public = alice_keys.public().clone();
    let bob_public = bob_keys.public().clone();

    let (alice, mut alice_messages, _alice_calls) =
        spawn_peer(&hub, "alice", alice_keys, fast_config());
    introduce(&alice, "bob", bob_public);

    let (_, outcome) = alice.send_message("bob", "waiting for you").await.unwrap();
    assert_eq!(outcome, SendOutcome::Queued);

    let (bob, mut bob_messages, _bob_calls) = spawn_peer(&hub, "bob", bob_keys, fast_config());
    introduce(&bob, "alice", alice_public);

    // Bob initiates contact; the resulting channel-open on Alice's side
    // must flush her backlog without any further send from her.
    let (_, outcome) = bob.send_message("alice", "hello alice").await.unwrap();
    assert_eq!(outcome, SendOutcome::Delivered);

    let to_alice = recv_message(&mut alice_messages).await;
    assert_eq!(to_alice.body, "hello alice");

    let to_bob = recv_message(&mut bob_messages).await;
    assert_eq!(to_bob.body, "waiting for you");
    assert!(to_bob.readable);
    assert_eq!(alice.pending_count(&PeerName::new("bob")).await, 0);
}

#[tokio::test]
async fn full_queue_evicts_oldest_message() {
    let hub = LoopbackHub::new();
    let alice_keys = IdentityKeys::generate();
    let bob_keys = IdentityKeys::generate();
    let alice_public = alice_keys.public().clone();
    let bob_public = bob_keys.public().clone();

    let config = CoreConfig {
        max_pending_per_peer: 2,
        ..fast_config()
    };
    let (alice, _alice_messages, _alice_calls) = spawn_peer(&hub, "alice", alice_keys, config);
    introduce(&alice, "bob", bob_public);

    for body in ["one", "two", "three"] {
        let (_, outcome) = alice.send_message("bob", body).await.unwrap();
        assert_eq!(outcome, SendOutcome::Queued);
    }
    assert_eq!(alice.pending_count(&PeerName::new("bob")).await, 2);

    let (bob, mut bob_messages, _bob_calls) = spawn_peer(&hub, "bob", bob_keys, fast_config());
    introduce(&bob, "alice", alice_public);

    let (_, outcome) = alice.send_message("bob", "four").await.unwrap();
    assert_eq!(outcome, SendOutcome::Delivered);

    // "one" was evicted at the cap; the survivors arrive in order.
    for expected in ["two", "three", "four"] {
        let inbound = recv_message(&mut bob_messages).await;
        assert_eq!(inbound.body, expected);
    }
}
