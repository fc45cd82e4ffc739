//! Integration tests for channel lifecycle behavior as seen through the
//! delivery surface.
//!
//! Validates that concurrent sends to one peer share a single handshake,
//! that an unresponsive peer degrades to queueing after the bounded
//! timeout, and that a dropped peer is detected and later traffic falls
//! back to the queue.

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
async fn concurrent_sends_share_one_handshake() {
    let hub = LoopbackHub::new();
    let alice_keys = IdentityKeys::generate();
    let bob_keys = IdentityKeys::generate();
    let alice_public = alice_keys.public().clone();
    let bob_public = bob_keys.public().clone();

    let (alice, _alice_messages, _alice_calls) = spawn_peer(&hub, "alice", alice_keys);
    introduce(&alice, "bob", bob_public);
    let (bob, mut bob_messages, _bob_calls) = spawn_peer(&hub, "bob", bob_keys);
    introduce(&bob, "alice", alice_public);

    let mut tasks = Vec::new();
    for i in 0..8 {
        let alice = Arc::clone(&alice);
        tasks.push(tokio::spawn(async move {
            alice.send_message("bob", &format!("message {i}")).await
        }));
    }
    for task in tasks {
        let (_, outcome) = task.await.unwrap().unwrap();
        assert_eq!(outcome, SendOutcome::Delivered);
    }

    assert_eq!(hub.open_count(&PeerName::new("bob")), 1);
    for _ in 0..8 {
        assert!(recv_message(&mut bob_messages).await.readable);
    }
}

#[tokio::test]
async fn unresponsive_peer_times_out_into_queue() {
    let hub = LoopbackHub::new();
    let alice_keys = IdentityKeys::generate();
    let bob_keys = IdentityKeys::generate();
    let alice_public = alice_keys.public().clone();
    let bob_public = bob_keys.public().clone();

    let (alice, _alice_messages, _alice_calls) = spawn_peer(&hub, "alice", alice_keys);
    introduce(&alice, "bob", bob_public);
    let (bob, mut bob_messages, _bob_calls) = spawn_peer(&hub, "bob", bob_keys);
    introduce(&bob, "alice", alice_public);

    hub.set_unresponsive(&PeerName::new("bob"), true);
    let (_, outcome) = alice.send_message("bob", "stuck").await.unwrap();
    assert_eq!(outcome, SendOutcome::Queued);
    assert_eq!(hub.open_count(&PeerName::new("bob")), 0);

    // Peer recovers: the next send drains the backlog first.
    hub.set_unresponsive(&PeerName::new("bob"), false);
    let (_, outcome) = alice.send_message("bob", "moving again").await.unwrap();
    assert_eq!(outcome, SendOutcome::Delivered);

    assert_eq!(recv_message(&mut bob_messages).await.body, "stuck");
    assert_eq!(recv_message(&mut bob_messages).await.body, "moving again");
}

#[tokio::test]
async fn dropped_peer_degrades_to_queueing() {
    let hub = LoopbackHub::new();
    let alice_keys = IdentityKeys::generate();
    let bob_keys = IdentityKeys::generate();
    let alice_public = alice_keys.public().clone();
    let bob_public = bob_keys.public().clone();

    let (alice, _alice_messages, _alice_calls) = spawn_peer(&hub, "alice", alice_keys);
    introduce(&alice, "bob", bob_public);
    let (bob, mut bob_messages, _bob_calls) = spawn_peer(&hub, "bob", bob_keys);
    introduce(&bob, "alice", alice_public);

    let (_, outcome) = alice.send_message("bob", "while you were here").await.unwrap();
    assert_eq!(outcome, SendOutcome::Delivered);
    assert!(recv_message(&mut bob_messages).await.readable);

    // Bob vanishes; his closed channel must not leave Alice with a stale
    // open entry.
    hub.disconnect(&PeerName::new("bob"));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (_, outcome) = alice.send_message("bob", "after you left").await.unwrap();
    assert_eq!(outcome, SendOutcome::Queued);
    assert_eq!(alice.pending_count(&PeerName::new("bob")).await, 1);
}
