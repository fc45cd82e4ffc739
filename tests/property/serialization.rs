//! Property-based serialization round-trip tests.
//!
//! Uses proptest to verify:
//! 1. Any valid `SealedMessage` envelope survives encode → decode.
//! 2. Any valid `CallSignal` envelope survives encode → decode.
//! 3. Random bytes never cause a panic in `decode` (returns `Err`
//!    gracefully).
//! 4. `PeerName` normalization is idempotent under serialization.

use proptest::prelude::*;
use uuid::Uuid;

use peerline_proto::call::{CallKind, CallSignal};
use peerline_proto::codec;
use peerline_proto::message::{
    Envelope, FINGERPRINT_LEN, MessageId, PeerName, SealedMessage, SealedPayload, Timestamp,
};

// --- Strategies for protocol types ---

/// Strategy for generating arbitrary `PeerName` values (already
/// normalized, as they would be after construction).
fn arb_peer_name() -> impl Strategy<Value = PeerName> {
    "[a-z0-9_]{1,32}".prop_map(PeerName::new)
}

/// Strategy for generating arbitrary `MessageId` values.
fn arb_message_id() -> impl Strategy<Value = MessageId> {
    any::<u128>().prop_map(|n| MessageId::from_uuid(Uuid::from_u128(n)))
}

/// Strategy for generating arbitrary `Timestamp` values.
fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
    any::<u64>().prop_map(Timestamp::from_millis)
}

/// Strategy for generating arbitrary `SealedPayload` values.
fn arb_sealed_payload() -> impl Strategy<Value = SealedPayload> {
    (
        any::<[u8; FINGERPRINT_LEN]>(),
        any::<u64>(),
        prop::collection::vec(any::<u8>(), 0..1024),
        any::<[u8; 32]>(),
    )
        .prop_map(|(fingerprint, nonce, ciphertext, tag)| SealedPayload {
            fingerprint,
            nonce,
            ciphertext,
            tag,
        })
}

/// Strategy for generating arbitrary `SealedMessage` values.
fn arb_sealed_message() -> impl Strategy<Value = SealedMessage> {
    (
        arb_message_id(),
        arb_peer_name(),
        arb_peer_name(),
        arb_timestamp(),
        arb_sealed_payload(),
    )
        .prop_map(|(id, sender, recipient, timestamp, payload)| SealedMessage {
            id,
            sender,
            recipient,
            timestamp,
            payload,
        })
}

/// Strategy for generating arbitrary `CallSignal` values.
fn arb_call_signal() -> impl Strategy<Value = CallSignal> {
    (
        prop_oneof![Just(CallKind::Audio), Just(CallKind::Video)],
        arb_peer_name(),
    )
        .prop_map(|(kind, from)| CallSignal { kind, from })
}

/// Strategy for generating arbitrary `Envelope` values.
fn arb_envelope() -> impl Strategy<Value = Envelope> {
    prop_oneof![
        arb_sealed_message().prop_map(Envelope::Message),
        arb_call_signal().prop_map(Envelope::Call),
    ]
}

// --- Properties ---

proptest! {
    #[test]
    fn message_envelope_round_trips(message in arb_sealed_message()) {
        let original = Envelope::Message(message);
        let bytes = codec::encode(&original).unwrap();
        let decoded = codec::decode(&bytes).unwrap();
        prop_assert_eq!(original, decoded);
    }

    #[test]
    fn call_envelope_round_trips(signal in arb_call_signal()) {
        let original = Envelope::Call(signal);
        let bytes = codec::encode(&original).unwrap();
        let decoded = codec::decode(&bytes).unwrap();
        prop_assert_eq!(original, decoded);
    }

    #[test]
    fn any_envelope_round_trips(envelope in arb_envelope()) {
        let bytes = codec::encode(&envelope).unwrap();
        let decoded = codec::decode(&bytes).unwrap();
        prop_assert_eq!(envelope, decoded);
    }

    #[test]
    fn random_bytes_never_panic_decode(bytes in prop::collection::vec(any::<u8>(), 0..2048)) {
        // Must return a Result either way, never panic.
        let _ = codec::decode(&bytes);
    }

    #[test]
    fn truncation_is_detected(envelope in arb_envelope(), cut in 1usize..64) {
        let bytes = codec::encode(&envelope).unwrap();
        if cut < bytes.len() {
            let truncated = &bytes[..bytes.len() - cut];
            // Either an error or, at worst, a different value — never the
            // original envelope parsed from fewer bytes.
            if let Ok(decoded) = codec::decode(truncated) {
                prop_assert_ne!(decoded, envelope);
            }
        }
    }

    #[test]
    fn peer_name_survives_round_trip(name in arb_peer_name()) {
        let original = Envelope::Call(CallSignal { kind: CallKind::Audio, from: name.clone() });
        let bytes = codec::encode(&original).unwrap();
        let Envelope::Call(decoded) = codec::decode(&bytes).unwrap() else {
            return Err(TestCaseError::fail("decoded to a different variant"));
        };
        prop_assert_eq!(decoded.from, name);
    }
}
