// test-only module included via protocol/mod.rs
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use crate::core::packet::Packet;
use crate::protocol::correlator::{Delivery, SequenceCounter};
use crate::protocol::device::DeviceHandle;
use crate::protocol::handshake::*;
use crate::protocol::registry::DeviceRegistry;

#[test]
fn test_authentication_exchange_flow() {
    // =================== Daemon hands out a nonce ===================
    let server_nonce = [0xAA, 0xBB, 0xCC, 0xDD];

    // =================== Client answers twice ===================
    let mut nonces = NonceSequence::new();
    let first = AuthenticationRequest::build("correct horse", &server_nonce, &mut nonces)
        .expect("ASCII secret should be accepted");
    let second = AuthenticationRequest::build("correct horse", &server_nonce, &mut nonces)
        .expect("ASCII secret should be accepted");

    // Nonces never repeat within one sequence
    assert_ne!(first.client_nonce(), second.client_nonce());

    // =================== Daemon verifies ===================
    assert!(verify_authentication("correct horse", &server_nonce, &first.to_payload()));
    assert!(verify_authentication("correct horse", &server_nonce, &second.to_payload()));
    assert!(!verify_authentication("battery staple", &server_nonce, &first.to_payload()));
}

#[test]
fn test_stale_response_never_reaches_new_call_on_same_slot() {
    let registry = DeviceRegistry::new();
    let device = DeviceHandle::new("6wVE").unwrap();
    registry.register(device.clone()).unwrap();
    let sequence = SequenceCounter::new();

    // First call times out on seq 1.
    let seq = sequence.next();
    assert_eq!(seq, 1);
    let _rx = device.correlator().begin(3, seq);
    assert!(device.correlator().abandon(3, seq));

    // Fourteen more calls cycle the counter; the next free number must skip 1.
    for _ in 0..14 {
        sequence.next();
    }
    let next = sequence
        .next_excluding(|s| device.correlator().is_abandoned(s))
        .unwrap();
    assert_eq!(next, 2);

    let mut rx = device.correlator().begin(3, next);

    // Late answer for the abandoned call arrives first and is swallowed.
    let stale = Packet::request(device.peer_id(), 3, 1, true, vec![0u8]).unwrap();
    assert_eq!(device.correlator().deliver(stale), Delivery::Stale);
    assert!(rx.try_recv().is_err());

    let fresh = Packet::request(device.peer_id(), 3, next, true, vec![1u8]).unwrap();
    assert_eq!(device.correlator().deliver(fresh), Delivery::Matched);
    assert_eq!(&rx.try_recv().unwrap().payload[..], &[1u8]);
}

#[tokio::test]
async fn test_replacement_wakes_pending_call() {
    let registry = DeviceRegistry::new();
    let old = DeviceHandle::new("6wVE").unwrap();
    registry.register(old.clone()).unwrap();

    let rx = old.correlator().begin(3, 4);
    registry.register(DeviceHandle::new("6wVE").unwrap()).unwrap();

    assert!(rx.await.is_err());
    assert!(old.is_replaced());
    assert!(!old.has_pending_request());
}
