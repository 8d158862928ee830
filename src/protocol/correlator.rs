//! Request/response correlation.
//!
//! Every device handle owns one [`Correlator`] holding at most one pending
//! request. A response completes it only if both function id and sequence
//! number agree. When a call gives up waiting, its `(function_id, seq)` pair
//! is remembered as abandoned: the late response is swallowed when it shows
//! up, and new requests on the same handle skip that sequence number so the
//! two can never be confused.

use crate::core::packet::Packet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::trace;

/// Number of usable sequence numbers (1..=15).
pub const SEQUENCE_SLOTS: u8 = 15;

/// Connection-wide cyclic sequence number source. Zero is reserved for
/// events and never returned.
#[derive(Debug, Default)]
pub struct SequenceCounter {
    last: AtomicU8,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next number in 1..=15, wrapping.
    pub fn next(&self) -> u8 {
        let prev = self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n % SEQUENCE_SLOTS + 1)
            })
            .unwrap_or_default();
        prev % SEQUENCE_SLOTS + 1
    }

    /// Next number for which `skip` is false, or `None` if all fifteen are
    /// skipped.
    pub fn next_excluding(&self, skip: impl Fn(u8) -> bool) -> Option<u8> {
        (0..SEQUENCE_SLOTS).map(|_| self.next()).find(|seq| !skip(*seq))
    }
}

/// Outcome of routing one response packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Completed the pending call
    Matched,
    /// Late answer to an abandoned call, dropped
    Stale,
    /// Nobody asked for this
    Unexpected,
}

struct PendingRequest {
    function_id: u8,
    sequence_number: u8,
    responder: oneshot::Sender<Packet>,
}

#[derive(Default)]
struct State {
    pending: Option<PendingRequest>,
    /// Indexed by sequence number, holds the function id of an abandoned call.
    abandoned: [Option<u8>; 16],
}

/// Per-handle pending request slot.
#[derive(Default)]
pub struct Correlator {
    state: Mutex<State>,
    /// Serializes calls on one handle so only one request is ever pending.
    request_lock: tokio::sync::Mutex<()>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Exclusive right to issue one request on this handle.
    pub async fn lock_request(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.request_lock.lock().await
    }

    pub fn is_abandoned(&self, sequence_number: u8) -> bool {
        self.state().abandoned[(sequence_number & 0x0F) as usize].is_some()
    }

    pub fn has_pending(&self) -> bool {
        self.state().pending.is_some()
    }

    /// Record the expectation for `(function_id, sequence_number)`. Must be
    /// called before the request goes out.
    pub fn begin(&self, function_id: u8, sequence_number: u8) -> oneshot::Receiver<Packet> {
        let (responder, rx) = oneshot::channel();
        self.state().pending = Some(PendingRequest {
            function_id,
            sequence_number,
            responder,
        });
        rx
    }

    /// Drop the expectation without tombstoning, e.g. when the send failed.
    pub fn cancel(&self, function_id: u8, sequence_number: u8) {
        let mut state = self.state();
        if matches!(&state.pending, Some(p) if p.function_id == function_id && p.sequence_number == sequence_number)
        {
            state.pending = None;
        }
    }

    /// Give up on `(function_id, sequence_number)` after its deadline.
    ///
    /// Returns `false` if the response was delivered concurrently, in which
    /// case it is waiting in the caller's receiver and nothing is tombstoned.
    pub fn abandon(&self, function_id: u8, sequence_number: u8) -> bool {
        let mut state = self.state();
        match &state.pending {
            Some(p) if p.function_id == function_id && p.sequence_number == sequence_number => {
                state.pending = None;
                state.abandoned[(sequence_number & 0x0F) as usize] = Some(function_id);
                true
            }
            _ => false,
        }
    }

    /// Route a response packet.
    pub fn deliver(&self, packet: Packet) -> Delivery {
        let fid = packet.function_id();
        let seq = packet.sequence_number();
        let mut state = self.state();

        if matches!(&state.pending, Some(p) if p.function_id == fid && p.sequence_number == seq) {
            if let Some(pending) = state.pending.take() {
                return match pending.responder.send(packet) {
                    Ok(()) => Delivery::Matched,
                    Err(_) => Delivery::Stale,
                };
            }
        }

        let slot = &mut state.abandoned[(seq & 0x0F) as usize];
        if *slot == Some(fid) {
            *slot = None;
            trace!(function_id = fid, seq, "Discarding late response");
            return Delivery::Stale;
        }

        Delivery::Unexpected
    }

    /// Forget all tombstones. Used when every sequence number is blocked.
    pub fn forget_abandoned(&self) {
        self.state().abandoned = [None; 16];
    }

    /// Drop the pending request (its waiter sees the channel close) and all
    /// tombstones. Called when the socket the request went out on is gone.
    pub fn reset(&self) {
        let mut state = self.state();
        state.pending = None;
        state.abandoned = [None; 16];
    }
}

impl std::fmt::Debug for Correlator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator")
            .field("pending", &self.has_pending())
            .finish()
    }
}
