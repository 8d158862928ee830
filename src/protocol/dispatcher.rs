//! Callback dispatch.
//!
//! The receive loop never runs user code. It pushes events onto one ordered
//! queue ([`DispatchQueue`]) that a single drain task consumes, so handlers
//! see events in arrival order and never run concurrently with each other.
//! Handlers are synchronous; work that needs to await (for example issuing a
//! request in response to an event) should be spawned onto the runtime.

use crate::core::packet::Packet;
use crate::core::payload::unpack;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::message::{
    ConnectReason, DisconnectReason, EnumerateEvent, CALLBACK_ENUMERATE,
};
use crate::protocol::registry::DeviceRegistry;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;
use tracing::{trace, warn};

/// Kind selector for connection event handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEventKind {
    Connected,
    Disconnected,
}

/// Synthetic lifecycle event delivered through the callback queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected(ConnectReason),
    Disconnected(DisconnectReason),
}

impl ConnectionEvent {
    pub fn kind(&self) -> ConnectionEventKind {
        match self {
            ConnectionEvent::Connected(_) => ConnectionEventKind::Connected,
            ConnectionEvent::Disconnected(_) => ConnectionEventKind::Disconnected,
        }
    }
}

/// Lifecycle notices queued for the drain task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MetaEvent {
    Connected(ConnectReason),
    /// `session` identifies the socket that was lost, so a notice about an
    /// already replaced socket can be recognized and ignored.
    Disconnected {
        reason: DisconnectReason,
        session: u64,
    },
}

#[derive(Debug)]
pub(crate) enum QueueItem {
    Meta(MetaEvent),
    Packet(Packet),
    Exit,
}

/// Sending half of the callback queue.
#[derive(Debug, Clone)]
pub(crate) struct DispatchQueue {
    tx: mpsc::UnboundedSender<QueueItem>,
}

impl DispatchQueue {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<QueueItem>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Append an item. Returns `false` once the drain task is gone.
    pub(crate) fn push(&self, item: QueueItem) -> bool {
        self.tx.send(item).is_ok()
    }
}

type EventFn = dyn Fn(&ConnectionEvent) + Send + Sync + 'static;
type EnumerateFn = dyn Fn(&EnumerateEvent) + Send + Sync + 'static;

#[derive(Default)]
struct Handlers {
    connected: Vec<Arc<EventFn>>,
    disconnected: Vec<Arc<EventFn>>,
    enumerate: Vec<Arc<EnumerateFn>>,
}

/// Registry of user handlers plus packet-to-handler routing.
pub struct Dispatcher {
    handlers: Arc<RwLock<Handlers>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(Handlers::default())),
        }
    }

    pub fn register_connection_event<F>(&self, kind: ConnectionEventKind, handler: F) -> Result<()>
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.write().map_err(|_| {
            ProtocolError::Custom(constants::ERR_LOCK_POISONED.to_string())
        })?;

        match kind {
            ConnectionEventKind::Connected => handlers.connected.push(Arc::new(handler)),
            ConnectionEventKind::Disconnected => handlers.disconnected.push(Arc::new(handler)),
        }
        Ok(())
    }

    pub fn register_enumerate<F>(&self, handler: F) -> Result<()>
    where
        F: Fn(&EnumerateEvent) + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.write().map_err(|_| {
            ProtocolError::Custom(constants::ERR_LOCK_POISONED.to_string())
        })?;
        handlers.enumerate.push(Arc::new(handler));
        Ok(())
    }

    pub fn has_enumerate_handlers(&self) -> bool {
        !self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .enumerate
            .is_empty()
    }

    /// Cheap pre-filter used by the receive loop so packets nobody listens
    /// for never enter the queue.
    pub fn wants(&self, packet: &Packet, registry: &DeviceRegistry) -> bool {
        if packet.function_id() == CALLBACK_ENUMERATE {
            return self.has_enumerate_handlers();
        }
        registry
            .lookup(packet.peer_id())
            .is_some_and(|device| device.has_callback(packet.function_id()))
    }

    /// Invoke every handler registered for `event`'s kind.
    pub fn fire(&self, event: &ConnectionEvent) -> usize {
        let targets: Vec<Arc<EventFn>> = {
            let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
            match event.kind() {
                ConnectionEventKind::Connected => handlers.connected.clone(),
                ConnectionEventKind::Disconnected => handlers.disconnected.clone(),
            }
        };

        for handler in &targets {
            guarded(|| handler(event));
        }
        targets.len()
    }

    /// Decode `packet` and run its handlers. Returns `false` if the packet
    /// was dropped as noise (no handler, unknown device, bad length).
    pub fn dispatch_packet(&self, packet: &Packet, registry: &DeviceRegistry) -> bool {
        if packet.function_id() == CALLBACK_ENUMERATE {
            return self.dispatch_enumerate(packet);
        }

        let Some(device) = registry.lookup(packet.peer_id()) else {
            trace!(peer_id = packet.peer_id(), "Dropping event for unknown device");
            return false;
        };
        let Some(slot) = device.callback(packet.function_id()) else {
            trace!(
                peer_id = packet.peer_id(),
                callback_id = packet.function_id(),
                "Dropping event without handler"
            );
            return false;
        };

        match unpack(&packet.payload, &slot.format) {
            Ok(values) => {
                guarded(|| (slot.handler)(&values));
                true
            }
            Err(e) => {
                trace!(
                    peer_id = packet.peer_id(),
                    callback_id = packet.function_id(),
                    error = %e,
                    "Dropping malformed event"
                );
                false
            }
        }
    }

    fn dispatch_enumerate(&self, packet: &Packet) -> bool {
        let targets = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .enumerate
            .clone();
        if targets.is_empty() {
            return false;
        }

        let event = match EnumerateEvent::decode(&packet.payload) {
            Ok(event) => event,
            Err(e) => {
                trace!(error = %e, "Dropping malformed enumerate event");
                return false;
            }
        };

        for handler in &targets {
            guarded(|| handler(&event));
        }
        true
    }
}

/// A panicking handler must not take the drain task down with it.
fn guarded(f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        warn!("Callback handler panicked");
    }
}
