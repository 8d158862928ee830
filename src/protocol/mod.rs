//! # Protocol Layer
//!
//! Everything between raw packets and the connection: device handles and
//! their registry, request correlation, the authentication exchange and the
//! callback dispatcher.
//!
//! ## Components
//! - **Message**: reserved function ids, lifecycle reasons, enumerate events
//! - **Device / Registry**: per-device state and peer id routing
//! - **Correlator**: one pending request per device, matched by function id
//!   and sequence number
//! - **Handshake**: HMAC-SHA1 nonce exchange
//! - **Dispatcher**: ordered delivery of events to user handlers
//! - **Stream**: chunked transfers larger than one packet

pub mod correlator;
pub mod device;
pub mod dispatcher;
pub mod handshake;
pub mod message;
pub mod registry;
pub mod stream;

#[cfg(test)]
mod tests;
