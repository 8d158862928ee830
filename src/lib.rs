//! # ipcon-protocol
//!
//! Async client for the IP connection protocol spoken by a hardware daemon
//! over TCP (default port 4223). One [`Connection`] multiplexes synchronous
//! request/response calls for many devices, unsolicited device callbacks and
//! enumeration announcements over a single socket.
//!
//! ## Layout
//! - [`core`]: packet header, stream framing, payload formats, base58 ids
//! - [`protocol`]: device handles, request correlation, authentication and
//!   callback dispatch
//! - [`service`]: the connection state machine and its background tasks
//! - [`transport`]: socket setup
//! - [`config`], [`utils`]: configuration, logging, timing and metrics
//!
//! ## Example
//! ```no_run
//! use ipcon_protocol::{Connection, ConnectionEventKind};
//!
//! # async fn run() -> ipcon_protocol::Result<()> {
//! let connection = Connection::new();
//! connection.register_enumerate_callback(|event| {
//!     println!("{} at {}", event.identity.uid, event.identity.position);
//! })?;
//! connection.register_connection_event(ConnectionEventKind::Disconnected, |event| {
//!     println!("lost connection: {event:?}");
//! })?;
//!
//! connection.connect("localhost", 4223).await?;
//! connection.enumerate().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use crate::config::{ClientConfig, LoggingConfig, NetworkConfig};
pub use crate::core::payload::{Format, Value};
pub use crate::error::{ProtocolError, Result};
pub use crate::protocol::device::{DeviceHandle, ResponseExpected};
pub use crate::protocol::dispatcher::{ConnectionEvent, ConnectionEventKind};
pub use crate::protocol::stream::{ChunkWritten, ReadChunk, WriteChunk};
pub use crate::protocol::message::{
    ConnectReason, ConnectionState, DisconnectReason, EnumerateEvent, EnumerationType, Identity,
};
pub use crate::service::Connection;
