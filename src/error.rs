//! # Error Types
//!
//! Error handling for the connection engine.
//!
//! The variants fall into three groups a caller can tell apart:
//! - **Never connected**: `NotConnected`, `AlreadyConnected`
//! - **Per-call protocol errors**: `Timeout`, `InvalidParameter`,
//!   `FunctionNotSupported`, `UnknownError`, `WrongResponseLength`,
//!   `DeviceReplaced`, `StreamOutOfSync`
//! - **Caller mistakes**: `InvalidArgument`, `InvalidFormat`
//!
//! Losing an established connection is not an error at any call site; it is
//! reported through the `Disconnected` connection event.
//!
//! ## Example Usage
//! ```rust
//! use ipcon_protocol::core::base58;
//! use ipcon_protocol::error::{ProtocolError, Result};
//!
//! fn peer_id(uid: &str) -> Result<u32> {
//!     base58::parse_uid(uid)
//! }
//!
//! assert!(matches!(peer_id("0"), Err(ProtocolError::InvalidArgument(_))));
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Synchronization errors
    pub const ERR_LOCK_POISONED: &str = "Synchronization primitive poisoned";

    /// Connection errors
    pub const ERR_NOT_CONNECTED: &str = "Not connected";
    pub const ERR_CONNECTION_LOST: &str = "Connection lost while waiting for response";

    /// Argument validation
    pub const ERR_UNKNOWN_FUNCTION: &str = "Invalid function ID";
    pub const ERR_ALWAYS_TRUE: &str = "Response Expected flag cannot be changed for function ID";
    pub const ERR_NON_ASCII_SECRET: &str = "Authentication secret contains non-ASCII characters";
    pub const ERR_FOREIGN_DEVICE: &str = "Device handle is not registered with this connection";
    pub const ERR_RESERVED_PEER_ID: &str = "Peer id is reserved for the daemon itself, UID";

    /// Streamed transfers
    pub const ERR_STREAM_TOO_LONG: &str = "Streamed payload exceeds the maximum length";
}

/// ProtocolError is the primary error type for all protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Not connected")]
    NotConnected,

    #[error("Did not receive response for function {function_id} in time")]
    Timeout { function_id: u8 },

    #[error("Got invalid parameter for function {function_id}")]
    InvalidParameter { function_id: u8 },

    #[error("Function {function_id} is not supported")]
    FunctionNotSupported { function_id: u8 },

    #[error("Function {function_id} returned an unknown error code {code}")]
    UnknownError { function_id: u8, code: u8 },

    #[error("Expected response of {expected} bytes, got {actual} bytes")]
    WrongResponseLength {
        function_id: Option<u8>,
        expected: usize,
        actual: usize,
    },

    #[error("Device has been replaced")]
    DeviceReplaced,

    #[error("Streamed transfer for function {function_id} went out of sync")]
    StreamOutOfSync { function_id: u8 },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid payload format: {0}")]
    InvalidFormat(String),

    #[error("Invalid protocol header")]
    InvalidHeader,

    #[error("Packet payload too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
