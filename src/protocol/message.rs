//! Reserved function ids and the fixed-format events of the connection.

use crate::core::base58;
use crate::core::payload::{unpack, Format, Value};
use crate::error::{ProtocolError, Result};
use std::sync::OnceLock;

/// Broadcast request asking every device to announce itself.
pub const FUNCTION_ENUMERATE: u8 = 254;
/// Event carrying one enumerate announcement.
pub const CALLBACK_ENUMERATE: u8 = 253;
/// Liveness probe, sent to peer id 0 without response.
pub const FUNCTION_DISCONNECT_PROBE: u8 = 128;
/// Common identity getter every device implements.
pub const FUNCTION_GET_IDENTITY: u8 = 255;

/// Peer id of the daemon itself (base-58 `"2"`).
pub const BRICK_DAEMON_UID: u32 = 1;
/// Daemon function returning a 4-byte server nonce.
pub const FUNCTION_GET_AUTHENTICATION_NONCE: u8 = 1;
/// Daemon function taking the client nonce and HMAC digest.
pub const FUNCTION_AUTHENTICATE: u8 = 2;

const ENUMERATE_FORMAT: &str = "8s 8s c 3B 3B H B";
const IDENTITY_FORMAT: &str = "8s 8s c 3B 3B H";

/// Why a connection was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReason {
    /// `connect()` was called
    Requested,
    /// The reconnect loop re-established a lost connection
    AutoReconnect,
}

/// Why a connection went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect()` was called
    Requested,
    /// Read or write on the socket failed
    Error,
    /// The peer closed the socket
    Shutdown,
}

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    ReconnectPending,
}

impl ConnectionState {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::ReconnectPending,
            _ => ConnectionState::Disconnected,
        }
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::ReconnectPending => 3,
        }
    }
}

/// What an enumerate announcement reports about a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumerationType {
    /// Answer to an enumerate request
    Available,
    /// Device was newly attached
    Connected,
    /// Device was removed; only `uid` and the type are meaningful
    Disconnected,
    Other(u8),
}

impl From<u8> for EnumerationType {
    fn from(v: u8) -> Self {
        match v {
            0 => EnumerationType::Available,
            1 => EnumerationType::Connected,
            2 => EnumerationType::Disconnected,
            other => EnumerationType::Other(other),
        }
    }
}

/// Identity block shared by the enumerate event and `get_identity`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub uid: String,
    /// Empty when the device sits directly on the daemon's host.
    pub connected_uid: String,
    pub position: char,
    pub hardware_version: [u8; 3],
    pub firmware_version: [u8; 3],
    pub device_identifier: u16,
}

/// One decoded enumerate callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumerateEvent {
    pub identity: Identity,
    pub enumeration_type: EnumerationType,
}

impl EnumerateEvent {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let values = unpack(payload, enumerate_format())?;
        let identity = identity_from_values(&values)?;
        let enumeration_type = field(&values, 6, Value::as_u8)?.into();
        Ok(Self {
            identity,
            enumeration_type,
        })
    }
}

impl Identity {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let values = unpack(payload, identity_format())?;
        identity_from_values(&values)
    }

    /// Wire size of an identity response.
    pub fn size() -> usize {
        identity_format().size()
    }

    /// Peer id derived from `uid`.
    pub fn peer_id(&self) -> Result<u32> {
        base58::parse_uid(&self.uid)
    }
}

fn enumerate_format() -> &'static Format {
    static FORMAT: OnceLock<Format> = OnceLock::new();
    FORMAT.get_or_init(|| ENUMERATE_FORMAT.parse().unwrap_or_default())
}

fn identity_format() -> &'static Format {
    static FORMAT: OnceLock<Format> = OnceLock::new();
    FORMAT.get_or_init(|| IDENTITY_FORMAT.parse().unwrap_or_default())
}

fn field<'a, T>(values: &'a [Value], idx: usize, get: impl Fn(&'a Value) -> Option<T>) -> Result<T> {
    values
        .get(idx)
        .and_then(get)
        .ok_or_else(|| ProtocolError::InvalidFormat(format!("identity field {idx} has wrong type")))
}

fn identity_from_values(values: &[Value]) -> Result<Identity> {
    Ok(Identity {
        uid: field(values, 0, Value::as_str)?.to_string(),
        connected_uid: field(values, 1, Value::as_str)?.to_string(),
        position: field(values, 2, Value::as_char)?,
        hardware_version: field(values, 3, Value::as_u8_array::<3>)?,
        firmware_version: field(values, 4, Value::as_u8_array::<3>)?,
        device_identifier: field(values, 5, Value::as_u16)?,
    })
}

/// Build an enumerate payload. Used by the in-process stub daemon in tests
/// and by anyone simulating a device.
pub fn encode_enumerate(event: &EnumerateEvent) -> Result<Vec<u8>> {
    let id = &event.identity;
    let kind = match event.enumeration_type {
        EnumerationType::Available => 0,
        EnumerationType::Connected => 1,
        EnumerationType::Disconnected => 2,
        EnumerationType::Other(v) => v,
    };
    crate::core::payload::pack(
        &[
            Value::String(id.uid.clone()),
            Value::String(id.connected_uid.clone()),
            Value::Char(id.position),
            Value::Array(id.hardware_version.iter().map(|v| Value::U8(*v)).collect()),
            Value::Array(id.firmware_version.iter().map(|v| Value::U8(*v)).collect()),
            Value::U16(id.device_identifier),
            Value::U8(kind),
        ],
        enumerate_format(),
    )
}
