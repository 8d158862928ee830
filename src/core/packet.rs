//! # Packet
//!
//! Fixed 8-byte header plus raw payload, as exchanged with the daemon.
//!
//! ```text
//! [PeerId(4, LE)] [Length(1)] [FunctionId(1)] [Seq<<4 | R<<3 | A<<2 (1)] [Error<<6 (1)] [Payload(Length - 8)]
//! ```
//!
//! `Length` counts the whole packet including the header, so one packet is
//! never larger than 255 bytes.

use crate::config::{HEADER_SIZE, MAX_PACKET_SIZE, MAX_PAYLOAD_SIZE};
use crate::error::{ProtocolError, Result};
use bytes::Bytes;

/// Error code carried in the top two bits of the last header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Ok,
    InvalidParameter,
    FunctionNotSupported,
    Unknown,
}

impl ErrorCode {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => ErrorCode::Ok,
            1 => ErrorCode::InvalidParameter,
            2 => ErrorCode::FunctionNotSupported,
            _ => ErrorCode::Unknown,
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            ErrorCode::Ok => 0,
            ErrorCode::InvalidParameter => 1,
            ErrorCode::FunctionNotSupported => 2,
            ErrorCode::Unknown => 3,
        }
    }
}

/// Decoded form of the 8-byte wire header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub peer_id: u32,
    pub length: u8,
    pub function_id: u8,
    pub sequence_number: u8,
    pub response_expected: bool,
    pub auth_present: bool,
    pub error_code: ErrorCode,
}

impl PacketHeader {
    /// Build a request header. `sequence_number` is masked to 4 bits.
    pub fn new(
        peer_id: u32,
        length: u8,
        function_id: u8,
        sequence_number: u8,
        response_expected: bool,
    ) -> Self {
        Self {
            peer_id,
            length,
            function_id,
            sequence_number: sequence_number & 0x0F,
            response_expected,
            auth_present: false,
            error_code: ErrorCode::Ok,
        }
    }

    #[inline]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let id = self.peer_id.to_le_bytes();
        let flags = ((self.sequence_number & 0x0F) << 4)
            | (u8::from(self.response_expected) << 3)
            | (u8::from(self.auth_present) << 2);

        [
            id[0],
            id[1],
            id[2],
            id[3],
            self.length,
            self.function_id,
            flags,
            self.error_code.bits() << 6,
        ]
    }

    /// Decode the first 8 bytes of `bytes`.
    ///
    /// Only the size of the slice is checked here; whether `length` is sane is
    /// up to the framing layer.
    #[inline]
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(ProtocolError::InvalidHeader);
        }

        Ok(Self {
            peer_id: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            length: bytes[4],
            function_id: bytes[5],
            sequence_number: (bytes[6] >> 4) & 0x0F,
            response_expected: (bytes[6] >> 3) & 0x01 == 1,
            auth_present: (bytes[6] >> 2) & 0x01 == 1,
            error_code: ErrorCode::from_bits(bytes[7] >> 6),
        })
    }

    /// Sequence number zero marks an unsolicited event.
    #[inline]
    pub fn is_event(&self) -> bool {
        self.sequence_number == 0
    }
}

/// A complete packet: header plus `length - 8` bytes of payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Bytes,
}

impl Packet {
    /// Build an outbound packet, filling in the length field.
    pub fn request(
        peer_id: u32,
        function_id: u8,
        sequence_number: u8,
        response_expected: bool,
        payload: impl Into<Bytes>,
    ) -> Result<Self> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::OversizedPacket(payload.len()));
        }

        let length = (HEADER_SIZE + payload.len()) as u8;
        Ok(Self {
            header: PacketHeader::new(
                peer_id,
                length,
                function_id,
                sequence_number,
                response_expected,
            ),
            payload,
        })
    }

    /// Serialize header and payload into one buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&self.header.encode());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse exactly one packet from `bytes`, which must hold at least
    /// `length` bytes. Trailing bytes are ignored.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let header = PacketHeader::decode(bytes)?;
        let length = header.length as usize;

        if length < HEADER_SIZE || length > MAX_PACKET_SIZE {
            return Err(ProtocolError::InvalidHeader);
        }
        if bytes.len() < length {
            return Err(ProtocolError::Custom(format!(
                "truncated packet: need {length} bytes, have {}",
                bytes.len()
            )));
        }

        Ok(Self {
            header,
            payload: Bytes::copy_from_slice(&bytes[HEADER_SIZE..length]),
        })
    }

    #[inline]
    pub fn peer_id(&self) -> u32 {
        self.header.peer_id
    }

    #[inline]
    pub fn function_id(&self) -> u8 {
        self.header.function_id
    }

    #[inline]
    pub fn sequence_number(&self) -> u8 {
        self.header.sequence_number
    }
}
