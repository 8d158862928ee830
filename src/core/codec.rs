//! Stream framing for the receive loop.
//!
//! The header's length byte is self-describing, so framing is: wait for 8
//! bytes, peek `length`, wait for `length` bytes, slice off one packet and
//! leave the remainder in the buffer for the next call. This handles split
//! and coalesced TCP segments alike.

use crate::config::{HEADER_SIZE, MAX_PACKET_SIZE};
use crate::core::packet::{Packet, PacketHeader};
use crate::error::{ProtocolError, Result};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

/// Tokio codec for TFP packets.
#[derive(Debug, Default, Clone, Copy)]
pub struct PacketCodec;

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let length = src[4] as usize;

        // A length below the header size can never be satisfied; the stream
        // is out of sync and the connection has to be dropped.
        if length < HEADER_SIZE {
            warn!(length, "Received packet with invalid length field");
            return Err(ProtocolError::InvalidHeader);
        }

        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(length);
        let header = PacketHeader::decode(&frame)?;
        frame.advance(HEADER_SIZE);

        Ok(Some(Packet {
            header,
            payload: frame.freeze(),
        }))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<()> {
        let total = HEADER_SIZE + item.payload.len();
        if total > MAX_PACKET_SIZE {
            return Err(ProtocolError::OversizedPacket(item.payload.len()));
        }

        let mut header = item.header;
        header.length = total as u8;

        dst.reserve(total);
        dst.put_slice(&header.encode());
        dst.put_slice(&item.payload);
        Ok(())
    }
}
