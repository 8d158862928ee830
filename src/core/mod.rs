//! # Core Protocol Components
//!
//! Low-level packet handling, stream framing and payload encoding.
//!
//! ## Components
//! - **Packet**: the 8-byte header and raw payload
//! - **Codec**: Tokio codec that reassembles packets from a byte stream
//! - **Payload**: little-endian field packing driven by format strings
//! - **Base58**: device identifier parsing
//!
//! ## Wire Format
//! ```text
//! [PeerId(4)] [Length(1)] [FunctionId(1)] [Seq/Flags(1)] [Error(1)] [Payload(Length - 8)]
//! ```
//!
//! The length byte bounds a packet to 255 bytes, so reassembly never has to
//! buffer more than one maximum-size packet ahead.

pub mod base58;
pub mod codec;
pub mod packet;
pub mod payload;
