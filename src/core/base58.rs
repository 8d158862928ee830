//! Base-58 device identifiers.
//!
//! Devices are addressed on the wire by a 32-bit peer id but are labelled
//! with a base-58 string. Legacy identifiers decode to more than 32 bits and
//! are folded down with [`uid64_to_uid32`].

use crate::error::{ProtocolError, Result};

/// Digits in value order. `0`, `I`, `O` and `l` are not part of the alphabet.
pub const ALPHABET: &[u8; 58] = b"123456789abcdefghijkmnopqrstuvwxyzABCDEFGHJKLMNPQRSTUVWXYZ";

const RADIX: u64 = 58;

fn digit_value(c: u8) -> Option<u64> {
    ALPHABET.iter().position(|&a| a == c).map(|i| i as u64)
}

/// Encode a numeric identifier.
pub fn encode(mut value: u64) -> String {
    let mut digits = Vec::with_capacity(11);
    loop {
        digits.push(ALPHABET[(value % RADIX) as usize]);
        value /= RADIX;
        if value == 0 {
            break;
        }
    }
    digits.reverse();
    digits.into_iter().map(char::from).collect()
}

/// Decode a base-58 string into a 64-bit value.
///
/// Fails with [`ProtocolError::InvalidArgument`] on an empty string, on a
/// character outside the alphabet, or if the value does not fit 64 bits.
pub fn decode(encoded: &str) -> Result<u64> {
    if encoded.is_empty() {
        return Err(ProtocolError::InvalidArgument(
            "empty identifier".to_string(),
        ));
    }

    encoded.bytes().enumerate().try_fold(0u64, |acc, (idx, c)| {
        let digit = digit_value(c).ok_or_else(|| {
            ProtocolError::InvalidArgument(format!(
                "invalid character '{}' at index {idx} in identifier '{encoded}'",
                char::from(c)
            ))
        })?;

        acc.checked_mul(RADIX)
            .and_then(|v| v.checked_add(digit))
            .ok_or_else(|| {
                ProtocolError::InvalidArgument(format!("identifier '{encoded}' is too large"))
            })
    })
}

/// Fold a legacy 64-bit identifier into the 32-bit peer id space.
pub fn uid64_to_uid32(uid64: u64) -> u32 {
    let value1 = uid64 & 0xFFFF_FFFF;
    let value2 = (uid64 >> 32) & 0xFFFF_FFFF;

    let folded = (value1 & 0x0000_0FFF)
        | ((value1 & 0x0F00_0000) >> 12)
        | ((value2 & 0x0000_003F) << 16)
        | ((value2 & 0x000F_0000) << 6)
        | ((value2 & 0x3F00_0000) << 2);

    folded as u32
}

/// Parse a public identifier into the peer id used on the wire.
pub fn parse_uid(encoded: &str) -> Result<u32> {
    let value = decode(encoded)?;
    Ok(u32::try_from(value).unwrap_or_else(|_| uid64_to_uid32(value)))
}
