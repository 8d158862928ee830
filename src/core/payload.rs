//! # Payload Fields
//!
//! Little-endian packing of request payloads and unpacking of responses and
//! callback payloads, driven by a compact field format string.
//!
//! A format is a whitespace-separated list of fields, each an optional repeat
//! count followed by a type tag:
//!
//! | tag | type | size |
//! |-----|------|------|
//! | `b` / `B` | `i8` / `u8` | 1 |
//! | `h` / `H` | `i16` / `u16` | 2 |
//! | `i` / `I` | `i32` / `u32` | 4 |
//! | `q` / `Q` | `i64` / `u64` | 8 |
//! | `f` / `d` | `f32` / `f64` | 4 / 8 |
//! | `?` | `bool` | 1, or one bit per flag when repeated |
//! | `c` | `char` (single byte) | 1 |
//! | `s` | fixed-length string, count is the byte length | count |
//!
//! A repeat count above one yields a [`Value::Array`], except for `s` which
//! always yields a [`Value::String`]. The enumerate callback, for example, is
//! `"8s 8s c 3B 3B H B"`.
//!
//! Value/type mismatches and malformed formats are programming errors and
//! surface as [`ProtocolError::InvalidFormat`].

use crate::error::{ProtocolError, Result};
use bytes::{Buf, BufMut};
use std::fmt;
use std::str::FromStr;

/// Primitive type of one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    Bool,
    Char,
    String,
}

impl FieldType {
    fn from_tag(tag: char) -> Option<Self> {
        Some(match tag {
            'b' => FieldType::I8,
            'B' => FieldType::U8,
            'h' => FieldType::I16,
            'H' => FieldType::U16,
            'i' => FieldType::I32,
            'I' => FieldType::U32,
            'q' => FieldType::I64,
            'Q' => FieldType::U64,
            'f' => FieldType::F32,
            'd' => FieldType::F64,
            '?' => FieldType::Bool,
            'c' => FieldType::Char,
            's' => FieldType::String,
            _ => return None,
        })
    }

    fn tag(self) -> char {
        match self {
            FieldType::I8 => 'b',
            FieldType::U8 => 'B',
            FieldType::I16 => 'h',
            FieldType::U16 => 'H',
            FieldType::I32 => 'i',
            FieldType::U32 => 'I',
            FieldType::I64 => 'q',
            FieldType::U64 => 'Q',
            FieldType::F32 => 'f',
            FieldType::F64 => 'd',
            FieldType::Bool => '?',
            FieldType::Char => 'c',
            FieldType::String => 's',
        }
    }

    /// Wire size of a single element.
    fn width(self) -> usize {
        match self {
            FieldType::I8
            | FieldType::U8
            | FieldType::Bool
            | FieldType::Char
            | FieldType::String => 1,
            FieldType::I16 | FieldType::U16 => 2,
            FieldType::I32 | FieldType::U32 | FieldType::F32 => 4,
            FieldType::I64 | FieldType::U64 | FieldType::F64 => 8,
        }
    }
}

/// One field of a format: a type and a repeat count (at least 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub ty: FieldType,
    pub count: usize,
}

impl Field {
    /// Bytes this field occupies on the wire.
    pub fn size(&self) -> usize {
        match self.ty {
            FieldType::Bool if self.count > 1 => self.count.div_ceil(8),
            ty => ty.width() * self.count,
        }
    }

    fn is_array(&self) -> bool {
        self.count > 1 && self.ty != FieldType::String
    }
}

/// Parsed field format, reusable for packing and unpacking.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Format {
    fields: Vec<Field>,
}

impl Format {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Total payload size described by this format.
    pub fn size(&self) -> usize {
        self.fields.iter().map(Field::size).sum()
    }
}

impl FromStr for Format {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        let mut fields = Vec::new();

        for token in s.split_whitespace() {
            let split = token
                .find(|c: char| !c.is_ascii_digit())
                .ok_or_else(|| ProtocolError::InvalidFormat(format!("missing type tag in '{token}'")))?;
            let (digits, rest) = token.split_at(split);

            let mut chars = rest.chars();
            let tag = chars.next().ok_or_else(|| {
                ProtocolError::InvalidFormat(format!("missing type tag in '{token}'"))
            })?;
            if chars.next().is_some() {
                return Err(ProtocolError::InvalidFormat(format!(
                    "unexpected trailing characters in '{token}'"
                )));
            }

            let ty = FieldType::from_tag(tag)
                .ok_or_else(|| ProtocolError::InvalidFormat(format!("unknown type tag '{tag}'")))?;
            let count = if digits.is_empty() {
                1
            } else {
                digits
                    .parse::<usize>()
                    .map_err(|e| ProtocolError::InvalidFormat(format!("bad count in '{token}': {e}")))?
            };
            if count == 0 {
                return Err(ProtocolError::InvalidFormat(format!(
                    "zero repeat count in '{token}'"
                )));
            }

            fields.push(Field { ty, count });
        }

        Ok(Self { fields })
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            if field.count > 1 || field.ty == FieldType::String {
                write!(f, "{}", field.count)?;
            }
            write!(f, "{}", field.ty.tag())?;
        }
        Ok(())
    }
}

/// A decoded or to-be-encoded field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Bool(bool),
    Char(char),
    String(String),
    Array(Vec<Value>),
}

impl Value {
    pub fn as_u8(&self) -> Option<u8> {
        match self {
            Value::U8(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u16(&self) -> Option<u16> {
        match self {
            Value::U16(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::U32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::I32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_char(&self) -> Option<char> {
        match self {
            Value::Char(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(v) => Some(v),
            _ => None,
        }
    }

    /// Fixed-size `u8` array, e.g. a 3-part version number.
    pub fn as_u8_array<const N: usize>(&self) -> Option<[u8; N]> {
        let items = self.as_array()?;
        if items.len() != N {
            return None;
        }
        let mut out = [0u8; N];
        for (slot, item) in out.iter_mut().zip(items) {
            *slot = item.as_u8()?;
        }
        Some(out)
    }
}

fn mismatch(expected: FieldType, got: &Value) -> ProtocolError {
    ProtocolError::InvalidFormat(format!(
        "value {got:?} does not match field type '{}'",
        expected.tag()
    ))
}

/// Byte-sized character: the wire carries one byte per char.
fn char_byte(c: char) -> Result<u8> {
    u8::try_from(u32::from(c))
        .map_err(|_| ProtocolError::InvalidFormat(format!("character '{c}' does not fit one byte")))
}

fn put_scalar(buf: &mut Vec<u8>, ty: FieldType, value: &Value) -> Result<()> {
    match (ty, value) {
        (FieldType::I8, Value::I8(v)) => buf.put_i8(*v),
        (FieldType::U8, Value::U8(v)) => buf.put_u8(*v),
        (FieldType::I16, Value::I16(v)) => buf.put_i16_le(*v),
        (FieldType::U16, Value::U16(v)) => buf.put_u16_le(*v),
        (FieldType::I32, Value::I32(v)) => buf.put_i32_le(*v),
        (FieldType::U32, Value::U32(v)) => buf.put_u32_le(*v),
        (FieldType::I64, Value::I64(v)) => buf.put_i64_le(*v),
        (FieldType::U64, Value::U64(v)) => buf.put_u64_le(*v),
        (FieldType::F32, Value::F32(v)) => buf.put_f32_le(*v),
        (FieldType::F64, Value::F64(v)) => buf.put_f64_le(*v),
        (FieldType::Bool, Value::Bool(v)) => buf.put_u8(u8::from(*v)),
        (FieldType::Char, Value::Char(c)) => buf.put_u8(char_byte(*c)?),
        (ty, other) => return Err(mismatch(ty, other)),
    }
    Ok(())
}

fn get_scalar(buf: &mut &[u8], ty: FieldType) -> Value {
    match ty {
        FieldType::I8 => Value::I8(buf.get_i8()),
        FieldType::U8 => Value::U8(buf.get_u8()),
        FieldType::I16 => Value::I16(buf.get_i16_le()),
        FieldType::U16 => Value::U16(buf.get_u16_le()),
        FieldType::I32 => Value::I32(buf.get_i32_le()),
        FieldType::U32 => Value::U32(buf.get_u32_le()),
        FieldType::I64 => Value::I64(buf.get_i64_le()),
        FieldType::U64 => Value::U64(buf.get_u64_le()),
        FieldType::F32 => Value::F32(buf.get_f32_le()),
        FieldType::F64 => Value::F64(buf.get_f64_le()),
        FieldType::Bool => Value::Bool(buf.get_u8() != 0),
        FieldType::Char | FieldType::String => Value::Char(char::from(buf.get_u8())),
    }
}

/// Pack `values` according to `format`. There must be exactly one value per
/// field.
pub fn pack(values: &[Value], format: &Format) -> Result<Vec<u8>> {
    if values.len() != format.fields.len() {
        return Err(ProtocolError::InvalidFormat(format!(
            "format '{format}' has {} fields, got {} values",
            format.fields.len(),
            values.len()
        )));
    }

    let mut buf = Vec::with_capacity(format.size());

    for (field, value) in format.fields.iter().zip(values) {
        match field.ty {
            FieldType::String => {
                let s = value.as_str().ok_or_else(|| mismatch(field.ty, value))?;
                let mut bytes = s.chars().map(char_byte).collect::<Result<Vec<u8>>>()?;
                bytes.resize(field.count, 0);
                buf.put_slice(&bytes);
            }
            FieldType::Bool if field.count > 1 => {
                let items = array_of(field, value)?;
                let mut bits = vec![0u8; field.size()];
                for (i, item) in items.iter().enumerate() {
                    if item.as_bool().ok_or_else(|| mismatch(field.ty, item))? {
                        bits[i / 8] |= 1 << (i % 8);
                    }
                }
                buf.put_slice(&bits);
            }
            ty if field.is_array() => {
                for item in array_of(field, value)? {
                    put_scalar(&mut buf, ty, item)?;
                }
            }
            ty => put_scalar(&mut buf, ty, value)?,
        }
    }

    Ok(buf)
}

fn array_of<'a>(field: &Field, value: &'a Value) -> Result<&'a [Value]> {
    let items = value.as_array().ok_or_else(|| mismatch(field.ty, value))?;
    if items.len() != field.count {
        return Err(ProtocolError::InvalidFormat(format!(
            "array field '{}{}' got {} elements",
            field.count,
            field.ty.tag(),
            items.len()
        )));
    }
    Ok(items)
}

/// Unpack `bytes` according to `format`.
///
/// The buffer must be exactly `format.size()` long; anything else is reported
/// as [`ProtocolError::WrongResponseLength`] so callers can treat it like a
/// length-contract violation.
pub fn unpack(bytes: &[u8], format: &Format) -> Result<Vec<Value>> {
    let expected = format.size();
    if bytes.len() != expected {
        return Err(ProtocolError::WrongResponseLength {
            function_id: None,
            expected,
            actual: bytes.len(),
        });
    }

    let mut buf = bytes;
    let mut values = Vec::with_capacity(format.fields.len());

    for field in &format.fields {
        let value = match field.ty {
            FieldType::String => {
                let raw = &buf[..field.count];
                let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
                let s: String = raw[..end].iter().copied().map(char::from).collect();
                buf.advance(field.count);
                Value::String(s)
            }
            FieldType::Bool if field.count > 1 => {
                let bits = &buf[..field.size()];
                let flags = (0..field.count)
                    .map(|i| Value::Bool(bits[i / 8] & (1 << (i % 8)) != 0))
                    .collect();
                buf.advance(field.size());
                Value::Array(flags)
            }
            ty if field.is_array() => {
                Value::Array((0..field.count).map(|_| get_scalar(&mut buf, ty)).collect())
            }
            ty => get_scalar(&mut buf, ty),
        };
        values.push(value);
    }

    Ok(values)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_enumerate_format() {
        let format: Format = "8s 8s c 3B 3B H B".parse().unwrap();
        assert_eq!(format.fields().len(), 7);
        assert_eq!(format.size(), 26);
        assert_eq!(format.to_string(), "8s 8s c 3B 3B H B");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!("3".parse::<Format>(), Err(ProtocolError::InvalidFormat(_))));
        assert!(matches!("x".parse::<Format>(), Err(ProtocolError::InvalidFormat(_))));
        assert!(matches!("0B".parse::<Format>(), Err(ProtocolError::InvalidFormat(_))));
        assert!(matches!("BH".parse::<Format>(), Err(ProtocolError::InvalidFormat(_))));
        assert!("".parse::<Format>().unwrap().fields().is_empty());
    }

    #[test]
    fn test_little_endian_scalars() {
        let format: Format = "H i b".parse().unwrap();
        let bytes = pack(&[Value::U16(0x0102), Value::I32(-2), Value::I8(-1)], &format).unwrap();
        assert_eq!(bytes, vec![0x02, 0x01, 0xFE, 0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(
            unpack(&bytes, &format).unwrap(),
            vec![Value::U16(0x0102), Value::I32(-2), Value::I8(-1)]
        );
    }

    #[test]
    fn test_bool_array_packs_bits() {
        let format: Format = "10?".parse().unwrap();
        let flags: Vec<Value> = (0..10).map(|i| Value::Bool(i % 3 == 0)).collect();
        let bytes = pack(&[Value::Array(flags.clone())], &format).unwrap();
        assert_eq!(bytes, vec![0b0100_1001, 0b0000_0010]);
        assert_eq!(unpack(&bytes, &format).unwrap(), vec![Value::Array(flags)]);
    }

    #[test]
    fn test_string_padding_and_truncation() {
        let format: Format = "4s".parse().unwrap();
        assert_eq!(
            pack(&[Value::String("ab".into())], &format).unwrap(),
            b"ab\0\0".to_vec()
        );
        assert_eq!(
            pack(&[Value::String("abcdef".into())], &format).unwrap(),
            b"abcd".to_vec()
        );
        assert_eq!(
            unpack(b"ab\0x", &format).unwrap(),
            vec![Value::String("ab".into())]
        );
    }

    #[test]
    fn test_type_mismatch_is_format_error() {
        let format: Format = "B".parse().unwrap();
        assert!(matches!(
            pack(&[Value::U16(1)], &format),
            Err(ProtocolError::InvalidFormat(_))
        ));
        assert!(matches!(pack(&[], &format), Err(ProtocolError::InvalidFormat(_))));
    }

    #[test]
    fn test_unpack_length_mismatch() {
        let format: Format = "I".parse().unwrap();
        assert!(matches!(
            unpack(&[1, 2, 3], &format),
            Err(ProtocolError::WrongResponseLength {
                expected: 4,
                actual: 3,
                ..
            })
        ));
    }

    #[test]
    fn test_u8_array_helper() {
        let value = Value::Array(vec![Value::U8(2), Value::U8(1), Value::U8(0)]);
        assert_eq!(value.as_u8_array::<3>(), Some([2, 1, 0]));
        assert_eq!(value.as_u8_array::<2>(), None);
    }
}
