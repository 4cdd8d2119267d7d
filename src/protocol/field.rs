//! Field type descriptors and field values.
//!
//! A protocol direction is declared as an ordered list of [`FieldType`]s.
//! Types can be parsed from the single-character codes used by emews
//! protocol tables:
//!
//! | Code          | Type         | Width |
//! |---------------|--------------|-------|
//! | `?` `b` `B`   | bool         | 1     |
//! | `h` / `H`     | i16 / u16    | 2     |
//! | `i` `l` / `I` `L` | i32 / u32 | 4  |
//! | `q` / `Q`     | i64 / u64    | 8     |
//! | `f` / `d`     | f32 / f64    | 4 / 8 |
//! | `s`           | byte string  | u32 length + bytes |
//!
//! `b` and `B` are accepted as aliases of `?`: any non-zero byte decodes as
//! `true`.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolDefinitionError;

/// Type of a single payload field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Bool,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    /// Variable-length byte string.
    Bytes,
}

impl FieldType {
    /// Parse a single field type code.
    pub fn from_code(code: char) -> Result<Self, ProtocolDefinitionError> {
        let field = match code {
            '?' | 'b' | 'B' => Self::Bool,
            'h' => Self::I16,
            'H' => Self::U16,
            'i' | 'l' => Self::I32,
            'I' | 'L' => Self::U32,
            'q' => Self::I64,
            'Q' => Self::U64,
            'f' => Self::F32,
            'd' => Self::F64,
            's' => Self::Bytes,
            other => return Err(ProtocolDefinitionError::UnknownFieldCode(other)),
        };
        Ok(field)
    }

    /// Parse a string of field type codes, e.g. `"LHs"`.
    pub fn parse(codes: &str) -> Result<Vec<Self>, ProtocolDefinitionError> {
        codes.chars().map(Self::from_code).collect()
    }

    /// Canonical code for this type.
    pub fn code(self) -> char {
        match self {
            Self::Bool => '?',
            Self::I16 => 'h',
            Self::U16 => 'H',
            Self::I32 => 'i',
            Self::U32 => 'I',
            Self::I64 => 'q',
            Self::U64 => 'Q',
            Self::F32 => 'f',
            Self::F64 => 'd',
            Self::Bytes => 's',
        }
    }

    /// Encoded width in bytes, `None` for byte strings.
    #[inline]
    pub fn width(self) -> Option<usize> {
        match self {
            Self::Bool => Some(1),
            Self::I16 | Self::U16 => Some(2),
            Self::I32 | Self::U32 | Self::F32 => Some(4),
            Self::I64 | Self::U64 | Self::F64 => Some(8),
            Self::Bytes => None,
        }
    }

    /// Check if this is the variable-length byte string type.
    #[inline]
    pub fn is_variable(self) -> bool {
        self == Self::Bytes
    }

    /// Decode a fixed-width value from the front of `buf`.
    ///
    /// Returns `None` for byte strings, which need their length from the
    /// payload's length table. The caller guarantees enough bytes remain.
    pub(crate) fn decode_fixed(self, buf: &mut Bytes) -> Option<Value> {
        let value = match self {
            Self::Bool => Value::Bool(buf.get_u8() != 0),
            Self::I16 => Value::I16(buf.get_i16()),
            Self::U16 => Value::U16(buf.get_u16()),
            Self::I32 => Value::I32(buf.get_i32()),
            Self::U32 => Value::U32(buf.get_u32()),
            Self::I64 => Value::I64(buf.get_i64()),
            Self::U64 => Value::U64(buf.get_u64()),
            Self::F32 => Value::F32(buf.get_f32()),
            Self::F64 => Value::F64(buf.get_f64()),
            Self::Bytes => return None,
        };
        Some(value)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bool => "bool",
            Self::I16 => "i16",
            Self::U16 => "u16",
            Self::I32 => "i32",
            Self::U32 => "u32",
            Self::I64 => "i64",
            Self::U64 => "u64",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::Bytes => "bytes",
        };
        write!(f, "{} ('{}')", name, self.code())
    }
}

/// A decoded or to-be-encoded field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Bytes(Bytes),
}

impl Value {
    /// The field type this value encodes as.
    pub fn field_type(&self) -> FieldType {
        match self {
            Self::Bool(_) => FieldType::Bool,
            Self::I16(_) => FieldType::I16,
            Self::U16(_) => FieldType::U16,
            Self::I32(_) => FieldType::I32,
            Self::U32(_) => FieldType::U32,
            Self::I64(_) => FieldType::I64,
            Self::U64(_) => FieldType::U64,
            Self::F32(_) => FieldType::F32,
            Self::F64(_) => FieldType::F64,
            Self::Bytes(_) => FieldType::Bytes,
        }
    }

    /// Append the big-endian encoding of this value.
    ///
    /// Byte strings write only their bytes; the length lives in the
    /// payload's length table.
    pub(crate) fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Self::Bool(v) => buf.put_u8(u8::from(*v)),
            Self::I16(v) => buf.put_i16(*v),
            Self::U16(v) => buf.put_u16(*v),
            Self::I32(v) => buf.put_i32(*v),
            Self::U32(v) => buf.put_u32(*v),
            Self::I64(v) => buf.put_i64(*v),
            Self::U64(v) => buf.put_u64(*v),
            Self::F32(v) => buf.put_f32(*v),
            Self::F64(v) => buf.put_f64(*v),
            Self::Bytes(v) => buf.put_slice(v),
        }
    }

    #[inline]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    #[inline]
    pub fn as_u16(&self) -> Option<u16> {
        match self {
            Self::U16(v) => Some(*v),
            _ => None,
        }
    }

    #[inline]
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Self::U32(v) => Some(*v),
            _ => None,
        }
    }

    #[inline]
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::U64(v) => Some(*v),
            _ => None,
        }
    }

    #[inline]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::I64(v) => Some(*v),
            _ => None,
        }
    }

    #[inline]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::F64(v) => Some(*v),
            _ => None,
        }
    }

    /// Borrow the bytes of a byte string value.
    #[inline]
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Bytes(v) => Some(v),
            _ => None,
        }
    }

    /// Borrow a byte string value as UTF-8 text.
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }
}

macro_rules! impl_from_scalar {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Self::$variant(v)
                }
            }
        )*
    };
}

impl_from_scalar! {
    bool => Bool,
    i16 => I16,
    u16 => U16,
    i32 => I32,
    u32 => U32,
    i64 => I64,
    u64 => U64,
    f32 => F32,
    f64 => F64,
    Bytes => Bytes,
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(v))
    }
}

impl From<&'static [u8]> for Value {
    fn from(v: &'static [u8]) -> Self {
        Self::Bytes(Bytes::from_static(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Bytes(Bytes::copy_from_slice(v.as_bytes()))
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Bytes(Bytes::from(v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_all_codes() {
        let fields = FieldType::parse("?bBhHiIlLqQfds").unwrap();
        assert_eq!(
            fields,
            vec![
                FieldType::Bool,
                FieldType::Bool,
                FieldType::Bool,
                FieldType::I16,
                FieldType::U16,
                FieldType::I32,
                FieldType::U32,
                FieldType::I32,
                FieldType::U32,
                FieldType::I64,
                FieldType::U64,
                FieldType::F32,
                FieldType::F64,
                FieldType::Bytes,
            ]
        );
    }

    #[test]
    fn test_unknown_code_rejected() {
        let err = FieldType::parse("Lx").unwrap_err();
        assert_eq!(err, ProtocolDefinitionError::UnknownFieldCode('x'));
        assert!(err.to_string().contains("'x'"));
    }

    #[test]
    fn test_widths() {
        assert_eq!(FieldType::Bool.width(), Some(1));
        assert_eq!(FieldType::U16.width(), Some(2));
        assert_eq!(FieldType::F32.width(), Some(4));
        assert_eq!(FieldType::U64.width(), Some(8));
        assert_eq!(FieldType::Bytes.width(), None);
        assert!(FieldType::Bytes.is_variable());
    }

    #[test]
    fn test_code_roundtrip() {
        for code in "?hHiIqQfds".chars() {
            assert_eq!(FieldType::from_code(code).unwrap().code(), code);
        }
    }

    #[test]
    fn test_byte_codes_are_booleans() {
        assert_eq!(FieldType::from_code('b').unwrap(), FieldType::Bool);
        assert_eq!(FieldType::from_code('B').unwrap().code(), '?');

        let mut buf = Bytes::from_static(&[0, 1, 7]);
        assert_eq!(FieldType::Bool.decode_fixed(&mut buf), Some(Value::Bool(false)));
        assert_eq!(FieldType::Bool.decode_fixed(&mut buf), Some(Value::Bool(true)));
        assert_eq!(FieldType::Bool.decode_fixed(&mut buf), Some(Value::Bool(true)));
    }

    #[test]
    fn test_encode_big_endian() {
        let mut buf = BytesMut::new();
        Value::U32(0x0102_0304).encode_into(&mut buf);
        Value::I16(-2).encode_into(&mut buf);
        Value::Bool(true).encode_into(&mut buf);
        assert_eq!(&buf[..], &[1, 2, 3, 4, 0xFF, 0xFE, 1]);
    }

    #[test]
    fn test_decode_fixed() {
        let mut buf = Bytes::from_static(&[0, 0, 0, 42, 0, 7]);
        assert_eq!(FieldType::U32.decode_fixed(&mut buf), Some(Value::U32(42)));
        assert_eq!(FieldType::U16.decode_fixed(&mut buf), Some(Value::U16(7)));
        assert!(buf.is_empty());
        assert_eq!(FieldType::Bytes.decode_fixed(&mut buf), None);
    }

    #[test]
    fn test_value_conversions() {
        assert_eq!(Value::from(42u32).as_u32(), Some(42));
        assert_eq!(Value::from("hub").as_str(), Some("hub"));
        assert_eq!(Value::from(7u16).as_u32(), None);
        assert_eq!(Value::from(vec![1u8, 2]).field_type(), FieldType::Bytes);
    }
}
