//! Wire format encoding and decoding.
//!
//! Every message is a length-prefixed envelope:
//! ```text
//! ┌──────────────┬──────────┬─────────────┬────────────────┬─────────┐
//! │ Total length │ Category │ Protocol ID │ Request number │ Payload │
//! │ 4 bytes      │ 2 bytes  │ 2 bytes     │ 4 bytes        │ N bytes │
//! │ uint32 BE    │ uint16 BE│ uint16 BE   │ uint32 BE      │         │
//! └──────────────┴──────────┴─────────────┴────────────────┴─────────┘
//! ```
//!
//! `total_length` counts everything after itself (`8 + N`). Inside the
//! payload, the `u32` lengths of all byte-string fields come first, in field
//! declaration order, followed by every field value in declaration order.
//! Byte strings contribute only their raw bytes at their position.
//!
//! All multi-byte integers are Big Endian.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::field::{FieldType, Value};
use crate::error::{ProtocolDefinitionError, WireError};

/// Size of the length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Size of the envelope header that follows the length prefix.
pub const ENVELOPE_HEADER_SIZE: usize = 8;

/// Length prefix plus envelope header.
pub const ENVELOPE_PREFIX_SIZE: usize = LENGTH_PREFIX_SIZE + ENVELOPE_HEADER_SIZE;

/// Protocol id reserved for peer NACK responses.
pub const NACK_PROTOCOL_ID: u16 = 0;

/// Request number used for fire-and-forget requests.
pub const FIRE_AND_FORGET: u32 = 0;

/// Default maximum envelope size (16 MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Message direction carried in the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Category {
    Request = 0,
    Response = 1,
}

impl Category {
    /// Decode a category code, `None` if unknown.
    #[inline]
    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            0 => Some(Self::Request),
            1 => Some(Self::Response),
            _ => None,
        }
    }

    #[inline]
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request => f.write_str("request"),
            Self::Response => f.write_str("response"),
        }
    }
}

/// Decoded envelope prefix (length prefix plus header).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeHeader {
    /// Bytes following the length prefix.
    pub total_length: u32,
    /// Raw category code, see [`Category`].
    pub category: u16,
    /// Protocol identifier (0 = NACK in responses).
    pub protocol_id: u16,
    /// Request number (0 = fire-and-forget).
    pub request_number: u32,
}

impl EnvelopeHeader {
    /// Create a header for a payload of `payload_length` bytes.
    pub fn new(category: Category, protocol_id: u16, request_number: u32, payload_length: u32) -> Self {
        Self {
            total_length: ENVELOPE_HEADER_SIZE as u32 + payload_length,
            category: category.as_u16(),
            protocol_id,
            request_number,
        }
    }

    /// Encode the prefix to bytes (Big Endian).
    pub fn encode(&self) -> [u8; ENVELOPE_PREFIX_SIZE] {
        let mut buf = [0u8; ENVELOPE_PREFIX_SIZE];
        buf[0..4].copy_from_slice(&self.total_length.to_be_bytes());
        buf[4..6].copy_from_slice(&self.category.to_be_bytes());
        buf[6..8].copy_from_slice(&self.protocol_id.to_be_bytes());
        buf[8..12].copy_from_slice(&self.request_number.to_be_bytes());
        buf
    }

    /// Decode the prefix from bytes.
    ///
    /// Returns `None` if buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < ENVELOPE_PREFIX_SIZE {
            return None;
        }
        Some(Self {
            total_length: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            category: u16::from_be_bytes([buf[4], buf[5]]),
            protocol_id: u16::from_be_bytes([buf[6], buf[7]]),
            request_number: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        })
    }

    /// Payload length implied by `total_length`.
    #[inline]
    pub fn payload_length(&self) -> Option<u32> {
        self.total_length.checked_sub(ENVELOPE_HEADER_SIZE as u32)
    }

    /// Check the length prefix against the header size and a maximum.
    pub fn validate(&self, max_message_size: u32) -> Result<(), WireError> {
        validate_length(self.total_length, max_message_size)
    }

    #[inline]
    pub fn category(&self) -> Option<Category> {
        Category::from_u16(self.category)
    }

    /// Check if this is a NACK response.
    #[inline]
    pub fn is_nack(&self) -> bool {
        self.category() == Some(Category::Response) && self.protocol_id == NACK_PROTOCOL_ID
    }
}

/// Check a length prefix value.
pub fn validate_length(total_length: u32, max_message_size: u32) -> Result<(), WireError> {
    if total_length < ENVELOPE_HEADER_SIZE as u32 {
        return Err(WireError::EnvelopeTooShort(total_length));
    }
    if total_length > max_message_size {
        return Err(WireError::EnvelopeTooLarge {
            length: total_length,
            max: max_message_size,
        });
    }
    Ok(())
}

/// Build the NACK a node sends when it rejects a request.
pub fn build_nack(request_number: u32) -> Bytes {
    let header = EnvelopeHeader::new(Category::Response, NACK_PROTOCOL_ID, request_number, 0);
    Bytes::copy_from_slice(&header.encode())
}

/// Precomputed layout of one direction.
#[derive(Debug, Clone)]
enum Layout {
    /// Direction carries no payload.
    Empty,
    /// Only fixed-width fields; total size known up front.
    Fixed { payload_len: usize },
    /// At least one byte string; `fixed_len` excludes the length table.
    Variable { fixed_len: usize, string_count: usize },
}

/// Packer/unpacker for one direction of one protocol.
///
/// `None` fields at construction means the direction carries no payload.
#[derive(Debug, Clone)]
pub struct WireFormat {
    protocol_id: u16,
    category: Category,
    fields: Vec<FieldType>,
    layout: Layout,
}

impl WireFormat {
    /// Create a wire format from field descriptors.
    pub fn new(protocol_id: u16, category: Category, fields: Option<Vec<FieldType>>) -> Self {
        let fields = fields.unwrap_or_default();
        let fixed_len: usize = fields.iter().filter_map(|f| f.width()).sum();
        let string_count = fields.iter().filter(|f| f.is_variable()).count();

        let layout = if fields.is_empty() {
            Layout::Empty
        } else if string_count == 0 {
            Layout::Fixed {
                payload_len: fixed_len,
            }
        } else {
            Layout::Variable {
                fixed_len,
                string_count,
            }
        };

        Self {
            protocol_id,
            category,
            fields,
            layout,
        }
    }

    /// Create a wire format from a string of field codes.
    ///
    /// # Example
    ///
    /// ```
    /// use emews_net::protocol::{Category, Value, WireFormat};
    ///
    /// let format = WireFormat::from_codes(133, Category::Request, Some("LH")).unwrap();
    /// let packed = format.pack(1, &[Value::U32(7), Value::U16(2)]).unwrap();
    /// assert_eq!(packed.len(), 12 + 6);
    /// ```
    pub fn from_codes(
        protocol_id: u16,
        category: Category,
        codes: Option<&str>,
    ) -> Result<Self, ProtocolDefinitionError> {
        let fields = codes.map(FieldType::parse).transpose()?;
        Ok(Self::new(protocol_id, category, fields))
    }

    #[inline]
    pub fn protocol_id(&self) -> u16 {
        self.protocol_id
    }

    #[inline]
    pub fn category(&self) -> Category {
        self.category
    }

    /// Declared fields, empty when the direction carries no payload.
    #[inline]
    pub fn fields(&self) -> &[FieldType] {
        &self.fields
    }

    /// Check if this direction carries any payload.
    #[inline]
    pub fn has_payload(&self) -> bool {
        !matches!(self.layout, Layout::Empty)
    }

    /// Full message size when it does not depend on the values.
    pub fn fixed_message_size(&self) -> Option<usize> {
        match self.layout {
            Layout::Empty => Some(ENVELOPE_PREFIX_SIZE),
            Layout::Fixed { payload_len } => Some(ENVELOPE_PREFIX_SIZE + payload_len),
            Layout::Variable { .. } => None,
        }
    }

    /// Check that `values` match the declared fields.
    ///
    /// Directions without payload accept (and ignore) any values.
    pub fn check(&self, values: &[Value]) -> Result<(), WireError> {
        if !self.has_payload() {
            return Ok(());
        }
        if values.len() != self.fields.len() {
            return Err(WireError::FieldCount {
                expected: self.fields.len(),
                actual: values.len(),
            });
        }
        for (index, (field, value)) in self.fields.iter().zip(values).enumerate() {
            if value.field_type() != *field {
                return Err(WireError::FieldType {
                    index,
                    expected: *field,
                    actual: value.field_type(),
                });
            }
        }
        Ok(())
    }

    /// Pack a complete message, length prefix included.
    pub fn pack(&self, request_number: u32, values: &[Value]) -> Result<Bytes, WireError> {
        self.check(values)?;

        let payload_len = match self.layout {
            Layout::Empty => 0,
            Layout::Fixed { payload_len } => payload_len,
            Layout::Variable {
                fixed_len,
                string_count,
            } => {
                let strings: usize = values
                    .iter()
                    .filter_map(Value::as_bytes)
                    .map(|b| b.len())
                    .sum();
                fixed_len + LENGTH_PREFIX_SIZE * string_count + strings
            }
        };

        let total = ENVELOPE_HEADER_SIZE + payload_len;
        let total_length = u32::try_from(total).map_err(|_| WireError::MessageTooLarge(total))?;

        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + total);
        buf.put_u32(total_length);
        buf.put_u16(self.category.as_u16());
        buf.put_u16(self.protocol_id);
        buf.put_u32(request_number);

        if let Layout::Variable { .. } = self.layout {
            for bytes in values.iter().filter_map(Value::as_bytes) {
                // Fits: the whole message fits in u32.
                buf.put_u32(bytes.len() as u32);
            }
        }
        if self.has_payload() {
            for value in values {
                value.encode_into(&mut buf);
            }
        }

        Ok(buf.freeze())
    }

    /// Unpack the payload that starts at `offset` in `buf`.
    ///
    /// The payload must be consumed exactly. Byte strings are returned as
    /// zero-copy slices of `buf`.
    pub fn unpack(&self, buf: &Bytes, offset: usize) -> Result<Vec<Value>, WireError> {
        if offset > buf.len() {
            return Err(WireError::Truncated {
                needed: offset,
                available: buf.len(),
            });
        }
        let mut cursor = buf.slice(offset..);

        let values = match self.layout {
            Layout::Empty => Vec::new(),
            Layout::Fixed { payload_len } => {
                need(&cursor, payload_len)?;
                self.fields
                    .iter()
                    .filter_map(|field| field.decode_fixed(&mut cursor))
                    .collect()
            }
            Layout::Variable { string_count, .. } => {
                need(&cursor, LENGTH_PREFIX_SIZE * string_count)?;
                let lengths: Vec<usize> = (0..string_count)
                    .map(|_| cursor.get_u32() as usize)
                    .collect();
                let mut lengths = lengths.into_iter();

                let mut values = Vec::with_capacity(self.fields.len());
                for field in &self.fields {
                    match field.width() {
                        Some(width) => {
                            need(&cursor, width)?;
                            if let Some(value) = field.decode_fixed(&mut cursor) {
                                values.push(value);
                            }
                        }
                        None => {
                            let len = lengths.next().unwrap_or_default();
                            need(&cursor, len)?;
                            values.push(Value::Bytes(cursor.split_to(len)));
                        }
                    }
                }
                values
            }
        };

        if !cursor.is_empty() {
            return Err(WireError::TrailingBytes(cursor.len()));
        }
        Ok(values)
    }
}

fn need(cursor: &Bytes, needed: usize) -> Result<(), WireError> {
    if cursor.remaining() < needed {
        return Err(WireError::Truncated {
            needed,
            available: cursor.remaining(),
        });
    }
    Ok(())
}
