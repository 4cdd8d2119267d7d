//! Envelopes and the accumulator that cuts them out of a byte stream.
//!
//! [`EnvelopeBuffer`] is a state machine over partial reads:
//! - `AwaitingLength`: need the 4-byte length prefix
//! - `AwaitingBody`: prefix parsed, need `total_length` more bytes
//!
//! A bad length prefix poisons the buffer. Envelopes completed before it are
//! still handed out; the error is reported through [`EnvelopeBuffer::fault`]
//! and by every later push.
//!
//! # Example
//!
//! ```
//! use emews_net::protocol::{build_envelope, Category, EnvelopeBuffer};
//!
//! let mut buffer = EnvelopeBuffer::new();
//! let bytes = build_envelope(Category::Request, 2, 1, b"");
//!
//! let envelopes = buffer.push(&bytes).unwrap();
//! assert_eq!(envelopes.len(), 1);
//! assert_eq!(envelopes[0].protocol_id(), 2);
//! ```

use bytes::{Buf, Bytes, BytesMut};

use super::wire_format::{
    validate_length, Category, EnvelopeHeader, DEFAULT_MAX_MESSAGE_SIZE, ENVELOPE_HEADER_SIZE,
    ENVELOPE_PREFIX_SIZE, LENGTH_PREFIX_SIZE,
};
use crate::error::WireError;

/// A complete message: decoded header plus payload.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Decoded header.
    pub header: EnvelopeHeader,
    /// Payload bytes (zero-copy via `bytes::Bytes`).
    pub payload: Bytes,
}

impl Envelope {
    pub fn new(header: EnvelopeHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Category, `None` for an unknown code.
    #[inline]
    pub fn category(&self) -> Option<Category> {
        self.header.category()
    }

    #[inline]
    pub fn protocol_id(&self) -> u16 {
        self.header.protocol_id
    }

    #[inline]
    pub fn request_number(&self) -> u32 {
        self.header.request_number
    }

    /// Payload bytes; cheap to clone.
    #[inline]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Check if this is a NACK response.
    #[inline]
    pub fn is_nack(&self) -> bool {
        self.header.is_nack()
    }
}

/// Build a complete envelope from raw parts.
pub fn build_envelope(
    category: Category,
    protocol_id: u16,
    request_number: u32,
    payload: &[u8],
) -> Vec<u8> {
    let header = EnvelopeHeader::new(category, protocol_id, request_number, payload.len() as u32);
    let mut bytes = Vec::with_capacity(ENVELOPE_PREFIX_SIZE + payload.len());
    bytes.extend_from_slice(&header.encode());
    bytes.extend_from_slice(payload);
    bytes
}

#[derive(Debug, Clone, Copy)]
enum State {
    /// Waiting for the length prefix.
    AwaitingLength,
    /// Length known, waiting for the rest of the message.
    AwaitingBody { total_length: u32 },
}

/// Accumulates incoming bytes and extracts complete envelopes.
pub struct EnvelopeBuffer {
    buffer: BytesMut,
    state: State,
    max_message_size: u32,
    fault: Option<WireError>,
}

impl EnvelopeBuffer {
    /// Create a buffer with the default message size limit.
    pub fn new() -> Self {
        Self::with_max_message_size(DEFAULT_MAX_MESSAGE_SIZE)
    }

    /// Create a buffer that rejects envelopes longer than `max_message_size`.
    pub fn with_max_message_size(max_message_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(16 * 1024),
            state: State::AwaitingLength,
            max_message_size,
            fault: None,
        }
    }

    /// Push data into the buffer and extract all complete envelopes.
    ///
    /// Partial data is kept for the next push.
    ///
    /// # Errors
    ///
    /// Returns error if a length prefix is shorter than the envelope header
    /// or larger than the size limit, and no envelope preceded it in this
    /// push. The stream cannot be resynchronized after that. When envelopes
    /// did precede it they are returned and the error is left in
    /// [`fault`](Self::fault).
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Envelope>, WireError> {
        if let Some(fault) = &self.fault {
            return Err(fault.clone());
        }
        self.buffer.extend_from_slice(data);

        let mut envelopes = Vec::new();
        loop {
            match self.try_extract_one() {
                Ok(Some(envelope)) => envelopes.push(envelope),
                Ok(None) => break,
                Err(e) => {
                    self.buffer.clear();
                    self.fault = Some(e.clone());
                    if envelopes.is_empty() {
                        return Err(e);
                    }
                    break;
                }
            }
        }
        Ok(envelopes)
    }

    /// Framing error that ended the stream, if any.
    #[inline]
    pub fn fault(&self) -> Option<&WireError> {
        self.fault.as_ref()
    }

    fn try_extract_one(&mut self) -> Result<Option<Envelope>, WireError> {
        match self.state {
            State::AwaitingLength => {
                if self.buffer.len() < LENGTH_PREFIX_SIZE {
                    return Ok(None);
                }
                let total_length = self.buffer.get_u32();
                validate_length(total_length, self.max_message_size)?;

                self.state = State::AwaitingBody { total_length };
                self.try_extract_one()
            }

            State::AwaitingBody { total_length } => {
                let total_length_usize = total_length as usize;
                if self.buffer.len() < total_length_usize {
                    return Ok(None);
                }

                let mut body = self.buffer.split_to(total_length_usize).freeze();
                let category = body.get_u16();
                let protocol_id = body.get_u16();
                let request_number = body.get_u32();
                debug_assert_eq!(body.len(), total_length_usize - ENVELOPE_HEADER_SIZE);

                self.state = State::AwaitingLength;

                let header = EnvelopeHeader {
                    total_length,
                    category,
                    protocol_id,
                    request_number,
                };
                Ok(Some(Envelope::new(header, body)))
            }
        }
    }

    /// Check if a message is partially received.
    #[inline]
    pub fn is_mid_message(&self) -> bool {
        matches!(self.state, State::AwaitingBody { .. }) || !self.buffer.is_empty()
    }

    /// Number of buffered bytes not yet part of an envelope.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::AwaitingLength;
        self.fault = None;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match self.state {
            State::AwaitingLength => "AwaitingLength",
            State::AwaitingBody { .. } => "AwaitingBody",
        }
    }
}

impl Default for EnvelopeBuffer {
    fn default() -> Self {
        Self::new()
    }
}
