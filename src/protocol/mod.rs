//! Protocol module - field types, wire formats, envelopes and the protocol table.
//!
//! This module implements the binary request/response protocol:
//! - Field type codes and values
//! - Per-direction packers/unpackers ([`WireFormat`])
//! - Envelope accumulator for partial reads
//! - Protocol table with handler slots, and the standard emews ids

mod envelope;
mod field;
pub mod ids;
mod table;
mod wire_format;

pub use envelope::{build_envelope, Envelope, EnvelopeBuffer};
pub use field::{FieldType, Value};
pub use table::{
    LocalContext, ProtocolEntry, ProtocolId, ProtocolTable, RequestHandler, ResponseHandler,
};
pub use wire_format::{
    build_nack, validate_length, Category, EnvelopeHeader, WireFormat, DEFAULT_MAX_MESSAGE_SIZE,
    ENVELOPE_HEADER_SIZE, ENVELOPE_PREFIX_SIZE, FIRE_AND_FORGET, LENGTH_PREFIX_SIZE,
    NACK_PROTOCOL_ID,
};
