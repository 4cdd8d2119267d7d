//! Error types for emews-net.
//!
//! Each failure class of the node core has its own type so that callers can
//! tell a malformed protocol declaration apart from a misbehaving peer or a
//! dead socket. [`NodeError`] wraps all of them for the public API.

use thiserror::Error;

use crate::protocol::{Category, FieldType};

/// A protocol table or wire format was declared incorrectly.
///
/// Raised while building the protocol table, before the loop starts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolDefinitionError {
    /// Field type code outside the recognized set.
    #[error("unknown field type code '{0}'")]
    UnknownFieldCode(char),

    /// Protocol id 0 is reserved for peer NACK responses.
    #[error("protocol id 0 is reserved for peer NACK responses")]
    ReservedProtocolId,

    /// The same protocol id was declared twice.
    #[error("protocol id {0} is already defined")]
    DuplicateProtocol(u16),

    /// Lookup of a protocol id that was never declared.
    #[error("protocol id {0} is not defined")]
    UnknownProtocol(u16),
}

/// A message arrived for a protocol whose handler was never wired up.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{category} handler for protocol {protocol_id} is not assigned (request number {request_number})")]
pub struct HandlerNotAssignedError {
    /// Protocol of the dropped message.
    pub protocol_id: u16,
    /// Request number of the dropped message.
    pub request_number: u32,
    /// Which handler slot was empty.
    pub category: Category,
}

/// Malformed payload, failing handler or out-of-order response.
///
/// Fatal for the connection it occurred on, never for the loop.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("network request {request_number} failed: {message}")]
pub struct NetworkRequestError {
    /// Request number of the offending message.
    pub request_number: u32,
    /// What went wrong.
    pub message: String,
}

impl NetworkRequestError {
    /// Create a new error for the given request number.
    pub fn new(request_number: u32, message: impl Into<String>) -> Self {
        Self {
            request_number,
            message: message.into(),
        }
    }
}

/// The peer answered a request with a NACK (protocol id 0).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("peer {peer_id} rejected request {request_number} (protocol {protocol_id})")]
pub struct PeerResponseError {
    /// Peer that sent the NACK.
    pub peer_id: u32,
    /// Request number the NACK refers to.
    pub request_number: u32,
    /// Protocol of the rejected request.
    pub protocol_id: u16,
}

/// I/O-level failure of a single poll event.
#[derive(Debug, Error)]
pub enum PollEventError {
    /// Read, write or accept failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Non-blocking connect reported a failure.
    #[error("connect failed: {0}")]
    ConnectFailed(std::io::Error),

    /// The peer closed its end of the socket.
    #[error("connection closed by peer")]
    Closed,

    /// Byte stream could not be framed (bad length prefix, bad handshake).
    #[error("malformed stream: {0}")]
    Malformed(String),

    /// The event was processed after it had been closed.
    #[error("event is already closed")]
    AlreadyClosed,
}

/// Write attempted on a peer that currently has no live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("peer {peer_id} has no assigned connection")]
pub struct NoConnectionError {
    /// Peer the write was meant for.
    pub peer_id: u32,
}

/// Values or bytes that do not fit a wire format.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// Wrong number of values for the declared fields.
    #[error("expected {expected} fields, got {actual}")]
    FieldCount { expected: usize, actual: usize },

    /// Value type does not match the declared field type.
    #[error("field {index}: expected {expected}, got {actual}")]
    FieldType {
        index: usize,
        expected: FieldType,
        actual: FieldType,
    },

    /// Not enough bytes to decode the payload.
    #[error("payload truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    /// Bytes left over after decoding every field.
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),

    /// Length prefix smaller than the fixed envelope header.
    #[error("envelope length {0} is shorter than the 8-byte header")]
    EnvelopeTooShort(u32),

    /// Length prefix larger than the configured limit.
    #[error("envelope length {length} exceeds maximum {max}")]
    EnvelopeTooLarge { length: u32, max: u32 },

    /// Packed message would not fit a 32-bit length prefix.
    #[error("message of {0} bytes does not fit the length prefix")]
    MessageTooLarge(usize),
}

/// Error returned by application request and response handlers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    /// Create a handler error from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<WireError> for HandlerError {
    fn from(err: WireError) -> Self {
        Self(err.to_string())
    }
}

/// Main error type for the public node API.
#[derive(Debug, Error)]
pub enum NodeError {
    /// I/O error while setting up the poll set or a socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be parsed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration parsed but is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// See [`ProtocolDefinitionError`].
    #[error("protocol definition error: {0}")]
    ProtocolDefinition(#[from] ProtocolDefinitionError),

    /// See [`WireError`].
    #[error("wire format error: {0}")]
    Wire(#[from] WireError),

    /// See [`NoConnectionError`].
    #[error(transparent)]
    NoConnection(#[from] NoConnectionError),

    /// No connection state is registered for the peer.
    #[error("unknown peer {0}")]
    UnknownPeer(u32),

    /// No event is registered under the token.
    #[error("no event registered under token {0}")]
    UnknownEvent(usize),

    /// The event exists but has the wrong kind for the operation.
    #[error("event {token} is a {kind} event, expected {expected}")]
    WrongEventKind {
        token: usize,
        kind: &'static str,
        expected: &'static str,
    },
}

/// Result type alias using NodeError.
pub type Result<T> = std::result::Result<T, NodeError>;
