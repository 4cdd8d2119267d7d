//! Established peer connection carrying envelopes.

use std::net::SocketAddr;

use bytes::BytesMut;
use mio::net::TcpStream;
use mio::Registry;

use super::socket::{ReadStatus, SocketIo};
use super::{DisconnectionCallback, Outcome, PollMode, Readiness};
use crate::conn_state::PeerId;
use crate::error::PollEventError;
use crate::protocol::EnvelopeBuffer;

/// Bytes read from one connection per readiness event; the rest waits for
/// the next turn so one busy peer cannot starve the others.
const MAX_READ_PER_TURN: usize = 256 * 1024;

/// Per-connection behavior switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Answer a request that fails to unpack or whose handler fails with a
    /// NACK instead of closing the connection.
    pub nack_on_request_error: bool,
}

pub struct ConnectionEvent {
    io: SocketIo,
    peer_id: PeerId,
    peer_address: SocketAddr,
    inbound: EnvelopeBuffer,
    read_buf: BytesMut,
    options: ConnectionOptions,
    on_disconnection: Option<DisconnectionCallback>,
}

impl ConnectionEvent {
    pub(crate) fn new(
        stream: TcpStream,
        peer_id: PeerId,
        peer_address: SocketAddr,
        max_message_size: u32,
        options: ConnectionOptions,
        on_disconnection: Option<DisconnectionCallback>,
    ) -> Self {
        Self {
            io: SocketIo::new(stream, PollMode::ReadOnly),
            peer_id,
            peer_address,
            inbound: EnvelopeBuffer::with_max_message_size(max_message_size),
            read_buf: BytesMut::with_capacity(16 * 1024),
            options,
            on_disconnection,
        }
    }

    #[inline]
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    #[inline]
    pub fn peer_address(&self) -> SocketAddr {
        self.peer_address
    }

    #[inline]
    pub fn options(&self) -> ConnectionOptions {
        self.options
    }

    pub(crate) fn on_disconnection(&self) -> Option<DisconnectionCallback> {
        self.on_disconnection.clone()
    }

    pub(crate) fn io_mut(&mut self) -> &mut SocketIo {
        &mut self.io
    }

    /// Queue bytes; they go out on the next write readiness.
    pub(crate) fn write_data(&mut self, data: &[u8], registry: &Registry) -> Result<(), PollEventError> {
        if self.io.is_closed() {
            return Err(PollEventError::AlreadyClosed);
        }
        self.io.write_data(data, registry);
        Ok(())
    }

    pub(crate) fn process(
        &mut self,
        readiness: Readiness,
        registry: &Registry,
    ) -> Result<Outcome, PollEventError> {
        if self.io.is_closed() {
            return Err(PollEventError::AlreadyClosed);
        }

        if readiness.wants_write() && self.io.has_pending_writes() {
            self.io.flush(registry)?;
        }
        if !readiness.wants_read() {
            return Ok(Outcome::Idle);
        }

        self.read_buf.clear();
        let status = self.io.read_into(&mut self.read_buf, Some(MAX_READ_PER_TURN))?;
        if status == ReadStatus::Limited {
            self.io.rearm(registry)?;
        }
        let envelopes = self
            .inbound
            .push(&self.read_buf)
            .map_err(|e| PollEventError::Malformed(e.to_string()))?;
        // Envelopes ahead of a bad length prefix are still dispatched.
        let malformed = self
            .inbound
            .fault()
            .map(|e| PollEventError::Malformed(e.to_string()));
        let eof = status == ReadStatus::Eof;

        if envelopes.is_empty() {
            if eof {
                return Err(PollEventError::Closed);
            }
            return Ok(Outcome::Idle);
        }
        tracing::trace!(
            "[connection peer={}] received {} envelope(s)",
            self.peer_id,
            envelopes.len()
        );
        Ok(Outcome::Envelopes {
            peer_id: self.peer_id,
            envelopes,
            eof,
            malformed,
        })
    }
}
