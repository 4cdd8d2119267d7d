//! Outbound connection attempt: connect, announce identity, await reply.

use std::io;
use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use mio::net::TcpStream;
use mio::Registry;

use super::handshake::{IdentityReply, REPLY_SIZE};
use super::socket::{ReadStatus, SocketIo};
use super::{
    ConnectFailedCallback, Outcome, OutboundConnectedCallback, OutboundHandshake, PollMode,
    Readiness,
};
use crate::conn_state::PeerId;
use crate::error::PollEventError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Non-blocking connect in progress.
    Connecting,
    /// Identity written (or being written), waiting for the reply.
    IdentitySent,
    /// Reply received; the loop replaces or closes this event.
    Done,
}

pub struct OutboundConnecting {
    io: SocketIo,
    peer_id: PeerId,
    peer_address: SocketAddr,
    identity: Bytes,
    reply: BytesMut,
    state: State,
    on_failed: ConnectFailedCallback,
    on_connected: OutboundConnectedCallback,
}

impl OutboundConnecting {
    /// Start a non-blocking connect to `peer_address`.
    ///
    /// `identity` is the encoded handshake sent once the connect succeeds.
    pub fn connect(
        peer_id: PeerId,
        peer_address: SocketAddr,
        identity: Bytes,
        on_failed: ConnectFailedCallback,
        on_connected: OutboundConnectedCallback,
    ) -> io::Result<Self> {
        let stream = TcpStream::connect(peer_address)?;
        Ok(Self {
            io: SocketIo::new(stream, PollMode::WriteOnly),
            peer_id,
            peer_address,
            identity,
            reply: BytesMut::with_capacity(REPLY_SIZE),
            state: State::Connecting,
            on_failed,
            on_connected,
        })
    }

    #[inline]
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    #[inline]
    pub fn peer_address(&self) -> SocketAddr {
        self.peer_address
    }

    pub(crate) fn on_failed(&self) -> ConnectFailedCallback {
        self.on_failed.clone()
    }

    pub(crate) fn io_mut(&mut self) -> &mut SocketIo {
        &mut self.io
    }

    pub(crate) fn is_done(&self) -> bool {
        self.state == State::Done
    }

    pub(crate) fn process(
        &mut self,
        readiness: Readiness,
        registry: &Registry,
    ) -> Result<Outcome, PollEventError> {
        if self.io.is_closed() {
            return Err(PollEventError::AlreadyClosed);
        }

        if self.state == State::Connecting {
            if !readiness.wants_write() {
                return Ok(Outcome::Idle);
            }
            if !self.check_connected()? {
                return Ok(Outcome::Idle);
            }
            tracing::debug!(
                "[outbound peer={} {}] connected, sending identity",
                self.peer_id,
                self.peer_address
            );
            self.state = State::IdentitySent;
            self.io.write_data(&self.identity, registry);
            self.io.flush(registry)?;
        }

        if self.state == State::IdentitySent {
            if readiness.wants_write() && self.io.has_pending_writes() {
                self.io.flush(registry)?;
            }
            // The reply may already be queued; reading early only costs a
            // WouldBlock.
            let status = self.io.read_into(&mut self.reply, Some(REPLY_SIZE))?;
            if status == ReadStatus::Eof && self.reply.len() < REPLY_SIZE {
                return Err(PollEventError::Closed);
            }
            if let Some(reply) = IdentityReply::decode(&self.reply) {
                self.state = State::Done;
                return Ok(Outcome::OutboundConnected {
                    handshake: OutboundHandshake {
                        token: self.io.token(),
                        peer_id: self.peer_id,
                        peer_address: self.peer_address,
                        node_id: reply.node_id,
                        node_type: reply.node_type,
                    },
                    on_connected: self.on_connected.clone(),
                });
            }
        }

        Ok(Outcome::Idle)
    }

    /// Check the result of the non-blocking connect.
    ///
    /// `Ok(false)` means the connect is still in progress.
    fn check_connected(&mut self) -> Result<bool, PollEventError> {
        let stream = self.io.stream_mut()?;
        if let Some(e) = stream.take_error().map_err(PollEventError::ConnectFailed)? {
            return Err(PollEventError::ConnectFailed(e));
        }
        match stream.peer_addr() {
            Ok(_) => {
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!("Could not set TCP_NODELAY for {}: {}", self.peer_address, e);
                }
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(PollEventError::ConnectFailed(e)),
        }
    }
}
