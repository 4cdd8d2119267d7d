//! Accepted connection waiting for the peer's identity.

use std::net::SocketAddr;

use bytes::{Buf, BytesMut};
use mio::net::TcpStream;

use super::handshake::Identity;
use super::socket::{ReadStatus, SocketIo};
use super::{InboundConnectedCallback, InboundHandshake, Outcome, PollMode, Readiness};
use crate::error::PollEventError;
use crate::protocol::LENGTH_PREFIX_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitingLength,
    AwaitingIdentity { payload_len: usize },
    Done,
}

pub struct InboundConnecting {
    io: SocketIo,
    peer_address: SocketAddr,
    buffer: BytesMut,
    state: State,
    on_connected: InboundConnectedCallback,
}

impl InboundConnecting {
    pub fn new(
        stream: TcpStream,
        peer_address: SocketAddr,
        on_connected: InboundConnectedCallback,
    ) -> Self {
        Self {
            io: SocketIo::new(stream, PollMode::ReadOnly),
            peer_address,
            buffer: BytesMut::with_capacity(64),
            state: State::AwaitingLength,
            on_connected,
        }
    }

    #[inline]
    pub fn peer_address(&self) -> SocketAddr {
        self.peer_address
    }

    pub(crate) fn io_mut(&mut self) -> &mut SocketIo {
        &mut self.io
    }

    pub(crate) fn is_done(&self) -> bool {
        self.state == State::Done
    }

    pub(crate) fn process(&mut self, readiness: Readiness) -> Result<Outcome, PollEventError> {
        if self.io.is_closed() {
            return Err(PollEventError::AlreadyClosed);
        }
        if self.state == State::Done || !readiness.wants_read() {
            return Ok(Outcome::Idle);
        }

        if self.state == State::AwaitingLength {
            let status = self.io.read_into(&mut self.buffer, Some(LENGTH_PREFIX_SIZE))?;
            if self.buffer.len() < LENGTH_PREFIX_SIZE {
                return match status {
                    ReadStatus::Eof => Err(PollEventError::Closed),
                    ReadStatus::Open | ReadStatus::Limited => Ok(Outcome::Idle),
                };
            }
            let payload_len = Identity::validate_length(self.buffer.get_u32())?;
            self.buffer.clear();
            self.state = State::AwaitingIdentity { payload_len };
        }

        // Bytes past the identity stay in the socket for the connection event.
        if let State::AwaitingIdentity { payload_len } = self.state {
            let status = self.io.read_into(&mut self.buffer, Some(payload_len))?;
            if self.buffer.len() < payload_len {
                return match status {
                    ReadStatus::Eof => Err(PollEventError::Closed),
                    ReadStatus::Open | ReadStatus::Limited => Ok(Outcome::Idle),
                };
            }
            let identity = Identity::decode(&self.buffer)?;
            self.buffer.clear();
            self.state = State::Done;
            tracing::debug!(
                "[inbound {}] identity received: name={:?} type={} connections={}",
                self.peer_address,
                identity.name,
                identity.node_type,
                identity.connection_count
            );
            return Ok(Outcome::InboundConnected {
                handshake: InboundHandshake {
                    token: self.io.token(),
                    peer_address: self.peer_address,
                    name: identity.name,
                    node_type: identity.node_type,
                    connection_count: identity.connection_count,
                },
                on_connected: self.on_connected.clone(),
            });
        }

        Ok(Outcome::Idle)
    }
}
