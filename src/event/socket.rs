//! Buffered non-blocking stream shared by the socket-backed events.
//!
//! mio readiness is edge-triggered: reads drain the socket until it would
//! block or a caller-given limit is reached (the caller then rearms), and
//! writes flush until the buffer is empty or the socket would block. Interest is READABLE while the
//! outbound buffer is empty and READABLE | WRITABLE while it is not.

use std::io::{self, Read, Write};

use bytes::{Buf, BytesMut};
use mio::event::Source;
use mio::net::TcpStream;
use mio::{Registry, Token};

use super::PollMode;
use crate::error::PollEventError;

const READ_CHUNK_SIZE: usize = 16 * 1024;

/// What a drain of the socket ended with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadStatus {
    /// Socket would block.
    Open,
    /// The limit was reached; more bytes may be waiting.
    Limited,
    /// The peer closed its side.
    Eof,
}

pub(crate) struct SocketIo {
    stream: Option<TcpStream>,
    token: Token,
    mode: PollMode,
    outbound: BytesMut,
}

impl SocketIo {
    pub(crate) fn new(stream: TcpStream, mode: PollMode) -> Self {
        Self {
            stream: Some(stream),
            token: Token(usize::MAX),
            mode,
            outbound: BytesMut::new(),
        }
    }

    pub(crate) fn set_registration(&mut self, token: Token, mode: PollMode) {
        self.token = token;
        self.mode = mode;
    }

    pub(crate) fn source_mut(&mut self) -> Option<&mut dyn Source> {
        self.stream.as_mut().map(|s| s as &mut dyn Source)
    }

    pub(crate) fn stream_mut(&mut self) -> Result<&mut TcpStream, PollEventError> {
        self.stream.as_mut().ok_or(PollEventError::AlreadyClosed)
    }

    #[inline]
    pub(crate) fn token(&self) -> Token {
        self.token
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    #[inline]
    pub(crate) fn has_pending_writes(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Change the registered interest.
    pub(crate) fn set_mode(&mut self, mode: PollMode, registry: &Registry) {
        if mode == self.mode {
            return;
        }
        let token = self.token;
        if let Some(stream) = self.stream.as_mut() {
            match registry.reregister(stream, token, mode.interest()) {
                Ok(()) => self.mode = mode,
                Err(e) => tracing::warn!("Failed to update poll mode of {:?}: {}", token, e),
            }
        }
    }

    /// Buffer bytes for writing and ask for write readiness.
    pub(crate) fn write_data(&mut self, data: &[u8], registry: &Registry) {
        self.outbound.extend_from_slice(data);
        self.set_mode(PollMode::ReadWrite, registry);
    }

    /// Write as much of the outbound buffer as the socket takes.
    ///
    /// Drops back to read-only interest once the buffer is empty.
    pub(crate) fn flush(&mut self, registry: &Registry) -> Result<(), PollEventError> {
        if self.write_pending()? {
            self.set_mode(PollMode::ReadOnly, registry);
        }
        Ok(())
    }

    /// Returns true once the outbound buffer is empty.
    fn write_pending(&mut self) -> Result<bool, PollEventError> {
        let stream = self.stream.as_mut().ok_or(PollEventError::AlreadyClosed)?;
        while !self.outbound.is_empty() {
            match stream.write(&self.outbound) {
                Ok(0) => return Err(PollEventError::Io(io::ErrorKind::WriteZero.into())),
                Ok(n) => self.outbound.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }

    /// Read into `dst` until the socket would block, or until `dst` holds
    /// `limit` bytes.
    pub(crate) fn read_into(
        &mut self,
        dst: &mut BytesMut,
        limit: Option<usize>,
    ) -> Result<ReadStatus, PollEventError> {
        let stream = self.stream.as_mut().ok_or(PollEventError::AlreadyClosed)?;
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            let want = match limit {
                Some(limit) if dst.len() >= limit => return Ok(ReadStatus::Limited),
                Some(limit) => (limit - dst.len()).min(READ_CHUNK_SIZE),
                None => READ_CHUNK_SIZE,
            };
            match stream.read(&mut chunk[..want]) {
                Ok(0) => return Ok(ReadStatus::Eof),
                Ok(n) => dst.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadStatus::Open),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Re-register with the current interest so that bytes left unread by
    /// a limited read produce another readiness event.
    pub(crate) fn rearm(&mut self, registry: &Registry) -> Result<(), PollEventError> {
        let token = self.token;
        let interest = self.mode.interest();
        let stream = self.stream.as_mut().ok_or(PollEventError::AlreadyClosed)?;
        registry.reregister(stream, token, interest)?;
        Ok(())
    }

    /// Hand the stream over to a new event.
    pub(crate) fn take_stream(&mut self) -> Option<TcpStream> {
        self.stream.take()
    }

    /// Make one non-blocking attempt to send what is buffered, then drop
    /// the socket.
    pub(crate) fn shutdown(&mut self) {
        if self.stream.is_some() && self.has_pending_writes() {
            match self.write_pending() {
                Ok(true) => {}
                Ok(false) => tracing::debug!(
                    "{:?} closed with {} unsent bytes",
                    self.token,
                    self.outbound.len()
                ),
                Err(e) => tracing::debug!("{:?} final flush failed: {}", self.token, e),
            }
        }
        self.close();
    }

    /// Drop the socket. Unsent bytes are discarded.
    pub(crate) fn close(&mut self) {
        self.outbound.clear();
        self.stream = None;
    }
}
