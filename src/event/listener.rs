//! Listening socket that accepts inbound peers.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};

use mio::event::Source;
use mio::net::{TcpListener, TcpStream};

use super::{InboundConnectedCallback, Outcome, Readiness};
use crate::error::PollEventError;

/// Listens on all interfaces and hands accepted streams to the loop.
pub struct ListenerEvent {
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    on_connected: InboundConnectedCallback,
}

impl ListenerEvent {
    /// Bind to `port` on all interfaces. Port 0 picks an ephemeral port.
    pub fn bind(port: u16, on_connected: InboundConnectedCallback) -> io::Result<Self> {
        let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener: Some(listener),
            local_addr,
            on_connected,
        })
    }

    /// Address actually bound.
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn source_mut(&mut self) -> Option<&mut dyn Source> {
        self.listener.as_mut().map(|l| l as &mut dyn Source)
    }

    /// Accept every pending connection.
    ///
    /// Streams accepted before an error are always handed to the loop.
    /// Running out of descriptors only pauses accepting until the next
    /// readiness event.
    pub(crate) fn process(&mut self, readiness: Readiness) -> Result<Outcome, PollEventError> {
        let listener = self.listener.as_ref().ok_or(PollEventError::AlreadyClosed)?;
        if !readiness.wants_read() {
            return Ok(Outcome::Idle);
        }

        let mut streams: Vec<(TcpStream, SocketAddr)> = Vec::new();
        let mut failure = None;
        loop {
            match listener.accept() {
                Ok((stream, address)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!("Could not set TCP_NODELAY for {}: {}", address, e);
                    }
                    streams.push((stream, address));
                }
                Err(e) => match classify_accept_error(&e) {
                    AcceptError::Drained => break,
                    AcceptError::Retry => continue,
                    AcceptError::Exhausted => {
                        tracing::warn!(
                            "[listener {}] out of descriptors, pausing accept: {}",
                            self.local_addr,
                            e
                        );
                        break;
                    }
                    AcceptError::Fatal => {
                        failure = Some(e);
                        break;
                    }
                },
            }
        }

        if streams.is_empty() {
            return match failure {
                Some(e) => Err(e.into()),
                None => Ok(Outcome::Idle),
            };
        }
        if let Some(e) = failure {
            tracing::error!(
                "[listener {}] accept failed after {} connection(s): {}",
                self.local_addr,
                streams.len(),
                e
            );
        }
        Ok(Outcome::Accepted {
            streams,
            on_connected: self.on_connected.clone(),
        })
    }

    pub(crate) fn close(&mut self) {
        self.listener = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptError {
    /// No more pending connections.
    Drained,
    /// Try the next pending connection.
    Retry,
    /// Process or system descriptor limit; keep listening.
    Exhausted,
    /// The listener is unusable.
    Fatal,
}

// errno values shared by Linux, macOS and the BSDs.
#[cfg(unix)]
const ENFILE: i32 = 23;
#[cfg(unix)]
const EMFILE: i32 = 24;

fn classify_accept_error(err: &io::Error) -> AcceptError {
    match err.kind() {
        io::ErrorKind::WouldBlock => return AcceptError::Drained,
        io::ErrorKind::Interrupted
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset => return AcceptError::Retry,
        _ => {}
    }
    #[cfg(unix)]
    if matches!(err.raw_os_error(), Some(ENFILE | EMFILE)) {
        return AcceptError::Exhausted;
    }
    AcceptError::Fatal
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_accept_error() {
        let kind = |kind: io::ErrorKind| classify_accept_error(&io::Error::from(kind));
        assert_eq!(kind(io::ErrorKind::WouldBlock), AcceptError::Drained);
        assert_eq!(kind(io::ErrorKind::Interrupted), AcceptError::Retry);
        assert_eq!(kind(io::ErrorKind::ConnectionAborted), AcceptError::Retry);
        assert_eq!(kind(io::ErrorKind::PermissionDenied), AcceptError::Fatal);
    }

    #[cfg(unix)]
    #[test]
    fn test_descriptor_exhaustion_keeps_listening() {
        for errno in [EMFILE, ENFILE] {
            let err = io::Error::from_raw_os_error(errno);
            assert_eq!(classify_accept_error(&err), AcceptError::Exhausted);
        }
    }

    #[test]
    fn test_accepts_every_pending_connection() {
        let on_connected: InboundConnectedCallback =
            std::rc::Rc::new(|_: &mut crate::node::EventLoop, _: super::super::InboundHandshake| {});
        let mut listener = ListenerEvent::bind(0, on_connected).unwrap();
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, listener.local_addr().port()));
        let _first = std::net::TcpStream::connect(addr).unwrap();
        let _second = std::net::TcpStream::connect(addr).unwrap();

        let readable = Readiness {
            readable: true,
            ..Readiness::default()
        };
        let mut accepted = 0;
        for _ in 0..100 {
            if let Outcome::Accepted { streams, .. } = listener.process(readable).unwrap() {
                accepted += streams.len();
            }
            if accepted == 2 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(accepted, 2);
    }
}
