//! Poll events - the resources the loop multiplexes.
//!
//! Every registered resource is a [`PollEvent`]: a socket or an in-loop
//! primitive paired with a small state machine.
//!
//! | Variant      | Backed by         | Produces                       |
//! |--------------|-------------------|--------------------------------|
//! | `Listener`   | `TcpListener`     | accepted streams               |
//! | `Outbound`   | connecting stream | peer identity reply            |
//! | `Inbound`    | accepted stream   | peer identity                  |
//! | `Connection` | `TcpStream`       | envelopes                      |
//! | `Counter`    | shared `Waker`    | increment count                |
//! | `Timer`      | loop deadline     | expiration count               |
//!
//! Processing an event only performs I/O and parsing. What to do with the
//! result is returned as an [`Outcome`] and handled by the loop, which is
//! where user callbacks run.

mod connection;
mod counter;
pub mod handshake;
mod inbound;
mod listener;
mod outbound;
mod socket;
mod timer;

use std::fmt;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Instant;

use mio::event::Source;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};

pub use connection::{ConnectionEvent, ConnectionOptions};
pub use counter::{CounterEvent, CounterHandle};
pub use inbound::InboundConnecting;
pub use listener::ListenerEvent;
pub use outbound::OutboundConnecting;
pub use timer::TimerEvent;

use crate::conn_state::PeerId;
use crate::error::PollEventError;
use crate::node::EventLoop;
use crate::protocol::Envelope;

/// Readiness a socket event asks the poller for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    ReadOnly,
    ReadWrite,
    WriteOnly,
}

impl PollMode {
    pub fn interest(self) -> Interest {
        match self {
            Self::ReadOnly => Interest::READABLE,
            Self::ReadWrite => Interest::READABLE | Interest::WRITABLE,
            Self::WriteOnly => Interest::WRITABLE,
        }
    }
}

/// Readiness flags reported for one event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub read_closed: bool,
    pub write_closed: bool,
}

impl Readiness {
    /// Worth attempting a read.
    #[inline]
    pub fn wants_read(&self) -> bool {
        self.readable || self.read_closed || self.error
    }

    /// Worth attempting a write.
    #[inline]
    pub fn wants_write(&self) -> bool {
        self.writable || self.write_closed || self.error
    }
}

impl From<&mio::event::Event> for Readiness {
    fn from(event: &mio::event::Event) -> Self {
        Self {
            readable: event.is_readable(),
            writable: event.is_writable(),
            error: event.is_error(),
            read_closed: event.is_read_closed(),
            write_closed: event.is_write_closed(),
        }
    }
}

/// Identity received by the accepting side of a handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundHandshake {
    /// Token of the inbound connecting event; pass it to
    /// [`EventLoop::add_connection`].
    pub token: Token,
    pub peer_address: SocketAddr,
    pub name: String,
    pub node_type: u16,
    /// Number of earlier connections the peer made to this node.
    pub connection_count: u32,
}

/// Identity reply received by the connecting side of a handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundHandshake {
    /// Token of the outbound connecting event; pass it to
    /// [`EventLoop::add_connection`].
    pub token: Token,
    /// Peer the connection was opened for.
    pub peer_id: PeerId,
    pub peer_address: SocketAddr,
    /// Node id the peer assigned to this node.
    pub node_id: u32,
    /// The peer's node type.
    pub node_type: u16,
}

pub type InboundConnectedCallback = Rc<dyn Fn(&mut EventLoop, InboundHandshake)>;
pub type OutboundConnectedCallback = Rc<dyn Fn(&mut EventLoop, OutboundHandshake)>;
pub type ConnectFailedCallback = Rc<dyn Fn(&mut EventLoop, SocketAddr, &str)>;
pub type DisconnectionCallback = Rc<dyn Fn(&mut EventLoop, PeerId, &str)>;
/// Timer and counter callback: `(loop, token, count)`.
pub type TickCallback = Rc<dyn Fn(&mut EventLoop, Token, u64)>;

/// Result of processing an event, handled by the loop.
pub(crate) enum Outcome {
    /// Nothing for the loop to do.
    Idle,
    Accepted {
        streams: Vec<(TcpStream, SocketAddr)>,
        on_connected: InboundConnectedCallback,
    },
    InboundConnected {
        handshake: InboundHandshake,
        on_connected: InboundConnectedCallback,
    },
    OutboundConnected {
        handshake: OutboundHandshake,
        on_connected: OutboundConnectedCallback,
    },
    Envelopes {
        peer_id: PeerId,
        envelopes: Vec<Envelope>,
        /// Peer closed the stream after sending these.
        eof: bool,
        /// Framing broke after these; the connection must close.
        malformed: Option<PollEventError>,
    },
    Tick {
        count: u64,
        on_fire: TickCallback,
    },
}

/// A registered resource and its state machine.
pub enum PollEvent {
    Listener(ListenerEvent),
    Outbound(OutboundConnecting),
    Inbound(InboundConnecting),
    Connection(ConnectionEvent),
    Counter(CounterEvent),
    Timer(TimerEvent),
}

impl PollEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Listener(_) => "listener",
            Self::Outbound(_) => "outbound",
            Self::Inbound(_) => "inbound",
            Self::Connection(_) => "connection",
            Self::Counter(_) => "counter",
            Self::Timer(_) => "timer",
        }
    }

    /// Short description for log lines.
    pub fn label(&self) -> String {
        match self {
            Self::Listener(e) => format!("[listener {}]", e.local_addr()),
            Self::Outbound(e) => format!("[outbound peer={} {}]", e.peer_id(), e.peer_address()),
            Self::Inbound(e) => format!("[inbound {}]", e.peer_address()),
            Self::Connection(e) => format!("[connection peer={} {}]", e.peer_id(), e.peer_address()),
            Self::Counter(_) => "[counter]".to_string(),
            Self::Timer(_) => "[timer]".to_string(),
        }
    }

    /// OS resource to register, `None` for in-loop primitives.
    pub(crate) fn source_mut(&mut self) -> Option<&mut dyn Source> {
        match self {
            Self::Listener(e) => e.source_mut(),
            Self::Outbound(e) => e.io_mut().source_mut(),
            Self::Inbound(e) => e.io_mut().source_mut(),
            Self::Connection(e) => e.io_mut().source_mut(),
            Self::Counter(_) | Self::Timer(_) => None,
        }
    }

    /// Record the token and mode the event was registered with.
    pub(crate) fn set_registration(&mut self, token: Token, mode: PollMode) {
        match self {
            Self::Outbound(e) => e.io_mut().set_registration(token, mode),
            Self::Inbound(e) => e.io_mut().set_registration(token, mode),
            Self::Connection(e) => e.io_mut().set_registration(token, mode),
            Self::Listener(_) | Self::Counter(_) | Self::Timer(_) => {}
        }
    }

    pub(crate) fn process(
        &mut self,
        readiness: Readiness,
        registry: &Registry,
        now: Instant,
    ) -> Result<Outcome, PollEventError> {
        match self {
            Self::Listener(e) => e.process(readiness),
            Self::Outbound(e) => e.process(readiness, registry),
            Self::Inbound(e) => e.process(readiness),
            Self::Connection(e) => e.process(readiness, registry),
            Self::Counter(e) => e.process(),
            Self::Timer(e) => e.process(now),
        }
    }

    /// Release the underlying resource. Safe to call more than once.
    pub fn close(&mut self) {
        match self {
            Self::Listener(e) => e.close(),
            Self::Outbound(e) => e.io_mut().close(),
            Self::Inbound(e) => e.io_mut().close(),
            Self::Connection(e) => e.io_mut().shutdown(),
            Self::Counter(e) => e.close(),
            Self::Timer(e) => e.close(),
        }
    }

    /// Check if a connecting event finished its handshake.
    pub(crate) fn is_finished_connecting(&self) -> bool {
        match self {
            Self::Outbound(e) => e.is_done(),
            Self::Inbound(e) => e.is_done(),
            _ => false,
        }
    }
}

impl fmt::Debug for PollEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}
