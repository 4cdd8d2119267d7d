//! The node event loop.
//!
//! [`EventLoop`] owns the poll set, every registered event, the per-peer
//! [`ConnectionState`]s and the [`ProtocolTable`]. It runs on one thread;
//! callbacks and protocol handlers receive `&mut EventLoop` and may send
//! requests, add or close events, or stop the loop from inside.
//!
//! # Life cycle
//!
//! ```text
//! run_with(hooks)
//!   ├─ install signal adapter (optional)
//!   ├─ hooks.start(loop)
//!   ├─ while !interrupted { turn(None) }
//!   ├─ hooks.shutdown(loop)
//!   └─ close every remaining event
//! ```
//!
//! # Connecting
//!
//! A listener produces inbound connecting events and
//! [`add_outbound_connecting`](EventLoop::add_outbound_connecting) produces
//! outbound ones. When their handshake completes, the connected callback
//! decides which peer the socket belongs to and calls
//! [`add_connection`](EventLoop::add_connection), which turns the connecting
//! event into a [`ConnectionEvent`](crate::event::ConnectionEvent) under the
//! same token. Pending requests of the peer are re-sent at that point.

mod dispatch;
mod identity;
mod stop;

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use mio::{Events, Token};

pub use identity::{node_id, NodeType};
pub use stop::StopHandle;

use crate::config::NodeConfig;
use crate::conn_state::{ConnectionState, PeerId, PendingRequest};
use crate::error::{NodeError, PeerResponseError, PollEventError, ProtocolDefinitionError, Result};
use crate::event::handshake::{Identity, IdentityReply};
use crate::event::{
    ConnectionEvent, ConnectionOptions, CounterHandle, InboundConnecting, InboundHandshake,
    ListenerEvent, OutboundConnecting, OutboundHandshake, Outcome, PollEvent, PollMode, Readiness,
    TimerEvent,
};
use crate::protocol::{LocalContext, ProtocolId, ProtocolTable, Value, FIRE_AND_FORGET};
use crate::registry::{EventRegistry, WAKER_TOKEN};
use crate::signal;

/// Receives NACKs for requests this node sent, with the request's local
/// context.
pub type NackHandler = Rc<dyn Fn(&mut EventLoop, PeerResponseError, LocalContext)>;

/// Overridable start and shutdown steps of [`EventLoop::run_with`].
pub trait NodeHooks {
    /// Runs before the first poll. Typically adds listeners and outbound
    /// connections.
    fn start(&mut self, _node: &mut EventLoop) {}

    /// Runs after the loop stopped, before remaining events are closed.
    fn shutdown(&mut self, _node: &mut EventLoop) {}
}

impl NodeHooks for () {}

/// Single-threaded event loop of one node.
pub struct EventLoop {
    config: NodeConfig,
    node_id: u32,
    node_type: u16,
    registry: EventRegistry,
    peers: HashMap<PeerId, ConnectionState>,
    protocols: ProtocolTable,
    stop: StopHandle,
    unblock_token: Token,
    nack_handler: Option<NackHandler>,
    listen_addrs: Vec<SocketAddr>,
    poll_events: Events,
}

impl EventLoop {
    /// Create a loop. Nothing is registered except the unblock counter.
    pub fn new(config: NodeConfig, node_type: impl Into<u16>, protocols: ProtocolTable) -> Result<Self> {
        config.validate()?;
        let mut registry = EventRegistry::new()?;
        let unblock = registry.add_counter(Rc::new(|node: &mut EventLoop, _token, _count| {
            if !node.is_interrupted() {
                tracing::warn!("Poll unblocked while the node is not interrupted");
            }
        }));
        let unblock_token = unblock.token();
        let poll_events = Events::with_capacity(config.events_capacity);

        Ok(Self {
            config,
            node_id: node_id::UNASSIGNED,
            node_type: node_type.into(),
            registry,
            peers: HashMap::new(),
            protocols,
            stop: StopHandle::new(unblock),
            unblock_token,
            nack_handler: None,
            listen_addrs: Vec::new(),
            poll_events,
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    #[inline]
    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    /// Set the id this node is known by, e.g. from an identity reply.
    pub fn set_node_id(&mut self, node_id: u32) {
        self.node_id = node_id;
    }

    #[inline]
    pub fn node_type(&self) -> u16 {
        self.node_type
    }

    pub fn protocols(&self) -> &ProtocolTable {
        &self.protocols
    }

    /// Handlers may be reassigned while running.
    pub fn protocols_mut(&mut self) -> &mut ProtocolTable {
        &mut self.protocols
    }

    /// Handle for stopping the loop from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Stop the loop. Idempotent.
    pub fn stop(&self) {
        self.stop.stop();
    }

    #[inline]
    pub fn is_interrupted(&self) -> bool {
        self.stop.is_interrupted()
    }

    /// Addresses of the listeners added so far.
    pub fn listen_addrs(&self) -> &[SocketAddr] {
        &self.listen_addrs
    }

    /// Number of registered events, the unblock counter included.
    pub fn event_count(&self) -> usize {
        self.registry.len()
    }

    pub fn event(&self, token: Token) -> Option<&PollEvent> {
        self.registry.get(token)
    }

    pub fn set_nack_handler<F>(&mut self, handler: F)
    where
        F: Fn(&mut EventLoop, PeerResponseError, LocalContext) + 'static,
    {
        self.nack_handler = Some(Rc::new(handler));
    }

    // ---- running ----

    /// Run until stopped.
    pub fn run(&mut self) -> Result<()> {
        self.run_with(&mut ())
    }

    /// Run until stopped, calling `hooks` at start and shutdown.
    pub fn run_with<H: NodeHooks>(&mut self, hooks: &mut H) -> Result<()> {
        let _signals = if self.config.handle_signals {
            match signal::install(self.stop_handle()) {
                Ok(guard) => Some(guard),
                Err(e) => {
                    tracing::warn!("Failed to install signal handlers: {}", e);
                    None
                }
            }
        } else {
            None
        };

        tracing::info!(
            "Node {:?} (id {}, type {}) starting",
            self.config.node_name,
            self.node_id,
            self.node_type
        );
        hooks.start(self);

        let mut result = Ok(());
        while !self.is_interrupted() {
            if let Err(e) = self.turn(None) {
                tracing::error!("Event loop failed: {}", e);
                self.stop();
                result = Err(e);
            }
        }

        tracing::info!("Node {:?} shutting down", self.config.node_name);
        hooks.shutdown(self);
        self.close_all();
        result
    }

    /// One poll iteration: wait for readiness (at most `timeout`, or until
    /// the next timer), then process what is ready.
    ///
    /// Returns the number of events processed.
    pub fn turn(&mut self, timeout: Option<Duration>) -> Result<usize> {
        if self.is_interrupted() {
            return Ok(0);
        }

        let timeout = match (timeout, self.registry.next_timer_timeout(Instant::now())) {
            (Some(requested), Some(timer)) => Some(requested.min(timer)),
            (requested, timer) => requested.or(timer),
        };
        self.registry.poll(&mut self.poll_events, timeout)?;
        let ready: Vec<(Token, Readiness)> = self
            .poll_events
            .iter()
            .map(|event| (event.token(), Readiness::from(event)))
            .collect();

        let mut processed = 0;
        for (token, readiness) in ready {
            if self.is_interrupted() {
                return Ok(processed);
            }
            if token == WAKER_TOKEN {
                for counter in self.registry.counter_tokens() {
                    processed += self.process_event(counter, Readiness::default());
                }
            } else {
                processed += self.process_event(token, readiness);
            }
        }

        for timer in self.registry.due_timers(Instant::now()) {
            if self.is_interrupted() {
                break;
            }
            processed += self.process_event(timer, Readiness::default());
        }
        Ok(processed)
    }

    fn process_event(&mut self, token: Token, readiness: Readiness) -> usize {
        let result = match self.registry.process(token, readiness, Instant::now()) {
            Some(result) => result,
            None => {
                tracing::trace!("Readiness for unregistered {:?}", token);
                return 0;
            }
        };
        match result {
            Ok(outcome) => self.handle_outcome(token, outcome),
            Err(e) => {
                self.close_unexpectedly(token, &e.to_string());
            }
        }
        1
    }

    fn handle_outcome(&mut self, token: Token, outcome: Outcome) {
        match outcome {
            Outcome::Idle => {}
            Outcome::Accepted {
                streams,
                on_connected,
            } => {
                for (stream, address) in streams {
                    tracing::debug!("Accepted connection from {}", address);
                    let event = InboundConnecting::new(stream, address, on_connected.clone());
                    if let Err(e) = self.registry.register(PollEvent::Inbound(event), PollMode::ReadOnly) {
                        tracing::warn!("Failed to register inbound connection from {}: {}", address, e);
                    }
                }
            }
            Outcome::InboundConnected {
                handshake,
                on_connected,
            } => {
                on_connected(self, handshake);
                self.close_if_unclaimed(token);
            }
            Outcome::OutboundConnected {
                handshake,
                on_connected,
            } => {
                on_connected(self, handshake);
                self.close_if_unclaimed(token);
            }
            Outcome::Envelopes {
                peer_id,
                envelopes,
                eof,
                malformed,
            } => {
                self.dispatch_envelopes(token, peer_id, envelopes);
                if !self.registry.contains(token) {
                    return;
                }
                if let Some(err) = malformed {
                    self.close_unexpectedly(token, &err.to_string());
                } else if eof {
                    self.close_unexpectedly(token, &PollEventError::Closed.to_string());
                }
            }
            Outcome::Tick { count, on_fire } => on_fire(self, token, count),
        }
    }

    fn close_if_unclaimed(&mut self, token: Token) {
        let unclaimed = self
            .registry
            .get(token)
            .is_some_and(PollEvent::is_finished_connecting);
        if unclaimed {
            tracing::debug!("Connecting event {:?} was not claimed, closing", token);
            self.close_event(token);
        }
    }

    // ---- peers ----

    /// Add a peer, or update the type and address of a known one.
    pub fn add_peer(&mut self, peer_id: PeerId, peer_type: u16, address: IpAddr) -> &mut ConnectionState {
        let state = self
            .peers
            .entry(peer_id)
            .or_insert_with(|| ConnectionState::new(peer_id, peer_type, address));
        state.set_peer_type(peer_type);
        state.set_peer_address(address);
        state
    }

    pub fn peer(&self, peer_id: PeerId) -> Option<&ConnectionState> {
        self.peers.get(&peer_id)
    }

    pub fn peer_mut(&mut self, peer_id: PeerId) -> Option<&mut ConnectionState> {
        self.peers.get_mut(&peer_id)
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.peers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Forget a peer permanently. Its connection, if any, is closed.
    pub fn remove_peer(&mut self, peer_id: PeerId) -> Option<ConnectionState> {
        let token = self.peers.get(&peer_id)?.assigned_event();
        if let Some(token) = token {
            self.close_event(token);
        }
        self.peers.remove(&peer_id)
    }

    // ---- events ----

    /// Listen on `port` (0 for an ephemeral port).
    ///
    /// On failure the error is logged, the loop is stopped and `false` is
    /// returned.
    pub fn add_listener<F>(&mut self, port: u16, on_connected: F) -> bool
    where
        F: Fn(&mut EventLoop, InboundHandshake) + 'static,
    {
        if port != 0 && port < 1024 {
            tracing::warn!("Listening on privileged port {}", port);
        }
        let listener = match ListenerEvent::bind(port, Rc::new(on_connected)) {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!("Failed to listen on port {}: {}", port, e);
                self.stop();
                return false;
            }
        };
        let local_addr = listener.local_addr();
        match self.registry.register(PollEvent::Listener(listener), PollMode::ReadOnly) {
            Ok(token) => {
                tracing::info!("Listening on {} ({:?})", local_addr, token);
                self.listen_addrs.push(local_addr);
                true
            }
            Err(e) => {
                tracing::error!("Failed to register listener on {}: {}", local_addr, e);
                self.stop();
                false
            }
        }
    }

    /// Connect to a known peer at `port`.
    ///
    /// An immediate connect failure is reported through `on_failed` and
    /// returns `None`.
    pub fn add_outbound_connecting<F, C>(
        &mut self,
        port: u16,
        peer_id: PeerId,
        on_failed: F,
        on_connected: C,
    ) -> Option<Token>
    where
        F: Fn(&mut EventLoop, SocketAddr, &str) + 'static,
        C: Fn(&mut EventLoop, OutboundHandshake) + 'static,
    {
        let Some(state) = self.peers.get(&peer_id) else {
            tracing::error!("Cannot connect to unknown peer {}", peer_id);
            return None;
        };
        let address = SocketAddr::new(state.peer_address(), port);
        let identity = Identity {
            node_type: self.node_type,
            connection_count: state.connection_count(),
            name: self.config.node_name.clone(),
        }
        .encode();

        let on_failed = Rc::new(on_failed);
        let result = OutboundConnecting::connect(
            peer_id,
            address,
            identity,
            on_failed.clone(),
            Rc::new(on_connected),
        )
        .and_then(|event| self.registry.register(PollEvent::Outbound(event), PollMode::WriteOnly));

        match result {
            Ok(token) => {
                tracing::debug!("[outbound peer={} {}] connecting ({:?})", peer_id, address, token);
                Some(token)
            }
            Err(e) => {
                let reason = e.to_string();
                tracing::warn!("[outbound peer={} {}] connect failed: {}", peer_id, address, reason);
                on_failed(self, address, &reason);
                None
            }
        }
    }

    /// Turn a finished connecting event into the live connection of
    /// `peer_id`.
    ///
    /// Any previous connection of the peer is closed. On the accepting side
    /// the identity reply (carrying `peer_id` as the peer's node id) is
    /// written first; then every pending request of the peer is re-sent in
    /// order.
    pub fn add_connection<F>(
        &mut self,
        connecting: Token,
        peer_id: PeerId,
        on_disconnection: F,
        options: ConnectionOptions,
    ) -> Result<()>
    where
        F: Fn(&mut EventLoop, PeerId, &str) + 'static,
    {
        if !self.peers.contains_key(&peer_id) {
            return Err(NodeError::UnknownPeer(peer_id));
        }
        let (stream, address, inbound) = match self.registry.get_mut(connecting) {
            Some(PollEvent::Inbound(event)) => (event.io_mut().take_stream(), event.peer_address(), true),
            Some(PollEvent::Outbound(event)) => (event.io_mut().take_stream(), event.peer_address(), false),
            Some(other) => {
                return Err(NodeError::WrongEventKind {
                    token: connecting.0,
                    kind: other.kind(),
                    expected: "connecting",
                })
            }
            None => return Err(NodeError::UnknownEvent(connecting.0)),
        };
        self.registry.take_for_handoff(connecting);
        let stream = stream.ok_or_else(|| {
            NodeError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "connecting event is already closed",
            ))
        })?;

        let stale = self.peers.get(&peer_id).and_then(ConnectionState::assigned_event);
        if let Some(stale) = stale {
            tracing::info!("Peer {} reconnected, closing previous connection {:?}", peer_id, stale);
            self.close_event(stale);
        }

        let connection = ConnectionEvent::new(
            stream,
            peer_id,
            address,
            self.config.max_message_size,
            options,
            Some(Rc::new(on_disconnection)),
        );
        self.registry
            .install(connecting, PollEvent::Connection(connection), PollMode::ReadOnly)?;

        let node_type = self.node_type;
        let state = self
            .peers
            .get_mut(&peer_id)
            .ok_or(NodeError::UnknownPeer(peer_id))?;
        state.assign_event(connecting);
        state.set_peer_address(address.ip());

        if inbound {
            let reply = IdentityReply {
                node_id: peer_id,
                node_type,
            };
            state.write_data(&mut self.registry, &reply.encode())?;
        }
        let pending: Vec<Bytes> = state.pending_requests().map(|p| p.packed().clone()).collect();
        for packed in &pending {
            state.write_data(&mut self.registry, packed)?;
        }

        tracing::info!(
            "[connection peer={} {}] established (connection #{}, {} pending re-sent)",
            peer_id,
            address,
            state.connection_count(),
            pending.len()
        );
        Ok(())
    }

    /// Add a disarmed timer; arm it with [`set_timer`](Self::set_timer).
    pub fn add_timer<F>(&mut self, on_fire: F) -> Result<Token>
    where
        F: Fn(&mut EventLoop, Token, u64) + 'static,
    {
        let token = self
            .registry
            .register(PollEvent::Timer(TimerEvent::new(Rc::new(on_fire))), PollMode::ReadOnly)?;
        Ok(token)
    }

    /// Fire `duration` from now, and every `duration` after if `repeat`.
    /// A zero duration disarms the timer.
    pub fn set_timer(&mut self, timer: Token, duration: Duration, repeat: bool) -> Result<()> {
        self.registry.arm_timer(timer, duration, repeat, Instant::now())?;
        Ok(())
    }

    /// Add a counter whose handle may be incremented from any thread.
    pub fn add_counter<F>(&mut self, on_fire: F) -> CounterHandle
    where
        F: Fn(&mut EventLoop, Token, u64) + 'static,
    {
        self.registry.add_counter(Rc::new(on_fire))
    }

    /// Close an event normally. Returns `false` if it was not registered.
    pub fn close_event(&mut self, token: Token) -> bool {
        if token == self.unblock_token {
            tracing::warn!("Refusing to close the unblock counter");
            return false;
        }
        let Some(mut event) = self.registry.unregister(token) else {
            return false;
        };
        self.release_peer(token, &event);
        event.close();
        tracing::debug!("{} closed", event.label());
        true
    }

    /// Close an event after a failure and notify its owner: a connection's
    /// disconnection callback or an outbound attempt's failure callback.
    ///
    /// Returns `false` if the event was not registered.
    pub fn close_unexpectedly(&mut self, token: Token, reason: &str) -> bool {
        let Some(mut event) = self.registry.unregister(token) else {
            return false;
        };
        self.release_peer(token, &event);
        event.close();
        let label = event.label();

        match &event {
            PollEvent::Connection(connection) => {
                tracing::warn!("{} closed unexpectedly: {}", label, reason);
                if let Some(on_disconnection) = connection.on_disconnection() {
                    on_disconnection(self, connection.peer_id(), reason);
                }
            }
            PollEvent::Outbound(outbound) => {
                tracing::warn!("{} failed: {}", label, reason);
                let on_failed = outbound.on_failed();
                on_failed(self, outbound.peer_address(), reason);
            }
            PollEvent::Inbound(_) => {
                tracing::warn!("{} handshake failed: {}", label, reason);
            }
            PollEvent::Listener(_) | PollEvent::Counter(_) | PollEvent::Timer(_) => {
                tracing::error!("{} closed unexpectedly: {}", label, reason);
            }
        }
        true
    }

    fn release_peer(&mut self, token: Token, event: &PollEvent) {
        if let PollEvent::Connection(connection) = event {
            if let Some(state) = self.peers.get_mut(&connection.peer_id()) {
                if state.assigned_event() == Some(token) {
                    state.unassign_event();
                }
            }
        }
    }

    /// Close every registered event. Peers keep their pending requests.
    pub fn close_all(&mut self) {
        let closed = self.registry.close_all();
        for state in self.peers.values_mut() {
            state.unassign_event();
        }
        tracing::debug!("Closed {} events", closed);
    }

    // ---- requests ----

    /// Send a request that expects a response.
    ///
    /// The request is queued as pending before it is written. If the peer
    /// has no live connection the write is deferred: the request stays
    /// pending and is re-sent when the peer connects again.
    ///
    /// Returns the allocated request number.
    pub fn send_request(
        &mut self,
        peer_id: PeerId,
        protocol: ProtocolId,
        fields: &[Value],
        local_context: LocalContext,
    ) -> Result<u32> {
        let entry = self
            .protocols
            .get(protocol)
            .ok_or(ProtocolDefinitionError::UnknownProtocol(protocol.get()))?;
        entry.request_format().check(fields)?;
        let state = self.peers.get_mut(&peer_id).ok_or(NodeError::UnknownPeer(peer_id))?;

        let request_number = state.get_request_number();
        let packed = entry.pack_request(request_number, fields)?;
        state.push_pending(PendingRequest::new(packed.clone(), request_number, local_context));

        if let Err(e) = state.write_data(&mut self.registry, &packed) {
            tracing::debug!(
                "{}; request {} (protocol {}) deferred until reconnect",
                e,
                request_number,
                protocol
            );
        }
        Ok(request_number)
    }

    /// Send a fire-and-forget request (request number 0).
    ///
    /// Nothing is queued; if the peer has no live connection the request is
    /// dropped with a debug log.
    pub fn send_request_no_response(
        &mut self,
        peer_id: PeerId,
        protocol: ProtocolId,
        fields: &[Value],
    ) -> Result<()> {
        let entry = self
            .protocols
            .get(protocol)
            .ok_or(ProtocolDefinitionError::UnknownProtocol(protocol.get()))?;
        let state = self.peers.get(&peer_id).ok_or(NodeError::UnknownPeer(peer_id))?;
        let packed = entry.pack_request(FIRE_AND_FORGET, fields)?;

        if let Err(e) = state.write_data(&mut self.registry, &packed) {
            tracing::debug!("{}; fire-and-forget protocol {} dropped", e, protocol);
        }
        Ok(())
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("node_name", &self.config.node_name)
            .field("node_id", &self.node_id)
            .field("node_type", &self.node_type)
            .field("events", &self.registry.len())
            .field("peers", &self.peers.len())
            .field("interrupted", &self.is_interrupted())
            .finish()
    }
}
