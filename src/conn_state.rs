//! Per-peer bookkeeping that outlives any single socket.
//!
//! A [`ConnectionState`] holds the peer's identity, the FIFO of requests
//! still waiting for a response, and the token of the live connection (if
//! any). It survives disconnects so that requests issued while the peer is
//! away, or responses expected across a reconnect, have a home.

use std::collections::VecDeque;
use std::fmt;
use std::net::IpAddr;

use bytes::Bytes;
use mio::Token;

use crate::error::NoConnectionError;
use crate::protocol::LocalContext;
use crate::registry::EventRegistry;

/// Node id of a peer.
pub type PeerId = u32;

/// A request that was sent (or queued) and still expects a response.
pub struct PendingRequest {
    packed: Bytes,
    request_number: u32,
    local_context: LocalContext,
}

impl PendingRequest {
    pub fn new(packed: Bytes, request_number: u32, local_context: LocalContext) -> Self {
        Self {
            packed,
            request_number,
            local_context,
        }
    }

    /// The complete packed message, as written to the wire.
    #[inline]
    pub fn packed(&self) -> &Bytes {
        &self.packed
    }

    #[inline]
    pub fn request_number(&self) -> u32 {
        self.request_number
    }

    /// Protocol id read back from the packed envelope.
    pub fn protocol_id(&self) -> u16 {
        match self.packed.get(6..8) {
            Some(&[hi, lo]) => u16::from_be_bytes([hi, lo]),
            _ => 0,
        }
    }

    pub fn into_local_context(self) -> LocalContext {
        self.local_context
    }
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("request_number", &self.request_number)
            .field("protocol_id", &self.protocol_id())
            .field("len", &self.packed.len())
            .field("has_local_context", &self.local_context.is_some())
            .finish()
    }
}

/// Identity and pending-request state of one peer.
#[derive(Debug)]
pub struct ConnectionState {
    peer_id: PeerId,
    peer_type: u16,
    peer_address: IpAddr,
    pending_requests: VecDeque<PendingRequest>,
    connection_count: u32,
    assigned_event: Option<Token>,
    next_request_number: u32,
}

impl ConnectionState {
    pub fn new(peer_id: PeerId, peer_type: u16, peer_address: IpAddr) -> Self {
        Self {
            peer_id,
            peer_type,
            peer_address,
            pending_requests: VecDeque::new(),
            connection_count: 0,
            assigned_event: None,
            next_request_number: 1,
        }
    }

    #[inline]
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    #[inline]
    pub fn peer_type(&self) -> u16 {
        self.peer_type
    }

    pub fn set_peer_type(&mut self, peer_type: u16) {
        self.peer_type = peer_type;
    }

    #[inline]
    pub fn peer_address(&self) -> IpAddr {
        self.peer_address
    }

    /// Update the address, e.g. when the peer reconnects from elsewhere.
    pub fn set_peer_address(&mut self, address: IpAddr) {
        self.peer_address = address;
    }

    /// Number of completed handshakes with this peer.
    #[inline]
    pub fn connection_count(&self) -> u32 {
        self.connection_count
    }

    /// Allocate the next request number. Never returns 0.
    pub fn get_request_number(&mut self) -> u32 {
        let request_number = self.next_request_number;
        self.next_request_number = match self.next_request_number.wrapping_add(1) {
            0 => 1,
            next => next,
        };
        request_number
    }

    /// Attach a live connection; returns the one it replaced, if any.
    pub fn assign_event(&mut self, token: Token) -> Option<Token> {
        self.connection_count = self.connection_count.wrapping_add(1);
        self.assigned_event.replace(token)
    }

    /// Detach the live connection. Later writes fail with
    /// [`NoConnectionError`].
    pub fn unassign_event(&mut self) -> Option<Token> {
        self.assigned_event.take()
    }

    #[inline]
    pub fn assigned_event(&self) -> Option<Token> {
        self.assigned_event
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.assigned_event.is_some()
    }

    /// Queue a request that expects a response.
    pub fn push_pending(&mut self, request: PendingRequest) {
        self.pending_requests.push_back(request);
    }

    /// Remove the oldest pending request.
    pub fn pop_pending(&mut self) -> Option<PendingRequest> {
        self.pending_requests.pop_front()
    }

    /// Put a request back at the head of the queue.
    pub(crate) fn restore_pending(&mut self, request: PendingRequest) {
        self.pending_requests.push_front(request);
    }

    pub fn pending_requests(&self) -> impl Iterator<Item = &PendingRequest> {
        self.pending_requests.iter()
    }

    pub fn pending_len(&self) -> usize {
        self.pending_requests.len()
    }

    /// Write bytes to the assigned connection's outbound buffer.
    pub fn write_data(&self, registry: &mut EventRegistry, data: &[u8]) -> Result<(), NoConnectionError> {
        let no_connection = NoConnectionError {
            peer_id: self.peer_id,
        };
        let token = self.assigned_event.ok_or(no_connection)?;
        registry
            .write_to_connection(token, data)
            .map_err(|_| no_connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::net::Ipv4Addr;

    fn state() -> ConnectionState {
        ConnectionState::new(2, 1, IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    #[test]
    fn test_request_numbers_start_at_one() {
        let mut state = state();
        assert_eq!(state.get_request_number(), 1);
        assert_eq!(state.get_request_number(), 2);
        assert_eq!(state.get_request_number(), 3);
    }

    #[test]
    fn test_request_number_wrap_skips_zero() {
        let mut state = state();
        state.next_request_number = u32::MAX;
        assert_eq!(state.get_request_number(), u32::MAX);
        assert_eq!(state.get_request_number(), 1);
    }

    #[test]
    fn test_assign_increments_connection_count() {
        let mut state = state();
        assert!(!state.is_connected());
        assert_eq!(state.assign_event(Token(4)), None);
        assert_eq!(state.connection_count(), 1);
        assert!(state.is_connected());

        assert_eq!(state.unassign_event(), Some(Token(4)));
        assert!(!state.is_connected());
        assert_eq!(state.connection_count(), 1);

        state.assign_event(Token(9));
        assert_eq!(state.connection_count(), 2);
        assert_eq!(state.assigned_event(), Some(Token(9)));
    }

    #[test]
    fn test_write_without_connection_fails() {
        let mut registry = EventRegistry::new().unwrap();
        let state = state();
        let err = state.write_data(&mut registry, b"data").unwrap_err();
        assert_eq!(err, NoConnectionError { peer_id: 2 });
    }

    #[test]
    fn test_write_to_stale_token_fails() {
        let mut registry = EventRegistry::new().unwrap();
        let mut state = state();
        state.assign_event(Token(1234));
        assert!(state.write_data(&mut registry, b"data").is_err());
    }

    #[test]
    fn test_pending_fifo() {
        let mut state = state();
        for n in 1..=3 {
            state.push_pending(PendingRequest::new(Bytes::new(), n, None));
        }
        assert_eq!(state.pending_len(), 3);
        assert_eq!(state.pop_pending().unwrap().request_number(), 1);
        assert_eq!(state.pop_pending().unwrap().request_number(), 2);
        assert_eq!(state.pop_pending().unwrap().request_number(), 3);
        assert!(state.pop_pending().is_none());
    }

    #[test]
    fn test_pending_protocol_id_from_packed() {
        let packed = Bytes::from_static(&[0, 0, 0, 8, 0, 0, 0, 133, 0, 0, 0, 1]);
        let pending = PendingRequest::new(packed, 1, Some(Box::new(5u64)));
        assert_eq!(pending.protocol_id(), 133);
        let context = pending.into_local_context().unwrap();
        assert_eq!(context.downcast_ref::<u64>(), Some(&5));
    }

    proptest! {
        #[test]
        fn prop_request_numbers_monotonic(n in 1usize..2000) {
            let mut state = state();
            let numbers: Vec<u32> = (0..n).map(|_| state.get_request_number()).collect();
            let expected: Vec<u32> = (1..=n as u32).collect();
            prop_assert_eq!(numbers, expected);
        }
    }
}
