//! Routing of received envelopes to protocol handlers.
//!
//! Requests are answered on the connection they arrived on. Responses are
//! matched against the front of the peer's pending queue; the queue is FIFO,
//! so an out-of-order response number is a fatal error for that connection.

use mio::Token;

use super::EventLoop;
use crate::conn_state::PeerId;
use crate::error::{HandlerNotAssignedError, NetworkRequestError, PeerResponseError};
use crate::protocol::{build_nack, Category, Envelope, LocalContext, FIRE_AND_FORGET};

/// Why one envelope could not be handled.
pub(crate) enum DispatchError {
    /// A request could not be served. NACK-able.
    Request(NetworkRequestError),
    /// The stream can no longer be trusted; the connection closes.
    Fatal(NetworkRequestError),
    /// No handler is assigned; only this message is dropped.
    NotAssigned(HandlerNotAssignedError),
    /// The peer answered with a NACK.
    Rejected(PeerResponseError, LocalContext),
}

impl EventLoop {
    pub(crate) fn dispatch_envelopes(&mut self, token: Token, peer_id: PeerId, envelopes: Vec<Envelope>) {
        for envelope in envelopes {
            // A handler may have closed this connection.
            if !self.registry.contains(token) {
                tracing::debug!(
                    "[connection peer={}] closed mid-batch, dropping remaining envelopes",
                    peer_id
                );
                return;
            }
            let request_number = envelope.request_number();
            let is_request = envelope.category() == Some(Category::Request);

            match self.dispatch_envelope(token, peer_id, envelope) {
                Ok(()) => {}
                Err(DispatchError::NotAssigned(err)) => {
                    tracing::warn!("[connection peer={}] {}", peer_id, err);
                    if is_request && request_number != FIRE_AND_FORGET {
                        self.write_nack(token, peer_id, request_number);
                    }
                }
                Err(DispatchError::Request(err)) => {
                    if self.nacks_request_errors(token) {
                        tracing::warn!("[connection peer={}] {}; answering with NACK", peer_id, err);
                        if request_number != FIRE_AND_FORGET {
                            self.write_nack(token, peer_id, request_number);
                        }
                    } else {
                        self.close_unexpectedly(token, &err.to_string());
                        return;
                    }
                }
                Err(DispatchError::Fatal(err)) => {
                    self.close_unexpectedly(token, &err.to_string());
                    return;
                }
                Err(DispatchError::Rejected(err, local_context)) => {
                    tracing::warn!("[connection peer={}] {}", peer_id, err);
                    if let Some(handler) = self.nack_handler.clone() {
                        handler(self, err, local_context);
                    }
                }
            }
        }
    }

    fn dispatch_envelope(
        &mut self,
        token: Token,
        peer_id: PeerId,
        envelope: Envelope,
    ) -> Result<(), DispatchError> {
        match envelope.category() {
            Some(Category::Request) => self.dispatch_request(token, peer_id, envelope),
            Some(Category::Response) => self.dispatch_response(peer_id, envelope),
            None => Err(DispatchError::Fatal(NetworkRequestError::new(
                envelope.request_number(),
                format!("unknown category {}", envelope.header.category),
            ))),
        }
    }

    fn dispatch_request(
        &mut self,
        token: Token,
        peer_id: PeerId,
        envelope: Envelope,
    ) -> Result<(), DispatchError> {
        let request_number = envelope.request_number();
        let protocol_id = envelope.protocol_id();
        let request_error =
            |message: String| DispatchError::Request(NetworkRequestError::new(request_number, message));

        let entry = self
            .protocols
            .lookup(protocol_id)
            .ok_or_else(|| request_error(format!("unknown protocol {}", protocol_id)))?;
        let fields = entry
            .unpack_request(envelope.payload())
            .map_err(|e| request_error(format!("protocol {}: {}", protocol_id, e)))?;
        let handler = entry.request_handler().ok_or(DispatchError::NotAssigned(
            HandlerNotAssignedError {
                protocol_id,
                request_number,
                category: Category::Request,
            },
        ))?;

        tracing::trace!(
            "[connection peer={}] request {} for protocol {}",
            peer_id,
            request_number,
            protocol_id
        );
        let values = handler(self, peer_id, &fields).map_err(|e| {
            request_error(format!("handler for protocol {} failed: {}", protocol_id, e))
        })?;

        if request_number == FIRE_AND_FORGET {
            return Ok(());
        }
        let entry = self
            .protocols
            .lookup(protocol_id)
            .ok_or_else(|| request_error(format!("protocol {} was removed", protocol_id)))?;
        // A direction without payload packs to a bare envelope; handler
        // values are ignored.
        let packed = entry
            .pack_response(request_number, &values)
            .map_err(|e| request_error(format!("response for protocol {}: {}", protocol_id, e)))?;
        if let Err(e) = self.registry.write_to_connection(token, &packed) {
            tracing::debug!(
                "[connection peer={}] response {} not written: {}",
                peer_id,
                request_number,
                e
            );
        }
        Ok(())
    }

    fn dispatch_response(&mut self, peer_id: PeerId, envelope: Envelope) -> Result<(), DispatchError> {
        let request_number = envelope.request_number();
        let protocol_id = envelope.protocol_id();
        let fatal =
            |message: String| DispatchError::Fatal(NetworkRequestError::new(request_number, message));

        if request_number == FIRE_AND_FORGET {
            tracing::debug!(
                "[connection peer={}] dropping response to fire-and-forget request (protocol {})",
                peer_id,
                protocol_id
            );
            return Ok(());
        }

        let state = self
            .peers
            .get_mut(&peer_id)
            .ok_or_else(|| fatal(format!("no state for peer {}", peer_id)))?;
        let pending = state
            .pop_pending()
            .ok_or_else(|| fatal("response without a pending request".to_string()))?;
        if pending.request_number() != request_number {
            let expected = pending.request_number();
            state.restore_pending(pending);
            return Err(fatal(format!("expected response to request {}", expected)));
        }

        if envelope.is_nack() {
            let err = PeerResponseError {
                peer_id,
                request_number,
                protocol_id: pending.protocol_id(),
            };
            return Err(DispatchError::Rejected(err, pending.into_local_context()));
        }
        if pending.protocol_id() != protocol_id {
            return Err(fatal(format!(
                "response carries protocol {}, request was protocol {}",
                protocol_id,
                pending.protocol_id()
            )));
        }

        let entry = self
            .protocols
            .lookup(protocol_id)
            .ok_or_else(|| fatal(format!("unknown protocol {}", protocol_id)))?;
        let fields = entry
            .unpack_response(envelope.payload())
            .map_err(|e| fatal(format!("protocol {}: {}", protocol_id, e)))?;
        let handler = match entry.response_handler() {
            Some(handler) => handler,
            None if !entry.response_format().has_payload() => return Ok(()),
            None => {
                return Err(DispatchError::NotAssigned(HandlerNotAssignedError {
                    protocol_id,
                    request_number,
                    category: Category::Response,
                }))
            }
        };

        handler(self, peer_id, pending.into_local_context(), &fields).map_err(|e| {
            fatal(format!("response handler for protocol {} failed: {}", protocol_id, e))
        })
    }

    fn nacks_request_errors(&self, token: Token) -> bool {
        match self.registry.get(token) {
            Some(crate::event::PollEvent::Connection(connection)) => {
                connection.options().nack_on_request_error
            }
            _ => false,
        }
    }

    fn write_nack(&mut self, token: Token, peer_id: PeerId, request_number: u32) {
        if let Err(e) = self.registry.write_to_connection(token, &build_nack(request_number)) {
            tracing::debug!(
                "[connection peer={}] NACK for request {} not written: {}",
                peer_id,
                request_number,
                e
            );
        }
    }
}
