//! Protocol table: protocol id to wire formats plus handler slots.
//!
//! The table is built once at startup and handed to the
//! [`EventLoop`](crate::EventLoop), which owns it from then on. Entries are
//! keyed by [`ProtocolId`], which cannot hold the reserved NACK id.
//!
//! # Example
//!
//! ```
//! use emews_net::protocol::{ProtocolId, ProtocolTable, Value};
//!
//! let ask = ProtocolId::new(133).unwrap();
//! let mut table = ProtocolTable::new();
//! table.define(ask, Some("LH"), Some("s")).unwrap();
//! table
//!     .set_request_handler(ask, |_node, _peer, fields| {
//!         let key = fields[1].as_u16().unwrap_or_default();
//!         Ok(vec![Value::from(format!("value-{key}"))])
//!     })
//!     .unwrap();
//! assert!(table.get(ask).unwrap().request_handler().is_some());
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use bytes::Bytes;

use super::field::{FieldType, Value};
use super::wire_format::{Category, WireFormat, NACK_PROTOCOL_ID};
use crate::conn_state::PeerId;
use crate::error::{HandlerError, ProtocolDefinitionError, WireError};
use crate::node::EventLoop;

/// Caller-supplied value stored with a pending request and handed back to
/// its response handler.
pub type LocalContext = Option<Box<dyn Any>>;

/// Handles an incoming request; returns the response fields.
pub type RequestHandler =
    Rc<dyn Fn(&mut EventLoop, PeerId, &[Value]) -> Result<Vec<Value>, HandlerError>>;

/// Handles the response to a request this node sent.
pub type ResponseHandler =
    Rc<dyn Fn(&mut EventLoop, PeerId, LocalContext, &[Value]) -> Result<(), HandlerError>>;

/// Identifier of an application protocol. Never 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProtocolId(pub(crate) u16);

impl ProtocolId {
    /// Create a protocol id, rejecting the reserved NACK id.
    pub fn new(id: u16) -> Result<Self, ProtocolDefinitionError> {
        if id == NACK_PROTOCOL_ID {
            return Err(ProtocolDefinitionError::ReservedProtocolId);
        }
        Ok(Self(id))
    }

    #[inline]
    pub const fn get(self) -> u16 {
        self.0
    }
}

impl TryFrom<u16> for ProtocolId {
    type Error = ProtocolDefinitionError;

    fn try_from(id: u16) -> Result<Self, Self::Error> {
        Self::new(id)
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One protocol: both directions plus their handlers.
pub struct ProtocolEntry {
    id: ProtocolId,
    request: WireFormat,
    response: WireFormat,
    request_handler: Option<RequestHandler>,
    response_handler: Option<ResponseHandler>,
}

impl ProtocolEntry {
    fn new(id: ProtocolId, request: Option<Vec<FieldType>>, response: Option<Vec<FieldType>>) -> Self {
        Self {
            id,
            request: WireFormat::new(id.get(), Category::Request, request),
            response: WireFormat::new(id.get(), Category::Response, response),
            request_handler: None,
            response_handler: None,
        }
    }

    #[inline]
    pub fn id(&self) -> ProtocolId {
        self.id
    }

    #[inline]
    pub fn request_format(&self) -> &WireFormat {
        &self.request
    }

    #[inline]
    pub fn response_format(&self) -> &WireFormat {
        &self.response
    }

    /// Request handler, if assigned. Cheap to clone.
    pub fn request_handler(&self) -> Option<RequestHandler> {
        self.request_handler.clone()
    }

    /// Response handler, if assigned. Cheap to clone.
    pub fn response_handler(&self) -> Option<ResponseHandler> {
        self.response_handler.clone()
    }

    pub fn pack_request(&self, request_number: u32, values: &[Value]) -> Result<Bytes, WireError> {
        self.request.pack(request_number, values)
    }

    pub fn pack_response(&self, request_number: u32, values: &[Value]) -> Result<Bytes, WireError> {
        self.response.pack(request_number, values)
    }

    /// Unpack a request payload (envelope header already stripped).
    pub fn unpack_request(&self, payload: &Bytes) -> Result<Vec<Value>, WireError> {
        self.request.unpack(payload, 0)
    }

    /// Unpack a response payload (envelope header already stripped).
    pub fn unpack_response(&self, payload: &Bytes) -> Result<Vec<Value>, WireError> {
        self.response.unpack(payload, 0)
    }
}

impl fmt::Debug for ProtocolEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolEntry")
            .field("id", &self.id)
            .field("request", &self.request.fields())
            .field("response", &self.response.fields())
            .field("request_handler", &self.request_handler.is_some())
            .field("response_handler", &self.response_handler.is_some())
            .finish()
    }
}

/// Mapping from protocol id to its entry.
#[derive(Debug, Default)]
pub struct ProtocolTable {
    entries: HashMap<ProtocolId, ProtocolEntry>,
}

impl ProtocolTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a protocol from field code strings.
    ///
    /// `None` means that direction carries no payload.
    pub fn define(
        &mut self,
        id: ProtocolId,
        request: Option<&str>,
        response: Option<&str>,
    ) -> Result<&mut ProtocolEntry, ProtocolDefinitionError> {
        let request = request.map(FieldType::parse).transpose()?;
        let response = response.map(FieldType::parse).transpose()?;
        self.define_fields(id, request, response)
    }

    /// Declare a protocol from field descriptors.
    pub fn define_fields(
        &mut self,
        id: ProtocolId,
        request: Option<Vec<FieldType>>,
        response: Option<Vec<FieldType>>,
    ) -> Result<&mut ProtocolEntry, ProtocolDefinitionError> {
        use std::collections::hash_map::Entry;

        match self.entries.entry(id) {
            Entry::Occupied(_) => Err(ProtocolDefinitionError::DuplicateProtocol(id.get())),
            Entry::Vacant(slot) => Ok(slot.insert(ProtocolEntry::new(id, request, response))),
        }
    }

    /// Builder form of [`define`](Self::define).
    pub fn with_protocol(
        mut self,
        id: u16,
        request: Option<&str>,
        response: Option<&str>,
    ) -> Result<Self, ProtocolDefinitionError> {
        self.define(ProtocolId::new(id)?, request, response)?;
        Ok(self)
    }

    pub fn get(&self, id: ProtocolId) -> Option<&ProtocolEntry> {
        self.entries.get(&id)
    }

    /// Look up a raw id as read off the wire.
    pub fn lookup(&self, id: u16) -> Option<&ProtocolEntry> {
        ProtocolId::new(id).ok().and_then(|id| self.entries.get(&id))
    }

    fn entry_mut(&mut self, id: ProtocolId) -> Result<&mut ProtocolEntry, ProtocolDefinitionError> {
        self.entries
            .get_mut(&id)
            .ok_or(ProtocolDefinitionError::UnknownProtocol(id.get()))
    }

    /// Assign the request handler of a declared protocol.
    pub fn set_request_handler<F>(&mut self, id: ProtocolId, handler: F) -> Result<(), ProtocolDefinitionError>
    where
        F: Fn(&mut EventLoop, PeerId, &[Value]) -> Result<Vec<Value>, HandlerError> + 'static,
    {
        self.entry_mut(id)?.request_handler = Some(Rc::new(handler));
        Ok(())
    }

    /// Assign the response handler of a declared protocol.
    pub fn set_response_handler<F>(&mut self, id: ProtocolId, handler: F) -> Result<(), ProtocolDefinitionError>
    where
        F: Fn(&mut EventLoop, PeerId, LocalContext, &[Value]) -> Result<(), HandlerError> + 'static,
    {
        self.entry_mut(id)?.response_handler = Some(Rc::new(handler));
        Ok(())
    }

    /// Return a slot to the unassigned state.
    pub fn clear_handlers(&mut self, id: ProtocolId) -> Result<(), ProtocolDefinitionError> {
        let entry = self.entry_mut(id)?;
        entry.request_handler = None;
        entry.response_handler = None;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Declared ids in ascending order.
    pub fn ids(&self) -> Vec<ProtocolId> {
        let mut ids: Vec<_> = self.entries.keys().copied().collect();
        ids.sort();
        ids
    }
}
