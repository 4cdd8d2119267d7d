//! # emews-net
//!
//! Networking core for emews nodes: a single-threaded, non-blocking event
//! loop with a length-prefixed binary request/response protocol on top.
//!
//! ## Architecture
//!
//! - **Protocol** ([`protocol`]): field codes, per-direction wire formats,
//!   envelopes and the [`ProtocolTable`] of handlers
//! - **Events** ([`event`]): listener, outbound/inbound connecting,
//!   connection, timer and counter state machines
//! - **Event loop** ([`EventLoop`]): poll set, dispatch, request sending
//! - **Peers** ([`ConnectionState`]): pending requests and the live
//!   connection of one peer, kept across reconnects
//!
//! ## Example
//!
//! ```no_run
//! use emews_net::event::ConnectionOptions;
//! use emews_net::protocol::{ProtocolId, ProtocolTable, Value};
//! use emews_net::{EventLoop, NodeConfig, NodeType};
//!
//! let ask = ProtocolId::new(133).unwrap();
//! let mut protocols = ProtocolTable::new();
//! protocols.define(ask, Some("L"), Some("L")).unwrap();
//! protocols
//!     .set_request_handler(ask, |_node, _peer, fields| Ok(vec![fields[0].clone()]))
//!     .unwrap();
//!
//! let mut node = EventLoop::new(NodeConfig::new("hub"), NodeType::Hub, protocols).unwrap();
//! node.add_listener(32000, |node, handshake| {
//!     let peer_id = 2;
//!     node.add_peer(peer_id, handshake.node_type, handshake.peer_address.ip());
//!     if let Err(e) = node.add_connection(
//!         handshake.token,
//!         peer_id,
//!         |_node, peer, reason| eprintln!("peer {peer} left: {reason}"),
//!         ConnectionOptions::default(),
//!     ) {
//!         eprintln!("{e}");
//!     }
//! });
//! node.run().unwrap();
//! ```

pub mod config;
pub mod conn_state;
pub mod error;
pub mod event;
pub mod node;
pub mod protocol;
pub mod registry;
pub mod signal;

pub use config::{NodeConfig, PeerConfig};
pub use conn_state::{ConnectionState, PeerId, PendingRequest};
pub use error::{NodeError, Result};
pub use node::{node_id, EventLoop, NackHandler, NodeHooks, NodeType, StopHandle};
pub use protocol::{ProtocolId, ProtocolTable, Value};
