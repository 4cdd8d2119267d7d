//! Node configuration.
//!
//! Loaded from JSON or built in code:
//!
//! ```
//! use emews_net::NodeConfig;
//!
//! let config = NodeConfig::from_json_str(
//!     r#"{ "node_name": "host-a", "peers": [{ "address": "127.0.0.1", "port": 32000 }] }"#,
//! )
//! .unwrap();
//! assert_eq!(config.node_name, "host-a");
//! assert_eq!(config.peers[0].port, 32000);
//! assert!(config.handle_signals);
//! ```

use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{NodeError, Result};
use crate::protocol::{DEFAULT_MAX_MESSAGE_SIZE, ENVELOPE_HEADER_SIZE};

/// Default number of readiness events fetched per poll.
pub const DEFAULT_EVENTS_CAPACITY: usize = 1024;

/// Address of a node to connect to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub address: IpAddr,
    pub port: u16,
}

impl PeerConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

/// Configuration consumed by [`EventLoop`](crate::EventLoop).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Name announced to peers in the handshake.
    pub node_name: String,
    /// Port to listen on, if this node accepts connections.
    pub listen_port: Option<u16>,
    /// Nodes to connect to at start.
    pub peers: Vec<PeerConfig>,
    /// Largest envelope accepted from a peer.
    pub max_message_size: u32,
    /// Readiness events fetched per poll.
    pub events_capacity: usize,
    /// Stop on SIGHUP, SIGTERM and SIGINT while running.
    pub handle_signals: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_name: "emews-node".to_string(),
            listen_port: None,
            peers: Vec::new(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            events_capacity: DEFAULT_EVENTS_CAPACITY,
            handle_signals: true,
        }
    }
}

impl NodeConfig {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            ..Self::default()
        }
    }

    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.listen_port = Some(port);
        self
    }

    pub fn with_peer(mut self, address: IpAddr, port: u16) -> Self {
        self.peers.push(PeerConfig { address, port });
        self
    }

    pub fn with_max_message_size(mut self, max_message_size: u32) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    pub fn with_events_capacity(mut self, events_capacity: usize) -> Self {
        self.events_capacity = events_capacity;
        self
    }

    pub fn with_signal_handling(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_name.is_empty() {
            return Err(NodeError::Config("node_name must not be empty".into()));
        }
        if (self.max_message_size as usize) < ENVELOPE_HEADER_SIZE {
            return Err(NodeError::Config(format!(
                "max_message_size {} is smaller than the envelope header",
                self.max_message_size
            )));
        }
        if self.events_capacity == 0 {
            return Err(NodeError::Config("events_capacity must be at least 1".into()));
        }
        if let Some(peer) = self.peers.iter().find(|p| p.port == 0) {
            return Err(NodeError::Config(format!("peer {} has port 0", peer.address)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config = NodeConfig::from_json_str(r#"{ "listen_port": 32000 }"#).unwrap();
        assert_eq!(config.listen_port, Some(32000));
        assert_eq!(config.node_name, "emews-node");
        assert_eq!(config.max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
        assert_eq!(config.events_capacity, DEFAULT_EVENTS_CAPACITY);
        assert!(config.peers.is_empty());
    }

    #[test]
    fn test_builder() {
        let config = NodeConfig::new("hub")
            .with_listen_port(0)
            .with_peer(IpAddr::V4(Ipv4Addr::LOCALHOST), 32001)
            .with_signal_handling(false);
        assert_eq!(config.node_name, "hub");
        assert_eq!(
            config.peers[0].socket_addr(),
            SocketAddr::from(([127, 0, 0, 1], 32001))
        );
        assert!(!config.handle_signals);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_errors() {
        let err = NodeConfig::new("").validate().unwrap_err();
        assert!(matches!(err, NodeError::Config(_)));

        let err = NodeConfig::new("a").with_max_message_size(4).validate().unwrap_err();
        assert!(err.to_string().contains("max_message_size"));

        let err = NodeConfig::new("a")
            .with_peer(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("port 0"));
    }

    #[test]
    fn test_invalid_json() {
        let err = NodeConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, NodeError::Json(_)));
    }

    #[test]
    fn test_from_missing_file() {
        let err = NodeConfig::from_file("/nonexistent/emews-node.json").unwrap_err();
        assert!(matches!(err, NodeError::Io(_)));
    }
}
