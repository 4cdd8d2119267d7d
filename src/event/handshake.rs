//! Node identity exchange performed before a connection carries envelopes.
//!
//! ```text
//! connecting side:  total_len:u32 | node_type:u16 | connection_count:u32 | name
//! accepting side:   node_id:u32 | node_type:u16
//! ```
//!
//! `total_len` counts everything after itself (`6 + len(name)`).

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::PollEventError;

/// Fixed part of the identity payload (node type + connection count).
pub const IDENTITY_HEADER_SIZE: usize = 6;

/// Size of the identity reply.
pub const REPLY_SIZE: usize = 6;

/// Longest node name accepted from a peer.
pub const MAX_NODE_NAME_LEN: usize = 4096;

/// Identity a node announces when it connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub node_type: u16,
    /// How many times this node has connected to the peer before.
    pub connection_count: u32,
    pub name: String,
}

impl Identity {
    /// Encode with the length prefix.
    pub fn encode(&self) -> Bytes {
        let payload_len = IDENTITY_HEADER_SIZE + self.name.len();
        let mut buf = BytesMut::with_capacity(4 + payload_len);
        buf.put_u32(payload_len as u32);
        buf.put_u16(self.node_type);
        buf.put_u32(self.connection_count);
        buf.put_slice(self.name.as_bytes());
        buf.freeze()
    }

    /// Check the announced payload length before reading the payload.
    pub fn validate_length(payload_len: u32) -> Result<usize, PollEventError> {
        let len = payload_len as usize;
        if !(IDENTITY_HEADER_SIZE..=IDENTITY_HEADER_SIZE + MAX_NODE_NAME_LEN).contains(&len) {
            return Err(PollEventError::Malformed(format!(
                "identity length {} outside {}..={}",
                len,
                IDENTITY_HEADER_SIZE,
                IDENTITY_HEADER_SIZE + MAX_NODE_NAME_LEN
            )));
        }
        Ok(len)
    }

    /// Decode the payload that followed the length prefix.
    pub fn decode(mut payload: &[u8]) -> Result<Self, PollEventError> {
        if payload.len() < IDENTITY_HEADER_SIZE {
            return Err(PollEventError::Malformed(format!(
                "identity payload of {} bytes is too short",
                payload.len()
            )));
        }
        let node_type = payload.get_u16();
        let connection_count = payload.get_u32();
        let name = std::str::from_utf8(payload)
            .map_err(|e| PollEventError::Malformed(format!("node name is not UTF-8: {}", e)))?
            .to_string();
        Ok(Self {
            node_type,
            connection_count,
            name,
        })
    }
}

/// Reply to an identity: the id assigned to the connecting node and the
/// accepting node's type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityReply {
    pub node_id: u32,
    pub node_type: u16,
}

impl IdentityReply {
    pub fn encode(&self) -> [u8; REPLY_SIZE] {
        let mut buf = [0u8; REPLY_SIZE];
        buf[0..4].copy_from_slice(&self.node_id.to_be_bytes());
        buf[4..6].copy_from_slice(&self.node_type.to_be_bytes());
        buf
    }

    /// Returns `None` if buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < REPLY_SIZE {
            return None;
        }
        Some(Self {
            node_id: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            node_type: u16::from_be_bytes([buf[4], buf[5]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_layout() {
        let identity = Identity {
            node_type: 1,
            connection_count: 3,
            name: "host-a".to_string(),
        };
        let bytes = identity.encode();
        assert_eq!(&bytes[0..4], &[0, 0, 0, 12]);
        assert_eq!(&bytes[4..6], &[0, 1]);
        assert_eq!(&bytes[6..10], &[0, 0, 0, 3]);
        assert_eq!(&bytes[10..], b"host-a");

        assert_eq!(Identity::decode(&bytes[4..]).unwrap(), identity);
    }

    #[test]
    fn test_identity_name_length_is_byte_length() {
        let identity = Identity {
            node_type: 2,
            connection_count: 0,
            name: "nœud".to_string(),
        };
        let bytes = identity.encode();
        let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        assert_eq!(len, bytes.len() - 4);
        assert_eq!(Identity::decode(&bytes[4..]).unwrap().name, "nœud");
    }

    #[test]
    fn test_identity_length_bounds() {
        assert!(Identity::validate_length(5).is_err());
        assert_eq!(Identity::validate_length(6).unwrap(), 6);
        assert!(Identity::validate_length((IDENTITY_HEADER_SIZE + MAX_NODE_NAME_LEN + 1) as u32).is_err());
    }

    #[test]
    fn test_identity_rejects_invalid_utf8() {
        let payload = [0, 1, 0, 0, 0, 0, 0xFF, 0xFE];
        let err = Identity::decode(&payload).unwrap_err();
        assert!(err.to_string().contains("UTF-8"));
    }

    #[test]
    fn test_reply_roundtrip() {
        let reply = IdentityReply {
            node_id: 7,
            node_type: 0,
        };
        assert_eq!(reply.encode(), [0, 0, 0, 7, 0, 0]);
        assert_eq!(IdentityReply::decode(&reply.encode()), Some(reply));
        assert_eq!(IdentityReply::decode(&[0, 0, 0]), None);
    }
}
