//! Node ids and node types exchanged during the handshake.

use std::fmt;

/// Well-known node ids.
pub mod node_id {
    /// Id of a node that has not been assigned one yet.
    pub const UNASSIGNED: u32 = 0;
    /// Id of the hub; every other node connects to it first.
    pub const HUB: u32 = 1;
}

/// Role of a node in the deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum NodeType {
    Hub = 0,
    Host = 1,
    HostProcess = 2,
    Monitor = 3,
    Console = 4,
}

impl NodeType {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::Hub),
            1 => Some(Self::Host),
            2 => Some(Self::HostProcess),
            3 => Some(Self::Monitor),
            4 => Some(Self::Console),
            _ => None,
        }
    }

    #[inline]
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Hub => "hub",
            Self::Host => "host",
            Self::HostProcess => "host_process",
            Self::Monitor => "monitor",
            Self::Console => "console",
        }
    }
}

impl From<NodeType> for u16 {
    fn from(node_type: NodeType) -> Self {
        node_type.as_u16()
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_type_codes() {
        for code in 0..5u16 {
            let node_type = NodeType::from_u16(code).unwrap();
            assert_eq!(u16::from(node_type), code);
        }
        assert_eq!(NodeType::from_u16(5), None);
        assert_eq!(NodeType::HostProcess.to_string(), "host_process");
    }
}
