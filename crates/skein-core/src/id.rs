//! Identity types for the mesh
//!
//! Node names are process-unique strings chosen by the operator. Peer links are
//! keyed by a structured (host, port) pair rather than a concatenated string so
//! that `("1.2.3.4", 56)` and `("1.2.3.45", 6)` never collide.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Node identity - the name a node stamps into envelopes it has processed
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeName(String);

impl NodeName {
    pub fn new(name: impl Into<String>) -> Self {
        NodeName(name.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for NodeName {
    fn from(name: &str) -> Self {
        NodeName(name.to_string())
    }
}

impl From<String> for NodeName {
    fn from(name: String) -> Self {
        NodeName(name)
    }
}

impl fmt::Debug for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node({})", self.0)
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Channel identity - arbitrary string naming an append-only record stream
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelName(String);

impl ChannelName {
    pub fn new(name: impl Into<String>) -> Self {
        ChannelName(name.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ChannelName {
    fn from(name: &str) -> Self {
        ChannelName(name.to_string())
    }
}

impl From<String> for ChannelName {
    fn from(name: String) -> Self {
        ChannelName(name)
    }
}

impl fmt::Debug for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Channel({})", self.0)
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Registry key for an outbound peer link
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct PeerKey {
    pub host: String,
    pub port: u16,
}

impl PeerKey {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        PeerKey {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_peer_key_no_concat_collision() {
        let a = PeerKey::new("1.2.3.4", 56);
        let b = PeerKey::new("1.2.3.45", 6);
        assert_ne!(a, b);

        let mut map = HashMap::new();
        map.insert(a.clone(), 1);
        map.insert(b.clone(), 2);
        assert_eq!(map.len(), 2);
        assert_eq!(map[&a], 1);
    }

    #[test]
    fn test_peer_key_display() {
        assert_eq!(PeerKey::new("localhost", 8000).to_string(), "localhost:8000");
        assert_eq!(PeerKey::new("::1", 8000).to_string(), "[::1]:8000");
    }

    #[test]
    fn test_node_name_serializes_as_string() {
        let name = NodeName::from("alpha");
        assert_eq!(serde_json::to_string(&name).unwrap(), "\"alpha\"");
    }
}
