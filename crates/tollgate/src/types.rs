//! Identity types shared across the accounting hierarchy.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies a remote peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Creates a peer id from its string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string form of the peer id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Identifies a wire protocol, e.g. `/p2p/sync/1.0.0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProtocolId(String);

impl ProtocolId {
    /// Creates a protocol id from its string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string form of the protocol id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProtocolId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Names a logical service, e.g. `"sync"` or `"relay"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceName(String);

impl ServiceName {
    /// Creates a service name from its string form.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the string form of the service name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServiceName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Direction of a connection or stream relative to the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Initiated by the remote end.
    Inbound,
    /// Initiated locally.
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inbound => f.write_str("inbound"),
            Self::Outbound => f.write_str("outbound"),
        }
    }
}

/// Identity of a scope, carried in errors and log events.
///
/// Connection, stream, and span scopes are anonymous; they are named by a
/// process-wide ordinal assigned at creation.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ScopeName {
    /// The singleton system scope.
    System,
    /// The singleton transient scope.
    Transient,
    /// A per-service scope.
    Service(ServiceName),
    /// A per-protocol scope.
    Protocol(ProtocolId),
    /// A per-peer scope.
    Peer(PeerId),
    /// A connection scope.
    Connection(u64),
    /// A stream scope.
    Stream(u64),
    /// A span (transaction) scope.
    Span(u64),
}

impl fmt::Display for ScopeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => f.write_str("system"),
            Self::Transient => f.write_str("transient"),
            Self::Service(name) => write!(f, "service:{name}"),
            Self::Protocol(proto) => write!(f, "protocol:{proto}"),
            Self::Peer(peer) => write!(f, "peer:{peer}"),
            Self::Connection(ord) => write!(f, "conn-{ord}"),
            Self::Stream(ord) => write!(f, "stream-{ord}"),
            Self::Span(ord) => write!(f, "span-{ord}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_name_display() {
        assert_eq!(ScopeName::System.to_string(), "system");
        assert_eq!(ScopeName::Transient.to_string(), "transient");
        assert_eq!(
            ScopeName::Service(ServiceName::from("sync")).to_string(),
            "service:sync"
        );
        assert_eq!(
            ScopeName::Protocol(ProtocolId::from("/p2p/sync/1.0.0")).to_string(),
            "protocol:/p2p/sync/1.0.0"
        );
        assert_eq!(ScopeName::Connection(7).to_string(), "conn-7");
        assert_eq!(ScopeName::Stream(3).to_string(), "stream-3");
    }

    #[test]
    fn direction_serde_round_trip() {
        let json = serde_json::to_string(&Direction::Inbound).unwrap();
        assert_eq!(json, "\"inbound\"");
        let dir: Direction = serde_json::from_str(&json).unwrap();
        assert_eq!(dir, Direction::Inbound);
    }
}
