//! Limit vectors and the limit policy consumed by the manager.
//!
//! A [`Limit`] caps each accounting dimension independently. The manager asks
//! a [`Limiter`] for the limit of a scope exactly once, when the scope is
//! created; limits are immutable afterwards.
//!
//! [`FixedLimiter`] is the baseline policy: fixed defaults per scope kind
//! with optional per-service, per-protocol, and per-peer overrides. It is a
//! plain serde-backed value, so a deployment can load it from configuration.
//!
//! # Example
//!
//! ```rust
//! use tollgate::{FixedLimiter, Limit, Limiter, PeerId};
//!
//! let limiter = FixedLimiter::unlimited()
//!     .with_default_peer_limit(Limit::unlimited().with_memory(64 << 20))
//!     .with_peer_limit(PeerId::from("relay-1"), Limit::unlimited());
//!
//! assert_eq!(limiter.peer_limits(&PeerId::from("other")).memory, 64 << 20);
//! assert_eq!(limiter.peer_limits(&PeerId::from("relay-1")).memory, u64::MAX);
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{PeerId, ProtocolId, ServiceName};

/// Per-dimension upper bounds for one scope.
///
/// A missing field in a serialized limit means "unlimited" for that
/// dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limit {
    /// Memory cap, in bytes.
    pub memory: u64,
    /// Cap on inbound connections.
    pub conns_inbound: u64,
    /// Cap on outbound connections.
    pub conns_outbound: u64,
    /// Cap on inbound streams.
    pub streams_inbound: u64,
    /// Cap on outbound streams.
    pub streams_outbound: u64,
    /// Cap on file descriptors.
    pub fd: u64,
}

impl Limit {
    /// A limit that admits everything.
    #[must_use]
    pub const fn unlimited() -> Self {
        Self {
            memory: u64::MAX,
            conns_inbound: u64::MAX,
            conns_outbound: u64::MAX,
            streams_inbound: u64::MAX,
            streams_outbound: u64::MAX,
            fd: u64::MAX,
        }
    }

    /// A limit that admits nothing.
    #[must_use]
    pub const fn zero() -> Self {
        Self {
            memory: 0,
            conns_inbound: 0,
            conns_outbound: 0,
            streams_inbound: 0,
            streams_outbound: 0,
            fd: 0,
        }
    }

    /// Sets the memory cap.
    #[must_use]
    pub const fn with_memory(mut self, memory: u64) -> Self {
        self.memory = memory;
        self
    }

    /// Sets the inbound and outbound connection caps.
    #[must_use]
    pub const fn with_conns(mut self, inbound: u64, outbound: u64) -> Self {
        self.conns_inbound = inbound;
        self.conns_outbound = outbound;
        self
    }

    /// Sets the inbound and outbound stream caps.
    #[must_use]
    pub const fn with_streams(mut self, inbound: u64, outbound: u64) -> Self {
        self.streams_inbound = inbound;
        self.streams_outbound = outbound;
        self
    }

    /// Sets the file descriptor cap.
    #[must_use]
    pub const fn with_fd(mut self, fd: u64) -> Self {
        self.fd = fd;
        self
    }
}

impl Default for Limit {
    fn default() -> Self {
        Self::unlimited()
    }
}

/// The limit policy consumed by the resource manager.
///
/// Each method is queried exactly once per scope creation; the returned
/// limit is fixed for the lifetime of that scope.
pub trait Limiter: Send + Sync {
    /// Limit for the singleton system scope.
    fn system_limits(&self) -> Limit;

    /// Limit for the singleton transient scope.
    fn transient_limits(&self) -> Limit;

    /// Limit for the scope of the named service.
    fn service_limits(&self, svc: &ServiceName) -> Limit;

    /// Limit for the scope of the given protocol.
    fn protocol_limits(&self, proto: &ProtocolId) -> Limit;

    /// Limit for the scope of the given peer.
    fn peer_limits(&self, peer: &PeerId) -> Limit;

    /// Limit for a single connection scope.
    fn conn_limits(&self) -> Limit;

    /// Limit for a single stream scope opened to the given peer.
    fn stream_limits(&self, peer: &PeerId) -> Limit;
}

/// A fixed limit policy with per-key overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixedLimiter {
    /// Limit for the system scope.
    pub system: Limit,
    /// Limit for the transient scope.
    pub transient: Limit,
    /// Default limit for service scopes without an override.
    pub default_service: Limit,
    /// Default limit for protocol scopes without an override.
    pub default_protocol: Limit,
    /// Default limit for peer scopes without an override.
    pub default_peer: Limit,
    /// Limit for each connection scope.
    pub conn: Limit,
    /// Limit for each stream scope.
    pub stream: Limit,
    /// Per-service overrides.
    pub service: HashMap<ServiceName, Limit>,
    /// Per-protocol overrides.
    pub protocol: HashMap<ProtocolId, Limit>,
    /// Per-peer overrides.
    pub peer: HashMap<PeerId, Limit>,
}

impl FixedLimiter {
    /// A policy that admits everything everywhere.
    #[must_use]
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Sets the system scope limit.
    #[must_use]
    pub fn with_system_limit(mut self, limit: Limit) -> Self {
        self.system = limit;
        self
    }

    /// Sets the transient scope limit.
    #[must_use]
    pub fn with_transient_limit(mut self, limit: Limit) -> Self {
        self.transient = limit;
        self
    }

    /// Sets the default limit for service scopes.
    #[must_use]
    pub fn with_default_service_limit(mut self, limit: Limit) -> Self {
        self.default_service = limit;
        self
    }

    /// Sets the default limit for protocol scopes.
    #[must_use]
    pub fn with_default_protocol_limit(mut self, limit: Limit) -> Self {
        self.default_protocol = limit;
        self
    }

    /// Sets the default limit for peer scopes.
    #[must_use]
    pub fn with_default_peer_limit(mut self, limit: Limit) -> Self {
        self.default_peer = limit;
        self
    }

    /// Sets the limit applied to every connection scope.
    #[must_use]
    pub fn with_conn_limit(mut self, limit: Limit) -> Self {
        self.conn = limit;
        self
    }

    /// Sets the limit applied to every stream scope.
    #[must_use]
    pub fn with_stream_limit(mut self, limit: Limit) -> Self {
        self.stream = limit;
        self
    }

    /// Overrides the limit for one service.
    #[must_use]
    pub fn with_service_limit(mut self, svc: impl Into<ServiceName>, limit: Limit) -> Self {
        self.service.insert(svc.into(), limit);
        self
    }

    /// Overrides the limit for one protocol.
    #[must_use]
    pub fn with_protocol_limit(mut self, proto: impl Into<ProtocolId>, limit: Limit) -> Self {
        self.protocol.insert(proto.into(), limit);
        self
    }

    /// Overrides the limit for one peer.
    #[must_use]
    pub fn with_peer_limit(mut self, peer: impl Into<PeerId>, limit: Limit) -> Self {
        self.peer.insert(peer.into(), limit);
        self
    }
}

impl Limiter for FixedLimiter {
    fn system_limits(&self) -> Limit {
        self.system
    }

    fn transient_limits(&self) -> Limit {
        self.transient
    }

    fn service_limits(&self, svc: &ServiceName) -> Limit {
        self.service.get(svc).copied().unwrap_or(self.default_service)
    }

    fn protocol_limits(&self, proto: &ProtocolId) -> Limit {
        self.protocol
            .get(proto)
            .copied()
            .unwrap_or(self.default_protocol)
    }

    fn peer_limits(&self, peer: &PeerId) -> Limit {
        self.peer.get(peer).copied().unwrap_or(self.default_peer)
    }

    fn conn_limits(&self) -> Limit {
        self.conn
    }

    fn stream_limits(&self, _peer: &PeerId) -> Limit {
        self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_builders_compose() {
        let limit = Limit::unlimited()
            .with_memory(1024)
            .with_conns(4, 8)
            .with_streams(16, 32)
            .with_fd(2);

        assert_eq!(limit.memory, 1024);
        assert_eq!(limit.conns_inbound, 4);
        assert_eq!(limit.conns_outbound, 8);
        assert_eq!(limit.streams_inbound, 16);
        assert_eq!(limit.streams_outbound, 32);
        assert_eq!(limit.fd, 2);
    }

    #[test]
    fn missing_fields_deserialize_as_unlimited() {
        let limit: Limit = serde_json::from_str(r#"{"memory": 4096}"#).unwrap();
        assert_eq!(limit.memory, 4096);
        assert_eq!(limit.conns_inbound, u64::MAX);
        assert_eq!(limit.fd, u64::MAX);
    }

    #[test]
    fn overrides_shadow_defaults() {
        let limiter = FixedLimiter::unlimited()
            .with_default_peer_limit(Limit::unlimited().with_memory(100))
            .with_peer_limit("special", Limit::unlimited().with_memory(500));

        assert_eq!(limiter.peer_limits(&PeerId::from("anyone")).memory, 100);
        assert_eq!(limiter.peer_limits(&PeerId::from("special")).memory, 500);
    }

    #[test]
    fn limiter_config_round_trips() {
        let limiter = FixedLimiter::unlimited()
            .with_system_limit(Limit::unlimited().with_memory(1 << 30))
            .with_service_limit("sync", Limit::unlimited().with_streams(64, 64));

        let json = serde_json::to_string(&limiter).unwrap();
        let back: FixedLimiter = serde_json::from_str(&json).unwrap();
        assert_eq!(limiter, back);
    }
}
