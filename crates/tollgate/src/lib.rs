//! # tollgate
//!
//! Hierarchical resource accounting for peer-to-peer network stacks.
//!
//! A [`ResourceManager`] bounds the consumption of memory, connections,
//! streams, and file descriptors along several orthogonal axes at once:
//! globally, for not-yet-attributed activity, per service, per protocol,
//! per peer, and per individual connection or stream. A reservation is
//! admitted only if it fits within *every* relevant limit, and is released
//! from every axis it was charged to.
//!
//! ## Core concepts
//!
//! - **Scope**: a node in the accounting hierarchy carrying a limit and a
//!   usage counter; every reservation walks a chain of scopes.
//! - **Constraint list**: the ordered parents a scope's reservations must
//!   additionally fit within. Admission is all-or-nothing with rollback.
//! - **Edge migration**: a connection is first charged to the transient
//!   scope and re-parented onto its peer scope once the remote identity is
//!   known ([`ConnectionScope::set_peer`]); streams migrate onto protocol
//!   and service scopes the same way. The charge is never double-counted
//!   and never lost.
//! - **Reclamation**: a background worker retires peer and protocol scopes
//!   that hold no references and no charge.
//!
//! ## Example
//!
//! ```rust
//! use tollgate::{Direction, FixedLimiter, Limit, PeerId, ResourceManager, Scope};
//!
//! let limiter = FixedLimiter::unlimited()
//!     .with_system_limit(Limit::unlimited().with_memory(256 << 20))
//!     .with_default_peer_limit(Limit::unlimited().with_streams(64, 64));
//! let mgr = ResourceManager::new(limiter);
//!
//! let stream = mgr.open_stream(&PeerId::from("peer-1"), Direction::Outbound)?;
//! stream.reserve_memory(16 << 10)?;
//! stream.set_protocol(&"/sync/1.0.0".into())?;
//! stream.done();
//!
//! mgr.close();
//! # Ok::<(), tollgate::ResourceError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod counter;
pub mod error;
pub mod limit;
pub mod manager;
pub mod scope;
pub mod scopes;
pub mod types;

#[cfg(test)]
mod proptest_counter;

pub use counter::{Dimension, ResourceStat};
pub use error::ResourceError;
pub use limit::{FixedLimiter, Limit, Limiter};
pub use manager::{ResourceManager, ResourceManagerConfig};
pub use scope::{ResourceScope, Scope, SpanScope};
pub use scopes::{
    ConnectionScope, PeerScope, ProtocolScope, ServiceScope, StreamScope, SystemScope,
    TransientScope,
};
pub use types::{Direction, PeerId, ProtocolId, ScopeName, ServiceName};
